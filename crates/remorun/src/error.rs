//! # Error Definitions
//!
//! What a client-side remote operation can fail with. A transport or wire failure
//! is local; `Remote` carries whatever the host-side operation threw.

use remorpc::RpcError;

use crate::transport::TransportError;
use crate::value::Exception;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The request or reply could not be moved.
    Transport(TransportError),
    /// The request or reply could not be encoded or decoded.
    Rpc(RpcError),
    /// The remote operation ran and threw.
    Remote(Exception),
    /// The client context has been released.
    Released,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Rpc(e) => write!(f, "Protocol error: {}", e),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::Released => write!(f, "Remote context has been released"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Rpc(e) => Some(e),
            Self::Remote(e) => Some(e),
            Self::Released => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<Exception> for Error {
    fn from(e: Exception) -> Self {
        Self::Remote(e)
    }
}

impl Error {
    /// Turns the failure into a thrown value, for code running inside a proxy.
    pub fn into_exception(self) -> Exception {
        match self {
            Self::Remote(e) => e,
            other => Exception::error(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
