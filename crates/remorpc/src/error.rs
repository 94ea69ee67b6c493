//! # Error Definitions
//!
//! Failures of the wire layer itself. A remote operation that ran and threw is
//! not an `RpcError`; it arrives as an `exception` meta value.

use remopack::Error as PackError;

/// Operational failures while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The underlying byte format rejected the data.
    Serialization(PackError),
    /// An unknown meta type, command or notification name was encountered.
    UnknownVariant(String),
    /// The frame was structurally valid but semantically malformed (e.g. a missing field).
    ProtocolViolation(String),
    /// The value nests deeper than `MAX_DEPTH`.
    RecursionLimitExceeded,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization failed: {}", e),
            Self::UnknownVariant(name) => write!(f, "unknown type: {}", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::RecursionLimitExceeded => write!(f, "value nests deeper than {} levels", crate::MAX_DEPTH),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for RpcError {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, RpcError>;
