//! # Transport Abstraction
//!
//! The two primitives the protocol needs from whatever moves bytes between processes.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: Transports move opaque buffers addressed to a channel name.
//!   They know nothing about commands, metas or handles.
//! - **Blocking Requests**: `send_sync` suspends the caller until the reply for that
//!   exact request arrives. There is no timeout; a reply that never comes blocks forever.
//! - **Fire-and-Forget Notifications**: `send` and `send_to_frame` only report whether
//!   the bytes were handed off, never what the receiver did with them.

use std::fmt;

/// Identifies one frame within a client surface.
pub type FrameId = u32;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is gone or the channel was closed.
    Closed(String),
    /// The payload was addressed to a channel the peer does not serve.
    UnknownChannel(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(msg) => write!(f, "Channel closed: {}", msg),
            Self::UnknownChannel(name) => write!(f, "Unknown channel: {}", name),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Client → host. Object-safe, used as `Arc<dyn Channel>`.
pub trait Channel: Send + Sync + 'static {
    /// Sends a request and blocks until its reply arrives.
    fn send_sync(&self, channel: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Sends a message without waiting for any reply.
    fn send(&self, channel: &str, payload: &[u8]) -> Result<()>;
}

/// Host → one frame of one client surface.
pub trait FrameSink: Send + Sync + 'static {
    /// Hands off a notification. `Ok` means delivered to the channel, nothing more.
    fn send_to_frame(&self, frame: FrameId, channel: &str, payload: &[u8]) -> Result<()>;
}
