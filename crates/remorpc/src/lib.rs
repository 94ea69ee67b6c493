//! # Remorpc
//!
//! The wire vocabulary of the remote object protocol.
//!
//! ## Architecture
//!
//! Two closed sum types describe values in flight, one per direction:
//! [`MetaValue`] travels from the host to the client and may carry live handles,
//! [`MetaValueFromClient`] travels the other way and may carry back-references
//! and callback ids. Requests, replies and notifications wrap them in frames.
//! Everything is encoded with `remopack`; nothing in this crate knows about
//! registries, proxies or transports.

pub mod codec;
pub mod error;
pub mod frame;
pub mod meta;


pub use error::Result;
pub use error::RpcError;
pub use frame::Command;
pub use frame::Notification;
pub use frame::Reply;
pub use frame::Request;
pub use frame::NOTIFY_CHANNEL;
pub use frame::REQUEST_CHANNEL;
pub use meta::HandleId;
pub use meta::ImageRepresentation;
pub use meta::MemberKind;
pub use meta::MetaValue;
pub use meta::MetaValueFromClient;
pub use meta::ObjectMember;
pub use meta::Plain;
pub use meta::ProcessKind;
pub use meta::ProtoFrame;
pub use meta::RemoteObjectMeta;
pub use meta::SerializedError;
pub use meta::SerializedImage;

/// The maximum nesting depth of a meta value, on encode and decode.
pub const MAX_DEPTH: usize = 128;
