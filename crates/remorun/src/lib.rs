//! # remorun
//!
//! Remote object access between a host process and its client contexts.
//!
//! ## Architecture
//!
//! The host owns the real values. A client asks for one by module, builtin or
//! global name and gets back a proxy that mirrors the value's member layout.
//! Calls and property accesses on the proxy become synchronous requests; the
//! host runs them against the real value and answers with a description of the
//! result.
//!
//! - **Host**: Dispatches requests, pins handed-out objects in the [`ObjectRegistry`]
//!   and turns client callbacks into stand-in functions.
//! - **RemoteClient**: One context's proxies, callbacks and reference counts.
//! - **Channel / FrameSink**: The two transport primitives; [`loopback`] connects
//!   both sides inside one process.
//!
//! ## Example
//!
//! ```rust
//! use remorun::{loopback, Host, Object, Value};
//!
//! # fn example() -> remorun::Result<()> {
//! let greeter = Object::plain()
//!     .with("a", 1)
//!     .with_method("greet", 0, |_| Ok(Value::from("hi")));
//! let host = Host::builder().module("greeter", greeter).build();
//!
//! let connection = loopback::connect(&host);
//! let client = connection.client();
//! let remote = client.require("greeter")?;
//! let greet = remote.as_object().map(|o| o.get("greet")).transpose()?;
//! # let _ = greet;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Protocol
//!
//! Built on [remorpc]'s meta values and frames:
//! - Request: `[command, context, args...]` on `remote:request`
//! - Reply: an optional meta value; `exception` when the operation threw
//! - Notification: `[kind, context, callback id, args?]` on `remote:notify`

pub mod callbacks;
pub mod client;
pub mod emitter;
pub mod error;
pub mod host;
pub mod logging;
pub mod loopback;
pub mod object;
pub mod promise;
pub mod registry;
pub mod transport;
pub mod value;

#[cfg(test)]
mod tests;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub use callbacks::CallbackCache;
pub use callbacks::CallbacksRegistry;
pub use client::ClientBuilder;
pub use client::RemoteClient;
pub use client::RemoteHandle;
pub use emitter::EventEmitter;
pub use error::Error;
pub use error::Result;
pub use host::Endpoint;
pub use host::Host;
pub use host::HostBuilder;
pub use host::ModuleResolver;
pub use host::RemoteEvent;
pub use host::RemoteEventKind;
pub use object::Object;
pub use object::Property;
pub use promise::Promise;
pub use promise::PromiseState;
pub use registry::ObjectRegistry;
pub use transport::Channel;
pub use transport::FrameId;
pub use transport::FrameSink;
pub use transport::TransportError;
pub use value::ErrorValue;
pub use value::Exception;
pub use value::NativeImage;
pub use value::Value;

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
