//! # Client
//!
//! One client context: the entry points into the host, the proxies built for
//! host objects, and the callbacks this context exposed to the host.
//!
//! ## Philosophy
//!
//! - **Synchronous Requests**: Every lookup, call and property access blocks on
//!   its reply. Notifications from the host arrive separately and are processed
//!   by [`RemoteClient::handle_message`].
//! - **One Proxy Per Handle**: While a proxy is alive, decoding the same handle
//!   again returns it instead of building a second one.
//!
//! ## Invariants
//!
//! - Every decode of a handle counts as one reference. A proxy returns all of
//!   its references in a single `dereference` when it is dropped or disposed.
//! - Callbacks stay registered until the host says their stand-in is gone.
//! - After [`RemoteClient::release`] nothing else is sent for the context.

pub mod builder;
mod proxy;
mod wrap;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use remorpc::Command;
use remorpc::HandleId;
use remorpc::MetaValue;
use remorpc::NOTIFY_CHANNEL;
use remorpc::Notification;
use remorpc::REQUEST_CHANNEL;
use remorpc::Reply;
use remorpc::RemoteObjectMeta;
use remorpc::Request;
use remorpc::SerializedError;
use tracing::debug;
use tracing::warn;

use crate::callbacks::CallbacksRegistry;
use crate::error::Error;
use crate::error::Result;
use crate::loopback::NotificationQueue;
use crate::object::Object;
use crate::object::WeakObject;
use crate::promise::Promise;
use crate::transport::Channel;
use crate::transport::TransportError;
use crate::value::ErrorValue;
use crate::value::Exception;
use crate::value::NativeImage;
use crate::value::Value;

pub use builder::ClientBuilder;
pub use proxy::RemoteHandle;

pub(crate) struct ClientInner {
    context_id: String,
    channel: Arc<dyn Channel>,
    callbacks: CallbacksRegistry,
    cache: DashMap<HandleId, WeakObject>,
    released: Arc<AtomicBool>,
}

/// Handle to one client context. Clones share the context.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<ClientInner>,
}

impl RemoteClient {
    pub fn builder(channel: Arc<dyn Channel>) -> ClientBuilder {
        ClientBuilder::new(channel)
    }

    pub(crate) fn new(context_id: String, channel: Arc<dyn Channel>) -> Self {
        RemoteClient {
            inner: Arc::new(ClientInner {
                context_id,
                channel,
                callbacks: CallbacksRegistry::new(),
                cache: DashMap::new(),
                released: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.inner.context_id
    }

    // ========================================================================
    //  Entry points
    // ========================================================================

    pub fn require(&self, module: &str) -> Result<Value> {
        self.inner.request_value(Command::Require { module: module.to_string() })
    }

    pub fn get_builtin(&self, name: &str) -> Result<Value> {
        self.inner.request_value(Command::GetBuiltin { name: name.to_string() })
    }

    pub fn get_global(&self, name: &str) -> Result<Value> {
        self.inner.request_value(Command::GetGlobal { name: name.to_string() })
    }

    pub fn get_current_window(&self) -> Result<Value> {
        self.inner.request_value(Command::GetCurrentWindow)
    }

    pub fn get_current_web_contents(&self) -> Result<Value> {
        self.inner.request_value(Command::GetCurrentWebContents)
    }

    /// The host's `process` global.
    pub fn process(&self) -> Result<Value> {
        self.get_global("process")
    }

    /// A function the host can call without a round trip; it always returns `value`.
    #[track_caller]
    pub fn create_function_with_return_value(&self, value: impl Into<Value>) -> Object {
        let value = value.into();
        let returned = value.clone();
        let function = Object::function("", 0, move |_| Ok(returned.clone()));
        function.set_return_value(value);
        function
    }

    /// Local functions currently exposed to the host.
    pub fn callbacks(&self) -> &CallbacksRegistry {
        &self.inner.callbacks
    }

    /// Live proxies built by this context.
    pub fn proxy_count(&self) -> usize {
        self.inner.cache.iter().filter(|e| !e.value().is_dead()).count()
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    /// Returns a proxy's references to the host right away instead of on drop.
    ///
    /// The proxy stays usable as a value, but the host no longer resolves it.
    /// Returns false for anything that is not a live proxy of this context.
    pub fn dispose(&self, value: &Value) -> bool {
        let Some(handle) = value.as_object().and_then(Object::remote) else {
            return false;
        };
        if handle.context() != self.inner.context_id || handle.is_released() {
            return false;
        }
        handle.release();
        self.inner.cache.remove(&handle.id());
        true
    }

    /// Tells the host to drop everything this context holds. Idempotent.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    // ========================================================================
    //  Notifications
    // ========================================================================

    /// Processes one message the host sent to this client's frame.
    pub fn handle_message(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if channel != NOTIFY_CHANNEL {
            return Err(TransportError::UnknownChannel(channel.to_string()).into());
        }
        let notification = Notification::from_bytes(payload)?;

        if notification.context() != self.inner.context_id {
            debug!(passed = notification.context(), id = notification.id(), "notification for another context");
            self.inner.notify(Command::WrongContextError {
                context: notification.context().to_string(),
                id: notification.id(),
            });
            return Ok(());
        }

        match notification {
            Notification::Callback { id, args, .. } => {
                // Unknown or already released.
                if !self.inner.callbacks.contains(id) {
                    warn!(context = %self.inner.context_id, id, "callback invoked after release");
                    return Ok(());
                }
                let args = match self.inner.meta_to_value(args)? {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                if let Err(thrown) = self.inner.callbacks.apply(id, args) {
                    warn!(id, error = %thrown, "callback threw");
                }
            }
            Notification::ReleaseCallback { id, .. } => self.inner.callbacks.remove(id),
        }
        Ok(())
    }

    /// Processes every queued notification without waiting. Returns how many were handled.
    pub fn drain(&self, queue: &mut NotificationQueue) -> usize {
        let mut handled = 0;
        while let Some(delivery) = queue.try_next() {
            if let Err(e) = self.handle_message(&delivery.channel, &delivery.payload) {
                warn!(frame = delivery.frame, error = %e, "notification dropped");
            }
            handled += 1;
        }
        handled
    }

    /// Processes notifications until the queue closes.
    pub async fn pump(&self, mut queue: NotificationQueue) {
        while let Some(delivery) = queue.next().await {
            if let Err(e) = self.handle_message(&delivery.channel, &delivery.payload) {
                warn!(frame = delivery.frame, error = %e, "notification dropped");
            }
        }
    }
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("context_id", &self.inner.context_id)
            .field("callbacks", &self.inner.callbacks.len())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
//  Requests and decoding
// ============================================================================

impl ClientInner {
    pub(crate) fn request(&self, command: Command) -> Result<Option<MetaValue>> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::Released);
        }
        let name = command.name();
        let bytes = Request::new(self.context_id.clone(), command).to_bytes()?;
        let reply = self.channel.send_sync(REQUEST_CHANNEL, &bytes)?;
        let Reply(meta) = Reply::from_bytes(&reply)?;
        debug!(context = %self.context_id, command = name, "reply");
        Ok(meta)
    }

    pub(crate) fn request_value(self: &Arc<Self>, command: Command) -> Result<Value> {
        match self.request(command)? {
            Some(meta) => self.meta_to_value(meta),
            None => Ok(Value::Undefined),
        }
    }

    /// Sends without waiting. Failures are only logged.
    fn notify(&self, command: Command) {
        let name = command.name();
        let sent = Request::new(self.context_id.clone(), command)
            .to_bytes()
            .map_err(Error::from)
            .and_then(|bytes| self.channel.send(REQUEST_CHANNEL, &bytes).map_err(Error::from));
        if let Err(e) = sent {
            warn!(context = %self.context_id, command = name, error = %e, "notification not sent");
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let sent = Request::new(self.context_id.clone(), Command::ContextRelease)
            .to_bytes()
            .map_err(Error::from)
            .and_then(|bytes| self.channel.send(REQUEST_CHANNEL, &bytes).map_err(Error::from));
        match sent {
            Ok(()) => debug!(context = %self.context_id, "context released"),
            Err(e) => warn!(context = %self.context_id, error = %e, "context-release not sent"),
        }
        self.callbacks.clear();
        self.cache.clear();
    }

    pub(crate) fn meta_to_value(self: &Arc<Self>, meta: MetaValue) -> Result<Value> {
        let value = match meta {
            MetaValue::Value(plain) => Value::from_plain(plain),
            MetaValue::Buffer(bytes) => Value::Buffer(bytes),
            MetaValue::Date(ms) => Value::Date(ms),
            MetaValue::Array(items) => {
                Value::Array(items.into_iter().map(|m| self.meta_to_value(m)).collect::<Result<_>>()?)
            }
            MetaValue::Exception(thrown) => return Err(Error::Remote(Exception(self.meta_to_value(*thrown)?))),
            MetaValue::Promise { then } => {
                let then = self.meta_to_value(*then)?;
                Value::Promise(self.follow(then))
            }
            MetaValue::Error { error, members } => {
                let mut value = deserialize_error(error);
                for (name, member) in members {
                    let member = self.meta_to_value(member)?;
                    if name == "cause" && value.cause.is_none() {
                        value.cause = Some(Box::new(member));
                    } else {
                        value.props.push((name, member));
                    }
                }
                Value::Error(value)
            }
            MetaValue::NativeImage(image) => Value::Image(NativeImage { representations: image.representations }),
            MetaValue::Object(meta) => Value::Object(self.proxy_for(meta, false)),
            MetaValue::Function(meta) => Value::Object(self.proxy_for(meta, true)),
        };
        Ok(value)
    }

    fn proxy_for(self: &Arc<Self>, meta: RemoteObjectMeta, callable: bool) -> Object {
        let cached = self.cache.get(&meta.id).map(|entry| entry.value().clone());
        if let Some(proxy) = cached.and_then(|weak| weak.upgrade()) {
            if let Some(handle) = proxy.remote().filter(|h| !h.is_released()) {
                handle.add_ref();
                return proxy;
            }
        }
        proxy::build(self, meta, callable)
    }

    /// A local promise following a remote thenable.
    fn follow(self: &Arc<Self>, then: Value) -> Promise {
        let promise = Promise::new();
        let Some(then) = then.as_object().filter(|o| o.is_callable()).cloned() else {
            promise.resolve(then);
            return promise;
        };

        let fulfil = promise.clone();
        let resolve = Object::function("", 1, move |inv| {
            fulfil.resolve(inv.arg(0));
            Ok(Value::Undefined)
        });
        let fail = promise.clone();
        let reject = Object::function("", 1, move |inv| {
            fail.reject(inv.arg(0));
            Ok(Value::Undefined)
        });

        if let Err(thrown) = then.call(Value::Undefined, vec![Value::Object(resolve), Value::Object(reject)]) {
            promise.reject(thrown.into_value());
        }
        promise
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Decoded errors are marked as coming from the host, so they differ from the
/// original only in `from`.
fn deserialize_error(error: SerializedError) -> ErrorValue {
    ErrorValue {
        name: error.name,
        message: error.message,
        stack: error.stack,
        from: Some(error.from),
        cause: error.cause.map(|cause| Box::new(Value::Error(deserialize_error(*cause)))),
        props: Vec::new(),
    }
}
