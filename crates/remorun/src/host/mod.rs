//! # Host
//!
//! The side that owns real values. It answers requests from client contexts,
//! pins whatever it hands out in the [`ObjectRegistry`], and calls back into
//! client functions through fire-and-forget notifications.
//!
//! ## Philosophy
//!
//! - **Single Chokepoint**: Every request goes through [`Host::handle`]. Whatever a
//!   handler throws becomes an `exception` reply; nothing escapes to the transport.
//! - **Serialized Dispatch**: Requests from any number of contexts are handled one at
//!   a time, so no two handlers interleave on the same registry entry.
//! - **Always Reply**: Commands without a result answer with the empty sentinel, so a
//!   blocking sender is never left waiting.
//!
//! ## Invariants
//!
//! - A handle id is only honoured for the context it was issued to.
//! - Releasing a context, or destroying the endpoint that opened it, unpins everything
//!   the context held.

pub mod builder;
mod marshal;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use remorpc::Command;
use remorpc::HandleId;
use remorpc::MetaValue;
use remorpc::Reply;
use remorpc::Request;
use tracing::debug;
use tracing::warn;

use crate::callbacks::CallbackCache;
use crate::lock;
use crate::object::Object;
use crate::registry::ObjectRegistry;
use crate::transport::FrameId;
use crate::transport::FrameSink;
use crate::value::ErrorValue;
use crate::value::Exception;
use crate::value::Value;

pub use builder::HostBuilder;
pub use builder::ModuleResolver;
pub use marshal::remove_remote_listeners_and_log_warning;

/// Hook run for every override event, on the host or on one endpoint.
pub type RemoteEventHook = Arc<dyn Fn(&mut RemoteEvent) + Send + Sync>;

/// Decides whether an object may be copied by value when a call result is optimized.
pub type SimpleObjectPolicy = Arc<dyn Fn(&Object) -> bool + Send + Sync>;

pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
//  Override events
// ============================================================================

/// The lookups a collaborator may intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    Require,
    GetBuiltin,
    GetGlobal,
    GetCurrentWindow,
    GetCurrentWebContents,
}

impl RemoteEventKind {
    pub fn name(self) -> &'static str {
        match self {
            RemoteEventKind::Require => "remote-require",
            RemoteEventKind::GetBuiltin => "remote-get-builtin",
            RemoteEventKind::GetGlobal => "remote-get-global",
            RemoteEventKind::GetCurrentWindow => "remote-get-current-window",
            RemoteEventKind::GetCurrentWebContents => "remote-get-current-web-contents",
        }
    }

    fn blocked_message(self, argument: Option<&str>) -> String {
        let argument = argument.unwrap_or_default();
        match self {
            RemoteEventKind::Require => format!("Blocked remote.require('{}')", argument),
            RemoteEventKind::GetBuiltin => format!("Blocked remote.getBuiltin('{}')", argument),
            RemoteEventKind::GetGlobal => format!("Blocked remote.getGlobal('{}')", argument),
            RemoteEventKind::GetCurrentWindow => "Blocked remote.getCurrentWindow()".to_string(),
            RemoteEventKind::GetCurrentWebContents => "Blocked remote.getCurrentWebContents()".to_string(),
        }
    }
}

/// A cancelable notification emitted before a lookup runs its default action.
///
/// A hook may supply the value to return, or prevent the default so the lookup fails.
pub struct RemoteEvent {
    kind: RemoteEventKind,
    argument: Option<String>,
    endpoint: Arc<Endpoint>,
    return_value: Option<Value>,
    default_prevented: bool,
}

impl RemoteEvent {
    pub fn kind(&self) -> RemoteEventKind {
        self.kind
    }

    /// The module, builtin or global name, when the lookup has one.
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented
    }

    /// Supplies the value to return. `undefined` counts as no value.
    pub fn set_return_value(&mut self, value: impl Into<Value>) {
        self.return_value = Some(value.into());
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }
}

// ============================================================================
//  Endpoint
// ============================================================================

/// The host's view of one client surface: where its requests come from and
/// where notifications for it go.
pub struct Endpoint {
    id: EndpointId,
    sink: Arc<dyn FrameSink>,
    contents: Value,
    window: Value,
    destroyed: AtomicBool,
    enabled: AtomicBool,
    hooks: Mutex<Vec<RemoteEventHook>>,
}

impl Endpoint {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Endpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            sink,
            contents: Value::Undefined,
            window: Value::Undefined,
            destroyed: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// The value answered to `get-current-web-contents`. Listener cleanup for
    /// misdirected callbacks runs against its emitter.
    pub fn with_contents(mut self, contents: impl Into<Value>) -> Self {
        self.contents = contents.into();
        self
    }

    /// The value answered to `get-current-window`.
    pub fn with_window(mut self, window: impl Into<Value>) -> Self {
        self.window = window.into();
        self
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }

    pub fn contents(&self) -> &Value {
        &self.contents
    }

    pub fn window(&self) -> &Value {
        &self.window
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Allows requests from this endpoint when the host requires enabling.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Adds an override hook that only sees this endpoint's lookups. Runs after host hooks.
    pub fn on_remote_event(&self, hook: impl Fn(&mut RemoteEvent) + Send + Sync + 'static) {
        lock(&self.hooks).push(Arc::new(hook));
    }

    fn hooks(&self) -> Vec<RemoteEventHook> {
        lock(&self.hooks).clone()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
//  Host
// ============================================================================

pub(crate) struct HostConfig {
    pub(crate) resolver: Arc<dyn ModuleResolver>,
    pub(crate) builtins: HashMap<String, Value>,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) hooks: Vec<RemoteEventHook>,
    pub(crate) simple_policy: SimpleObjectPolicy,
    pub(crate) require_enable: bool,
}

pub struct Host {
    this: Weak<Host>,
    config: HostConfig,
    registry: ObjectRegistry,
    callbacks: CallbackCache,
    endpoint_contexts: DashMap<EndpointId, Vec<String>>,
    dispatch: Mutex<()>,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    pub(crate) fn from_config(config: HostConfig) -> Arc<Host> {
        Arc::new_cyclic(|this| Host {
            this: this.clone(),
            config,
            registry: ObjectRegistry::new(),
            callbacks: CallbackCache::default(),
            endpoint_contexts: DashMap::new(),
            dispatch: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Stand-ins for client callbacks, by context and callback id.
    pub fn callback_cache(&self) -> &CallbackCache {
        &self.callbacks
    }

    /// Contexts that have sent requests through `endpoint` and not been released.
    pub fn contexts_of(&self, endpoint: &Endpoint) -> Vec<String> {
        self.endpoint_contexts.get(&endpoint.id()).map(|c| c.clone()).unwrap_or_default()
    }

    /// Handles one request from `endpoint` and returns the encoded reply.
    ///
    /// Never fails: decoding problems and thrown values are both answered with an
    /// `exception` meta. Must not be called re-entrantly from inside a handler.
    pub fn handle(&self, endpoint: &Arc<Endpoint>, frame: FrameId, payload: &[u8]) -> Vec<u8> {
        let _dispatch = lock(&self.dispatch);

        let reply = match Request::from_bytes(payload) {
            Ok(request) => {
                debug!(endpoint = endpoint.id(), context = %request.context, command = request.command.name(), "request");
                let context = request.context.clone();
                match self.dispatch(endpoint, frame, request) {
                    Ok(meta) => Reply(meta),
                    Err(thrown) => {
                        debug!(context = %context, error = %thrown, "request threw");
                        let value = self.value_to_meta(&context, thrown.into_value(), false);
                        Reply::value(MetaValue::Exception(Box::new(value)))
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = endpoint.id(), error = %e, "malformed request");
                failure_reply(&format!("Malformed remote request: {}", e))
            }
        };

        match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "reply could not be encoded");
                failure_reply(&format!("Remote reply could not be encoded: {}", e)).to_bytes().unwrap_or_default()
            }
        }
    }

    /// Marks `endpoint` destroyed and releases every context it opened.
    pub fn endpoint_destroyed(&self, endpoint: &Endpoint) {
        endpoint.destroyed.store(true, Ordering::Release);
        if let Some((_, contexts)) = self.endpoint_contexts.remove(&endpoint.id()) {
            for context in contexts {
                self.registry.clear(&context);
            }
        }
        debug!(endpoint = endpoint.id(), "endpoint destroyed");
    }

    fn track(&self, endpoint: &Endpoint, context: &str) {
        let mut contexts = self.endpoint_contexts.entry(endpoint.id()).or_default();
        if !contexts.iter().any(|c| c == context) {
            contexts.push(context.to_string());
        }
    }

    fn untrack(&self, endpoint: &Endpoint, context: &str) {
        if let Some(mut contexts) = self.endpoint_contexts.get_mut(&endpoint.id()) {
            contexts.retain(|c| c != context);
        }
    }

    fn lookup(&self, context: &str, id: HandleId, message: impl FnOnce() -> String) -> Result<Object, Exception> {
        self.registry.get(context, id).ok_or_else(|| rpc_error(message()))
    }

    fn dispatch(&self, endpoint: &Arc<Endpoint>, frame: FrameId, request: Request) -> Result<Option<MetaValue>, Exception> {
        let context = request.context.as_str();

        match request.command {
            Command::WrongContextError { context: passed, id } => {
                self.wrong_context(endpoint, &passed, id);
                return Ok(None);
            }
            Command::Dereference { id, count } => {
                self.registry.remove(context, id, count);
                return Ok(None);
            }
            Command::ContextRelease => {
                self.registry.clear(context);
                self.untrack(endpoint, context);
                return Ok(None);
            }
            _ => {}
        }

        if self.config.require_enable && !endpoint.is_enabled() {
            return Err(Exception::error(format!(
                "remote is disabled for endpoint {}. Call Endpoint::enable on the host side to enable it.",
                endpoint.id()
            )));
        }
        self.track(endpoint, context);

        let meta = match request.command {
            Command::Require { module } => {
                let value = self.emit_remote_event(endpoint, RemoteEventKind::Require, Some(module.as_str()), || {
                    self.config
                        .resolver
                        .resolve(&module)
                        .ok_or_else(|| Exception::error(format!("Cannot find module '{}'", module)))
                })?;
                self.value_to_meta(context, value, false)
            }
            Command::GetBuiltin { name } => {
                let value = self.emit_remote_event(endpoint, RemoteEventKind::GetBuiltin, Some(name.as_str()), || {
                    Ok(self.config.builtins.get(&name).cloned().unwrap_or(Value::Undefined))
                })?;
                self.value_to_meta(context, value, false)
            }
            Command::GetGlobal { name } => {
                let value = self.emit_remote_event(endpoint, RemoteEventKind::GetGlobal, Some(name.as_str()), || {
                    Ok(self.config.globals.get(&name).cloned().unwrap_or(Value::Undefined))
                })?;
                self.value_to_meta(context, value, false)
            }
            Command::GetCurrentWindow => {
                let value = self.emit_remote_event(endpoint, RemoteEventKind::GetCurrentWindow, None, || {
                    Ok(endpoint.window().clone())
                })?;
                self.value_to_meta(context, value, false)
            }
            Command::GetCurrentWebContents => {
                let value = self.emit_remote_event(endpoint, RemoteEventKind::GetCurrentWebContents, None, || {
                    Ok(endpoint.contents().clone())
                })?;
                self.value_to_meta(context, value, false)
            }
            Command::Constructor { id, args } => {
                let args = self.unwrap_args(endpoint, frame, context, args)?;
                let constructor =
                    self.lookup(context, id, || format!("Cannot call constructor on missing remote object {}", id))?;
                let value = constructor.construct(args)?;
                self.value_to_meta(context, value, false)
            }
            Command::FunctionCall { id, args } => {
                let args = self.unwrap_args(endpoint, frame, context, args)?;
                let function =
                    self.lookup(context, id, || format!("Cannot call function on missing remote object {}", id))?;
                match function.call(Value::Undefined, args) {
                    Ok(value) => self.value_to_meta(context, value, true),
                    Err(thrown) => {
                        let name = function.name().filter(|n| !n.is_empty()).unwrap_or("anonymous").to_string();
                        return Err(wrap_call_error(&format!("remote function '{}'", name), "function", thrown));
                    }
                }
            }
            Command::MemberConstructor { id, name, args } => {
                let args = self.unwrap_args(endpoint, frame, context, args)?;
                let object = self.lookup(context, id, || {
                    format!("Cannot call constructor '{}' on missing remote object {}", name, id)
                })?;
                let value = match object.get(&name)? {
                    Value::Object(constructor) => constructor.construct(args)?,
                    _ => return Err(Exception::type_error(format!("object.{} is not a constructor", name))),
                };
                self.value_to_meta(context, value, false)
            }
            Command::MemberCall { id, name, args } => {
                let args = self.unwrap_args(endpoint, frame, context, args)?;
                let object =
                    self.lookup(context, id, || format!("Cannot call method '{}' on missing remote object {}", name, id))?;
                let result = object.get(&name).and_then(|method| match method {
                    Value::Object(method) => method.call(Value::Object(object.clone()), args),
                    _ => Err(Exception::type_error(format!("object.{} is not a function", name))),
                });
                match result {
                    Ok(value) => self.value_to_meta(context, value, true),
                    Err(thrown) => return Err(wrap_call_error(&format!("remote method '{}'", name), "method", thrown)),
                }
            }
            Command::MemberSet { id, name, value } => {
                let mut values = self.unwrap_args(endpoint, frame, context, vec![value])?;
                let value = values.pop().unwrap_or(Value::Undefined);
                let object =
                    self.lookup(context, id, || format!("Cannot set property '{}' on missing remote object {}", name, id))?;
                object.set(&name, value)?;
                return Ok(None);
            }
            Command::MemberGet { id, name } => {
                let object =
                    self.lookup(context, id, || format!("Cannot get property '{}' on missing remote object {}", name, id))?;
                let value = object.get(&name)?;
                self.value_to_meta(context, value, false)
            }
            Command::WrongContextError { .. } | Command::Dereference { .. } | Command::ContextRelease => {
                return Ok(None);
            }
        };

        Ok(Some(meta))
    }

    /// Runs host hooks, then endpoint hooks, then the default action unless a hook
    /// supplied a value or prevented it.
    fn emit_remote_event(
        &self,
        endpoint: &Arc<Endpoint>,
        kind: RemoteEventKind,
        argument: Option<&str>,
        default: impl FnOnce() -> Result<Value, Exception>,
    ) -> Result<Value, Exception> {
        let mut event = RemoteEvent {
            kind,
            argument: argument.map(str::to_string),
            endpoint: Arc::clone(endpoint),
            return_value: None,
            default_prevented: false,
        };

        for hook in &self.config.hooks {
            hook(&mut event);
        }
        for hook in endpoint.hooks() {
            hook(&mut event);
        }

        match event.return_value.take() {
            Some(value) if value != Value::Undefined => Ok(value),
            _ if event.default_prevented => {
                debug!(event = kind.name(), argument, "lookup blocked");
                Err(Exception::error(kind.blocked_message(argument)))
            }
            _ => default(),
        }
    }

    fn wrong_context(&self, endpoint: &Endpoint, passed_context: &str, id: u64) {
        // Already reported, or the stand-in is gone.
        let Some((stand_in, location)) = self.callbacks.lookup(passed_context, id) else {
            return;
        };
        remove_remote_listeners_and_log_warning(endpoint.contents(), &stand_in, &location);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("objects", &self.registry.len())
            .field("callbacks", &self.callbacks.live())
            .finish()
    }
}

/// The error thrown when a request names a handle the registry does not hold.
pub(crate) fn rpc_error(message: String) -> Exception {
    let error = ErrorValue::error(message).with_prop("code", "EBADRPC").with_prop("errno", -72);
    Exception::from(error)
}

fn wrap_call_error(target: &str, kind: &str, thrown: Exception) -> Exception {
    let (message, stack) = match thrown.as_error() {
        Some(e) => (e.message.clone(), e.stack.clone().unwrap_or_else(|| "undefined".into())),
        None => (thrown.message(), "undefined".into()),
    };
    let error = ErrorValue::error(format!(
        "Could not call {}. Check that the {} signature is correct. Underlying error: {}\nUnderlying stack: {}\n",
        target, kind, message, stack
    ))
    .with_cause(thrown.into_value());
    Exception::from(error)
}

fn failure_reply(message: &str) -> Reply {
    let error = marshal::serialize_error(&ErrorValue::error(message));
    Reply::value(MetaValue::Exception(Box::new(MetaValue::Error { error, members: Vec::new() })))
}
