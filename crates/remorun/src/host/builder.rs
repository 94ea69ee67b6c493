//! # Host Builder
//!
//! Fluent configuration for a [`Host`]: what `require`, `getBuiltin` and
//! `getGlobal` resolve to, which override hooks run, and which objects may be
//! copied by value.
//!
//! ```
//! # use remorun::{Host, Object, Value};
//! let fs = Object::plain().with("sep", "/");
//! let host = Host::builder()
//!     .module("fs", fs)
//!     .global("answer", 42)
//!     .build();
//! # let _ = host;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use super::Host;
use super::HostConfig;
use super::RemoteEvent;
use super::RemoteEventHook;
use super::SimpleObjectPolicy;
use crate::object::Object;
use crate::value::Value;

/// Resolves module names for `require`. `None` means the module does not exist.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl<F> ModuleResolver for F
where
    F: Fn(&str) -> Option<Value> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<Value> {
        self(name)
    }
}

/// Registered modules first, then the custom resolver.
struct Modules {
    registered: HashMap<String, Value>,
    fallback: Option<Arc<dyn ModuleResolver>>,
}

impl ModuleResolver for Modules {
    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(module) = self.registered.get(name) {
            return Some(module.clone());
        }
        self.fallback.as_ref().and_then(|r| r.resolve(name))
    }
}

#[derive(Default)]
pub struct HostBuilder {
    modules: HashMap<String, Value>,
    resolver: Option<Arc<dyn ModuleResolver>>,
    builtins: HashMap<String, Value>,
    globals: HashMap<String, Value>,
    hooks: Vec<RemoteEventHook>,
    simple_policy: Option<SimpleObjectPolicy>,
    require_enable: bool,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module answered to `require(name)`.
    pub fn module(mut self, name: &str, module: impl Into<Value>) -> Self {
        self.modules.insert(name.to_string(), module.into());
        self
    }

    /// Consulted for names no registered module matches.
    pub fn resolver(mut self, resolver: impl ModuleResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn builtin(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.builtins.insert(name.to_string(), value.into());
        self
    }

    pub fn global(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.globals.insert(name.to_string(), value.into());
        self
    }

    /// Adds an override hook seen by every endpoint's lookups. Hooks run in the order added.
    pub fn on_remote_event(mut self, hook: impl Fn(&mut RemoteEvent) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Decides which objects an optimized call result copies by value.
    ///
    /// Defaults to objects marked with [`Object::simple`].
    pub fn simple_object_policy(mut self, policy: impl Fn(&Object) -> bool + Send + Sync + 'static) -> Self {
        self.simple_policy = Some(Arc::new(policy));
        self
    }

    /// Refuses lookups and calls from endpoints that were not explicitly enabled.
    pub fn require_enable(mut self, require: bool) -> Self {
        self.require_enable = require;
        self
    }

    pub fn build(self) -> Arc<Host> {
        let resolver = Modules { registered: self.modules, fallback: self.resolver };
        let simple_policy = self.simple_policy.unwrap_or_else(|| Arc::new(|object: &Object| object.is_simple()));
        Host::from_config(HostConfig {
            resolver: Arc::new(resolver),
            builtins: self.builtins,
            globals: self.globals,
            hooks: self.hooks,
            simple_policy,
            require_enable: self.require_enable,
        })
    }
}
