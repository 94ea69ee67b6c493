//! # Objects
//!
//! Shared, identity-compared objects with ordered own properties, an optional
//! prototype and optional call behaviour.
//!
//! ## Invariants
//!
//! - **Layered Lookup**: A property miss falls through to the prototype, layer by
//!   layer, until a layer without a prototype is reached. Prototype chains are acyclic.
//! - **No Re-entrancy Under Lock**: Getters, setters, callables, loaders and finalizers
//!   never run while an internal lock is held.
//! - **One-Shot Loading**: A lazy member loader runs at most once, on the first own-key
//!   enumeration, own-property miss or assignment. Calling the object never runs it.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::client::RemoteHandle;
use crate::emitter::EventEmitter;
use crate::lock;
use crate::value::Exception;
use crate::value::Invocation;
use crate::value::Value;

/// The body of a native function.
pub type NativeFn = Arc<dyn Fn(Invocation) -> Result<Value, Exception> + Send + Sync>;

type Loader = Box<dyn FnOnce(&Object) + Send>;
type Finalizer = Box<dyn FnOnce() + Send>;

/// Call behaviour of a function object.
#[derive(Clone)]
pub struct Callable {
    pub name: String,
    pub length: u32,
    pub constructible: bool,
    body: NativeFn,
}

/// One own property slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Data { value: Value, writable: bool, enumerable: bool },
    Accessor { get: Option<Object>, set: Option<Object>, enumerable: bool },
}

impl Property {
    /// A writable, enumerable data property.
    pub fn data(value: impl Into<Value>) -> Self {
        Property::Data { value: value.into(), writable: true, enumerable: true }
    }

    pub fn read_only(value: impl Into<Value>) -> Self {
        Property::Data { value: value.into(), writable: false, enumerable: true }
    }

    pub fn is_enumerable(&self) -> bool {
        match self {
            Property::Data { enumerable, .. } | Property::Accessor { enumerable, .. } => *enumerable,
        }
    }
}

struct ObjectInner {
    class_name: String,
    props: Mutex<Vec<(String, Property)>>,
    proto: Mutex<Option<Object>>,
    callable: Option<Callable>,
    emitter: Option<EventEmitter>,
    simple: AtomicBool,
    return_value: OnceLock<Value>,
    location: &'static Location<'static>,
    remote: OnceLock<Arc<RemoteHandle>>,
    loader: Mutex<Option<Loader>>,
    finalizer: Mutex<Option<Finalizer>>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        let finalizer = self.finalizer.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(finalize) = finalizer {
            finalize();
        }
    }
}

/// A shared object. Clones refer to the same object.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

/// A non-owning reference to an [`Object`].
#[derive(Clone)]
pub struct WeakObject {
    inner: Weak<ObjectInner>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.inner.upgrade().map(|inner| Object { inner })
    }

    /// True once the object has been dropped. Never creates a strong reference.
    pub fn is_dead(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl Object {
    fn build(
        class_name: String,
        callable: Option<Callable>,
        emitter: Option<EventEmitter>,
        location: &'static Location<'static>,
    ) -> Self {
        Object {
            inner: Arc::new(ObjectInner {
                class_name,
                props: Mutex::new(Vec::new()),
                proto: Mutex::new(None),
                callable,
                emitter,
                simple: AtomicBool::new(false),
                return_value: OnceLock::new(),
                location,
                remote: OnceLock::new(),
                loader: Mutex::new(None),
                finalizer: Mutex::new(None),
            }),
        }
    }

    /// An empty object of the given class.
    #[track_caller]
    pub fn new(class_name: impl Into<String>) -> Self {
        Self::build(class_name.into(), None, None, Location::caller())
    }

    /// An empty object of class `Object`.
    #[track_caller]
    pub fn plain() -> Self {
        Self::build("Object".into(), None, None, Location::caller())
    }

    /// An object carrying an event emitter.
    #[track_caller]
    pub fn event_emitter(class_name: impl Into<String>) -> Self {
        Self::build(class_name.into(), None, Some(EventEmitter::default()), Location::caller())
    }

    /// A plain native function.
    #[track_caller]
    pub fn function<F>(name: impl Into<String>, length: u32, body: F) -> Self
    where
        F: Fn(Invocation) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let callable = Callable { name: name.into(), length, constructible: false, body: Arc::new(body) };
        Self::build("Function".into(), Some(callable), None, Location::caller())
    }

    /// A native function usable with `construct`. Gets an own `prototype` object.
    #[track_caller]
    pub fn constructor<F>(name: impl Into<String>, length: u32, body: F) -> Self
    where
        F: Fn(Invocation) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let name = name.into();
        let location = Location::caller();
        let callable = Callable { name: name.clone(), length, constructible: true, body: Arc::new(body) };
        let object = Self::build("Function".into(), Some(callable), None, location);
        let prototype = Self::build(name, None, None, location);
        object.define("prototype", Property::Data { value: Value::Object(prototype), writable: true, enumerable: false });
        object
    }

    // ------------------------------------------------------------------------
    //  Construction helpers
    // ------------------------------------------------------------------------

    /// Adds a writable, enumerable data property.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.define(name, Property::data(value));
        self
    }

    /// Adds a native method as a data property.
    #[track_caller]
    pub fn with_method<F>(self, name: &str, length: u32, body: F) -> Self
    where
        F: Fn(Invocation) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let method = Object::function(name, length, body);
        self.define(name, Property::data(method));
        self
    }

    /// Adds an accessor property from native getter and optional setter bodies.
    #[track_caller]
    pub fn with_accessor<G>(self, name: &str, get: G, set: Option<NativeFn>) -> Self
    where
        G: Fn(Invocation) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let location = Location::caller();
        let getter = Callable { name: format!("get {}", name), length: 0, constructible: false, body: Arc::new(get) };
        let getter = Self::build("Function".into(), Some(getter), None, location);
        let setter = set.map(|body| {
            let callable = Callable { name: format!("set {}", name), length: 1, constructible: false, body };
            Self::build("Function".into(), Some(callable), None, location)
        });
        self.define(name, Property::Accessor { get: Some(getter), set: setter, enumerable: true });
        self
    }

    /// Sets the prototype. A prototype that would create a cycle is ignored.
    pub fn with_proto(self, proto: Object) -> Self {
        let _ = self.set_proto(Some(proto));
        self
    }

    /// Marks the object as safe to copy by value when a result is optimized.
    pub fn simple(self) -> Self {
        self.mark_simple();
        self
    }

    // ------------------------------------------------------------------------
    //  Identity and hidden slots
    // ------------------------------------------------------------------------

    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Stable identity key while the object is alive.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject { inner: Arc::downgrade(&self.inner) }
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// Where the object was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.inner.location
    }

    pub fn is_simple(&self) -> bool {
        self.inner.simple.load(Ordering::Acquire)
    }

    pub fn mark_simple(&self) {
        self.inner.simple.store(true, Ordering::Release);
    }

    /// The fixed result of a function created to return a known value.
    pub fn return_value(&self) -> Option<&Value> {
        self.inner.return_value.get()
    }

    pub(crate) fn set_return_value(&self, value: Value) {
        let _ = self.inner.return_value.set(value);
    }

    /// The host handle this object stands in for, on the client side.
    pub fn remote(&self) -> Option<&Arc<RemoteHandle>> {
        self.inner.remote.get()
    }

    pub(crate) fn set_remote(&self, handle: Arc<RemoteHandle>) {
        let _ = self.inner.remote.set(handle);
    }

    pub fn emitter(&self) -> Option<&EventEmitter> {
        self.inner.emitter.as_ref()
    }

    /// Installs a one-shot member loader, replacing any pending one.
    pub fn set_lazy_loader(&self, loader: impl FnOnce(&Object) + Send + 'static) {
        *lock(&self.inner.loader) = Some(Box::new(loader));
    }

    /// Registers a closure to run when the last reference is dropped.
    pub fn on_finalize(&self, finalize: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.finalizer) = Some(Box::new(finalize));
    }

    fn load(&self) {
        let loader = lock(&self.inner.loader).take();
        if let Some(load) = loader {
            load(self);
        }
    }

    // ------------------------------------------------------------------------
    //  Own properties
    // ------------------------------------------------------------------------

    /// Defines or replaces an own property without running the loader.
    pub fn define(&self, name: impl Into<String>, prop: Property) {
        let name = name.into();
        let mut props = lock(&self.inner.props);
        match props.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = prop,
            None => props.push((name, prop)),
        }
    }

    pub(crate) fn has_own_raw(&self, name: &str) -> bool {
        lock(&self.inner.props).iter().any(|(n, _)| n == name)
    }

    fn own_raw(&self, name: &str) -> Option<Property> {
        lock(&self.inner.props).iter().find(|(n, _)| n == name).map(|(_, p)| p.clone())
    }

    pub fn get_own_property(&self, name: &str) -> Option<Property> {
        if let Some(prop) = self.own_raw(name) {
            return Some(prop);
        }
        self.load();
        self.own_raw(name)
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.get_own_property(name).is_some()
    }

    /// Own property names in definition order.
    pub fn own_keys(&self) -> Vec<String> {
        self.load();
        lock(&self.inner.props).iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn own_properties(&self) -> Vec<(String, Property)> {
        self.load();
        lock(&self.inner.props).clone()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.load();
        let mut props = lock(&self.inner.props);
        let before = props.len();
        props.retain(|(n, _)| n != name);
        props.len() != before
    }

    // ------------------------------------------------------------------------
    //  Prototype chain
    // ------------------------------------------------------------------------

    pub fn proto(&self) -> Option<Object> {
        lock(&self.inner.proto).clone()
    }

    /// Replaces the prototype. Fails if the new chain would contain `self`.
    pub fn set_proto(&self, proto: Option<Object>) -> Result<(), Exception> {
        let mut layer = proto.clone();
        while let Some(obj) = layer {
            if Object::ptr_eq(&obj, self) {
                return Err(Exception::type_error("Cyclic __proto__ value"));
            }
            layer = obj.proto();
        }
        *lock(&self.inner.proto) = proto;
        Ok(())
    }

    /// Enumerable property names, own first, then inherited, without duplicates.
    pub fn enumerable_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut shadowed: Vec<String> = Vec::new();
        let mut layer = Some(self.clone());
        while let Some(obj) = layer {
            for (name, prop) in obj.own_properties() {
                if keys.contains(&name) || shadowed.contains(&name) {
                    continue;
                }
                if prop.is_enumerable() {
                    keys.push(name);
                } else {
                    shadowed.push(name);
                }
            }
            layer = obj.proto();
        }
        keys
    }

    // ------------------------------------------------------------------------
    //  Property access
    // ------------------------------------------------------------------------

    /// Reads a property, walking the prototype chain and running getters.
    pub fn get(&self, name: &str) -> Result<Value, Exception> {
        if let Some(callable) = &self.inner.callable {
            if !self.has_own_raw(name) {
                match name {
                    "name" => return Ok(Value::String(callable.name.clone())),
                    "length" => return Ok(Value::Number(callable.length as f64)),
                    _ => {}
                }
            }
        }

        let mut layer = Some(self.clone());
        while let Some(obj) = layer {
            match obj.get_own_property(name) {
                Some(Property::Data { value, .. }) => return Ok(value),
                Some(Property::Accessor { get: Some(getter), .. }) => {
                    return getter.call(Value::Object(self.clone()), Vec::new());
                }
                Some(Property::Accessor { get: None, .. }) => return Ok(Value::Undefined),
                None => layer = obj.proto(),
            }
        }
        Ok(Value::Undefined)
    }

    /// Assigns a property, running setters found on the chain.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), Exception> {
        let value = value.into();
        self.load();

        let mut layer = Some(self.clone());
        while let Some(obj) = layer {
            match obj.own_raw(name) {
                Some(Property::Data { writable: false, .. }) => {
                    return Err(Exception::type_error(format!(
                        "Cannot assign to read only property '{}' of object '{}'",
                        name,
                        self.class_name()
                    )));
                }
                Some(Property::Data { writable: true, enumerable, .. }) => {
                    let enumerable = if Object::ptr_eq(&obj, self) { enumerable } else { true };
                    self.define(name, Property::Data { value, writable: true, enumerable });
                    return Ok(());
                }
                Some(Property::Accessor { set: Some(setter), .. }) => {
                    setter.call(Value::Object(self.clone()), vec![value])?;
                    return Ok(());
                }
                Some(Property::Accessor { set: None, .. }) => {
                    return Err(Exception::type_error(format!(
                        "Cannot set property {} of #<{}> which has only a getter",
                        name,
                        self.class_name()
                    )));
                }
                None => layer = obj.proto(),
            }
        }

        self.define(name, Property::data(value));
        Ok(())
    }

    // ------------------------------------------------------------------------
    //  Calls
    // ------------------------------------------------------------------------

    pub fn is_callable(&self) -> bool {
        self.inner.callable.is_some()
    }

    pub fn callable(&self) -> Option<&Callable> {
        self.inner.callable.as_ref()
    }

    /// The function name, or `None` for non-callable objects.
    pub fn name(&self) -> Option<&str> {
        self.inner.callable.as_ref().map(|c| c.name.as_str())
    }

    pub fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Exception> {
        let Some(callable) = &self.inner.callable else {
            return Err(Exception::type_error(format!("{} is not a function", self.class_name())));
        };
        (callable.body)(Invocation { this, args, construct: false, callee: self.clone() })
    }

    /// Runs the function as a `new` expression.
    ///
    /// `this` is a fresh object whose prototype is the function's `prototype`
    /// property. An object returned by the body replaces it.
    pub fn construct(&self, args: Vec<Value>) -> Result<Value, Exception> {
        let callable = match &self.inner.callable {
            Some(c) if c.constructible => c,
            _ => {
                let name = self.name().unwrap_or(self.class_name()).to_string();
                return Err(Exception::type_error(format!("{} is not a constructor", name)));
            }
        };

        let instance = Object::build(callable.name.clone(), None, None, self.inner.location);
        if let Value::Object(prototype) = self.get("prototype")? {
            instance.set_proto(Some(prototype))?;
        }

        let result = (callable.body)(Invocation {
            this: Value::Object(instance.clone()),
            args,
            construct: true,
            callee: self.clone(),
        })?;

        match result {
            Value::Object(_) => Ok(result),
            _ => Ok(Value::Object(instance)),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Object::ptr_eq(self, other)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "[Function: {}]", if name.is_empty() { "(anonymous)" } else { name }),
            None => write!(f, "[{} {:#x}]", self.class_name(), self.addr()),
        }
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakObject(dead: {})", self.is_dead())
    }
}
