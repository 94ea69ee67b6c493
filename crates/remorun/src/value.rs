//! # Values
//!
//! The dynamic values the runtime moves around on either side of the boundary.
//!
//! Arrays, errors and images have value semantics and are copied freely.
//! Objects and promises are shared and compare by identity.

use std::fmt;
use std::panic::Location;

use remorpc::ImageRepresentation;
use remorpc::Plain;
use remorpc::ProcessKind;

use crate::object::Object;
use crate::object::Property;
use crate::promise::Promise;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    RegExp { source: String, flags: String },
    /// A typed binary view. Copied like a primitive.
    Bytes(Vec<u8>),
    /// A binary buffer. Travels as its own wire type.
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    Error(ErrorValue),
    Image(NativeImage),
    Promise(Promise),
    Object(Object),
}

impl Value {
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        self.as_object().is_some_and(Object::is_callable)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Converts a copyable value into its wire form.
    ///
    /// Returns `None` for anything that must travel by reference or by its own meta type.
    pub fn to_plain(&self) -> Option<Plain> {
        let plain = match self {
            Value::Undefined => Plain::Undefined,
            Value::Null => Plain::Null,
            Value::Bool(b) => Plain::Bool(*b),
            Value::Number(n) => Plain::Number(*n),
            Value::String(s) => Plain::String(s.clone()),
            Value::Date(ms) => Plain::Date(*ms),
            Value::RegExp { source, flags } => Plain::RegExp { source: source.clone(), flags: flags.clone() },
            Value::Bytes(b) => Plain::Bytes(b.clone()),
            _ => return None,
        };
        Some(plain)
    }

    /// Rebuilds a value from its wire form. Records become fresh plain objects.
    pub fn from_plain(plain: Plain) -> Value {
        match plain {
            Plain::Undefined => Value::Undefined,
            Plain::Null => Value::Null,
            Plain::Bool(b) => Value::Bool(b),
            Plain::Number(n) => Value::Number(n),
            Plain::String(s) => Value::String(s),
            Plain::Date(ms) => Value::Date(ms),
            Plain::RegExp { source, flags } => Value::RegExp { source, flags },
            Plain::Bytes(b) => Value::Bytes(b),
            Plain::List(items) => Value::Array(items.into_iter().map(Value::from_plain).collect()),
            Plain::Record(fields) => {
                let object = Object::plain();
                for (name, value) in fields {
                    object.define(name, Property::data(Value::from_plain(value)));
                }
                Value::Object(object)
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self { Value::Number(n) }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self { Value::Number(n as f64) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self { Value::Object(o) }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self { Value::Promise(p) }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self { Value::Error(e) }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self { Value::Array(items) }
}

/// An error object: constructor name, message, stack, cause and own enumerable properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// The process that serialized the error, once it has crossed the boundary.
    pub from: Option<ProcessKind>,
    pub cause: Option<Box<Value>>,
    pub props: Vec<(String, Value)>,
}

impl ErrorValue {
    /// Creates an error whose stack points at the caller.
    #[track_caller]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let stack = format!("{}: {}\n    at {}", name, message, Location::caller());
        Self { name, message, stack: Some(stack), from: None, cause: None, props: Vec::new() }
    }

    #[track_caller]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    #[track_caller]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    #[track_caller]
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new("RangeError", message)
    }

    pub fn with_cause(mut self, cause: impl Into<Value>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_prop(name, value);
        self
    }

    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set_prop(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.props.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.props.push((name, value)),
        }
    }
}

/// An image held as a set of bitmaps at different scale factors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeImage {
    pub representations: Vec<ImageRepresentation>,
}

impl NativeImage {
    pub fn add_representation(&mut self, scale_factor: f64, width: u32, height: u32, buffer: Vec<u8>) {
        self.representations.push(ImageRepresentation { scale_factor, width, height, buffer });
    }
}

/// A thrown value.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception(pub Value);

impl Exception {
    #[track_caller]
    pub fn error(message: impl Into<String>) -> Self {
        Exception(Value::Error(ErrorValue::error(message)))
    }

    #[track_caller]
    pub fn type_error(message: impl Into<String>) -> Self {
        Exception(Value::Error(ErrorValue::type_error(message)))
    }

    #[track_caller]
    pub fn range_error(message: impl Into<String>) -> Self {
        Exception(Value::Error(ErrorValue::range_error(message)))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The error message, or a rendering of the thrown value when it is not an error.
    pub fn message(&self) -> String {
        match &self.0 {
            Value::Error(e) => e.message.clone(),
            Value::String(s) => s.clone(),
            other => format!("{:?}", other),
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match &self.0 {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::Error(e) => write!(f, "{}: {}", e.name, e.message),
            _ => write!(f, "Uncaught {}", self.message()),
        }
    }
}

impl std::error::Error for Exception {}

impl From<ErrorValue> for Exception {
    fn from(e: ErrorValue) -> Self { Exception(Value::Error(e)) }
}

/// One call into a callable object.
pub struct Invocation {
    pub this: Value,
    pub args: Vec<Value>,
    /// Whether the call is a `new` expression.
    pub construct: bool,
    /// The function being invoked.
    pub callee: Object,
}

impl Invocation {
    /// The argument at `index`, or `undefined` when absent.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Undefined)
    }
}
