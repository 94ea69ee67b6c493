//! # Meta Values
//!
//! Wire descriptions of values crossing the boundary.
//!
//! ## Invariants
//!
//! - Only `MetaValue::Object` and `MetaValue::Function` carry a handle id; every other
//!   variant is a self-contained copy.
//! - Only the client direction can reference a handle (`remote-object`) or a callback
//!   (`function`); only the host direction can signal a failed call (`exception`).

/// Process-global identifier of one host object as seen by one context.
pub type HandleId = u64;

/// A structurally simple value that is copied, never referenced.
#[derive(Debug, Clone, PartialEq)]
pub enum Plain {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    RegExp { source: String, flags: String },
    /// A typed binary view, copied by value.
    Bytes(Vec<u8>),
    List(Vec<Plain>),
    Record(Vec<(String, Plain)>),
}

impl Plain {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Plain::Undefined => "undefined",
            Plain::Null => "null",
            Plain::Bool(_) => "bool",
            Plain::Number(_) => "number",
            Plain::String(_) => "string",
            Plain::Date(_) => "date",
            Plain::RegExp { .. } => "regexp",
            Plain::Bytes(_) => "bytes",
            Plain::List(_) => "list",
            Plain::Record(_) => "record",
        }
    }
}

impl From<&str> for Plain {
    fn from(s: &str) -> Self { Plain::String(s.to_string()) }
}

impl From<f64> for Plain {
    fn from(n: f64) -> Self { Plain::Number(n) }
}

impl From<bool> for Plain {
    fn from(b: bool) -> Self { Plain::Bool(b) }
}

/// How a member slot behaves on the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A data property holding a function: proxied as a callable.
    Method,
    /// Anything else: proxied as an accessor that round-trips on every read.
    Get,
}

impl MemberKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MemberKind::Method => "method",
            MemberKind::Get => "get",
        }
    }
}

/// One property slot of a remote object, without its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMember {
    pub name: String,
    pub enumerable: bool,
    pub writable: bool,
    pub kind: MemberKind,
}

impl ObjectMember {
    pub fn method(name: impl Into<String>) -> Self {
        Self { name: name.into(), enumerable: true, writable: false, kind: MemberKind::Method }
    }

    pub fn accessor(name: impl Into<String>, writable: bool) -> Self {
        Self { name: name.into(), enumerable: true, writable, kind: MemberKind::Get }
    }
}

/// One layer of a remote prototype chain. `None` marks the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoFrame {
    pub members: Vec<ObjectMember>,
    pub proto: Option<Box<ProtoFrame>>,
}

impl ProtoFrame {
    /// Number of layers from this frame down to the root.
    pub fn depth(&self) -> usize {
        1 + self.proto.as_ref().map_or(0, |p| p.depth())
    }
}

/// Descriptor of a live host object or function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectMeta {
    pub id: HandleId,
    /// Constructor name of the real value, or empty.
    pub name: String,
    pub members: Vec<ObjectMember>,
    pub proto: Option<Box<ProtoFrame>>,
}

/// Which side of the boundary produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Host,
    Client,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Host => "host",
            ProcessKind::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(ProcessKind::Host),
            "client" => Some(ProcessKind::Client),
            _ => None,
        }
    }
}

/// The transferable core of an error: constructor name, message, stack and cause chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub from: ProcessKind,
    pub cause: Option<Box<SerializedError>>,
}

/// One bitmap of an image at a given scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRepresentation {
    pub scale_factor: f64,
    pub width: u32,
    pub height: u32,
    pub buffer: Vec<u8>,
}

/// An image flattened into its representations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SerializedImage {
    pub representations: Vec<ImageRepresentation>,
}

/// Host → client wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Value(Plain),
    Buffer(Vec<u8>),
    Date(f64),
    Array(Vec<MetaValue>),
    Object(RemoteObjectMeta),
    Function(RemoteObjectMeta),
    /// An error value with its own enumerable properties flattened alongside.
    Error { error: SerializedError, members: Vec<(String, MetaValue)> },
    /// The call itself failed; the payload is whatever was thrown.
    Exception(Box<MetaValue>),
    /// A thenable; `then` is a function meta that forwards to the real `then`.
    Promise { then: Box<MetaValue> },
    NativeImage(SerializedImage),
}

impl MetaValue {
    pub fn null() -> Self {
        MetaValue::Value(Plain::Null)
    }

    pub fn undefined() -> Self {
        MetaValue::Value(Plain::Undefined)
    }

    /// The wire type string.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetaValue::Value(_) => "value",
            MetaValue::Buffer(_) => "buffer",
            MetaValue::Date(_) => "date",
            MetaValue::Array(_) => "array",
            MetaValue::Object(_) => "object",
            MetaValue::Function(_) => "function",
            MetaValue::Error { .. } => "error",
            MetaValue::Exception(_) => "exception",
            MetaValue::Promise { .. } => "promise",
            MetaValue::NativeImage(_) => "nativeimage",
        }
    }

    /// The handle carried by an object or function descriptor.
    pub fn handle_id(&self) -> Option<HandleId> {
        match self {
            MetaValue::Object(m) | MetaValue::Function(m) => Some(m.id),
            _ => None,
        }
    }
}

/// Client → host wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValueFromClient {
    Value(Plain),
    /// Back-reference to a handle the host issued earlier.
    RemoteObject { id: HandleId },
    Array(Vec<MetaValueFromClient>),
    Buffer(Vec<u8>),
    Date(f64),
    Promise { then: Box<MetaValueFromClient> },
    /// A client-side plain object, copied member by member.
    Object { name: String, members: Vec<(String, MetaValueFromClient)> },
    /// A function known to always return this value; invoking it needs no round trip.
    FunctionWithReturnValue(Box<MetaValueFromClient>),
    /// A client-side callback.
    Function { id: u64, location: String, length: u32 },
    NativeImage(SerializedImage),
}

impl MetaValueFromClient {
    pub fn null() -> Self {
        MetaValueFromClient::Value(Plain::Null)
    }

    /// The wire type string.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetaValueFromClient::Value(_) => "value",
            MetaValueFromClient::RemoteObject { .. } => "remote-object",
            MetaValueFromClient::Array(_) => "array",
            MetaValueFromClient::Buffer(_) => "buffer",
            MetaValueFromClient::Date(_) => "date",
            MetaValueFromClient::Promise { .. } => "promise",
            MetaValueFromClient::Object { .. } => "object",
            MetaValueFromClient::FunctionWithReturnValue(_) => "function-with-return-value",
            MetaValueFromClient::Function { .. } => "function",
            MetaValueFromClient::NativeImage(_) => "nativeimage",
        }
    }
}
