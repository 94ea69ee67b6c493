//! # Protocol Frames
//!
//! The envelopes carried by the two logical channels.
//!
//! - `remote:request` (client → host, synchronous): `list[command, context, ...args]`.
//!   The command name is the first positional field; the reply is an option holding a
//!   host meta value, where `none` is the explicit empty sentinel.
//! - `remote:notify` (host → client, fire-and-forget): `list[kind, context, id, ...args]`.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Exactness**: A frame must consume the whole payload; trailing bytes are rejected.

use remopack::Decoder;
use remopack::Encoder;
use remopack::ListIter;

use crate::codec::decode_client_meta;
use crate::codec::decode_meta;
use crate::codec::encode_client_meta;
use crate::codec::encode_meta;
use crate::error::Result;
use crate::error::RpcError;
use crate::meta::HandleId;
use crate::meta::MetaValue;
use crate::meta::MetaValueFromClient;

/// Channel carrying synchronous client → host requests.
pub const REQUEST_CHANNEL: &str = "remote:request";

/// Channel carrying asynchronous host → client notifications.
pub const NOTIFY_CHANNEL: &str = "remote:notify";

/// One client → host command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// The client received a notification addressed to another context.
    WrongContextError { context: String, id: u64 },
    Require { module: String },
    GetBuiltin { name: String },
    GetGlobal { name: String },
    GetCurrentWindow,
    GetCurrentWebContents,
    Constructor { id: HandleId, args: Vec<MetaValueFromClient> },
    FunctionCall { id: HandleId, args: Vec<MetaValueFromClient> },
    MemberConstructor { id: HandleId, name: String, args: Vec<MetaValueFromClient> },
    MemberCall { id: HandleId, name: String, args: Vec<MetaValueFromClient> },
    MemberSet { id: HandleId, name: String, value: MetaValueFromClient },
    MemberGet { id: HandleId, name: String },
    Dereference { id: HandleId, count: u32 },
    ContextRelease,
}

impl Command {
    /// The wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::WrongContextError { .. } => "wrong-context-error",
            Command::Require { .. } => "require",
            Command::GetBuiltin { .. } => "get-builtin",
            Command::GetGlobal { .. } => "get-global",
            Command::GetCurrentWindow => "get-current-window",
            Command::GetCurrentWebContents => "get-current-web-contents",
            Command::Constructor { .. } => "constructor",
            Command::FunctionCall { .. } => "function-call",
            Command::MemberConstructor { .. } => "member-constructor",
            Command::MemberCall { .. } => "member-call",
            Command::MemberSet { .. } => "member-set",
            Command::MemberGet { .. } => "member-get",
            Command::Dereference { .. } => "dereference",
            Command::ContextRelease => "context-release",
        }
    }
}

/// A request as it travels on `remote:request`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub context: String,
    pub command: Command,
}

impl Request {
    pub fn new(context: impl Into<String>, command: Command) -> Self {
        Self { context: context.into(), command }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.list_begin()?;
        enc.str(self.command.name())?;
        enc.str(&self.context)?;

        match &self.command {
            Command::WrongContextError { context, id } => {
                enc.str(context)?;
                enc.u64(*id)?;
            }
            Command::Require { module } => enc.str(module)?,
            Command::GetBuiltin { name } | Command::GetGlobal { name } => enc.str(name)?,
            Command::GetCurrentWindow | Command::GetCurrentWebContents | Command::ContextRelease => {}
            Command::Constructor { id, args } | Command::FunctionCall { id, args } => {
                enc.u64(*id)?;
                encode_args(enc, args)?;
            }
            Command::MemberConstructor { id, name, args } | Command::MemberCall { id, name, args } => {
                enc.u64(*id)?;
                enc.str(name)?;
                encode_args(enc, args)?;
            }
            Command::MemberSet { id, name, value } => {
                enc.u64(*id)?;
                enc.str(name)?;
                encode_client_meta(enc, value)?;
            }
            Command::MemberGet { id, name } => {
                enc.u64(*id)?;
                enc.str(name)?;
            }
            Command::Dereference { id, count } => {
                enc.u64(*id)?;
                enc.u32(*count)?;
            }
        }

        enc.list_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut items = dec.list()?;
        let name = items.expect_next()?.str()?;
        let context = items.expect_next()?.str()?.to_string();

        let command = match name {
            "wrong-context-error" => Command::WrongContextError {
                context: items.expect_next()?.str()?.to_string(),
                id: items.expect_next()?.u64()?,
            },
            "require" => Command::Require { module: next_string(&mut items)? },
            "get-builtin" => Command::GetBuiltin { name: next_string(&mut items)? },
            "get-global" => Command::GetGlobal { name: next_string(&mut items)? },
            "get-current-window" => Command::GetCurrentWindow,
            "get-current-web-contents" => Command::GetCurrentWebContents,
            "constructor" | "function-call" => {
                let id = items.expect_next()?.u64()?;
                let args = decode_args(&mut items.expect_next()?)?;
                if name == "constructor" {
                    Command::Constructor { id, args }
                } else {
                    Command::FunctionCall { id, args }
                }
            }
            "member-constructor" | "member-call" => {
                let id = items.expect_next()?.u64()?;
                let member = next_string(&mut items)?;
                let args = decode_args(&mut items.expect_next()?)?;
                if name == "member-constructor" {
                    Command::MemberConstructor { id, name: member, args }
                } else {
                    Command::MemberCall { id, name: member, args }
                }
            }
            "member-set" => Command::MemberSet {
                id: items.expect_next()?.u64()?,
                name: next_string(&mut items)?,
                value: decode_client_meta(&mut items.expect_next()?)?,
            },
            "member-get" => Command::MemberGet {
                id: items.expect_next()?.u64()?,
                name: next_string(&mut items)?,
            },
            "dereference" => Command::Dereference {
                id: items.expect_next()?.u64()?,
                count: items.expect_next()?.u32()?,
            },
            "context-release" => Command::ContextRelease,
            other => return Err(RpcError::UnknownVariant(format!("command: {}", other))),
        };

        if items.next().is_some() {
            return Err(RpcError::ProtocolViolation(format!("Too many arguments for '{}'", name)));
        }
        Ok(Request { context, command })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let request = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(request)
    }
}

/// The synchronous answer to a request. `Reply(None)` is the explicit empty sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply(pub Option<MetaValue>);

impl Reply {
    pub fn empty() -> Self {
        Reply(None)
    }

    pub fn value(meta: MetaValue) -> Self {
        Reply(Some(meta))
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match &self.0 {
            None => enc.option_none()?,
            Some(meta) => {
                enc.option_some_begin()?;
                encode_meta(enc, meta)?;
                enc.option_some_end()?;
            }
        }
        Ok(())
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        match dec.option()? {
            None => Ok(Reply(None)),
            Some(mut inner) => Ok(Reply(Some(decode_meta(&mut inner)?))),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let reply = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(reply)
    }
}

/// A host → client notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Invoke the client callback `id`; `args` is an `array` meta.
    Callback { context: String, id: u64, args: MetaValue },
    /// The host no longer holds callback `id`.
    ReleaseCallback { context: String, id: u64 },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Callback { .. } => "renderer-callback",
            Notification::ReleaseCallback { .. } => "renderer-release-callback",
        }
    }

    pub fn context(&self) -> &str {
        match self {
            Notification::Callback { context, .. } | Notification::ReleaseCallback { context, .. } => context,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Notification::Callback { id, .. } | Notification::ReleaseCallback { id, .. } => *id,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.list_begin()?;
        enc.str(self.kind())?;
        enc.str(self.context())?;
        enc.u64(self.id())?;
        if let Notification::Callback { args, .. } = self {
            encode_meta(enc, args)?;
        }
        enc.list_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut items = dec.list()?;
        let kind = items.expect_next()?.str()?;
        let context = items.expect_next()?.str()?.to_string();
        let id = items.expect_next()?.u64()?;

        let notification = match kind {
            "renderer-callback" => {
                let args = decode_meta(&mut items.expect_next()?)?;
                Notification::Callback { context, id, args }
            }
            "renderer-release-callback" => Notification::ReleaseCallback { context, id },
            other => return Err(RpcError::UnknownVariant(format!("notification: {}", other))),
        };

        if items.next().is_some() {
            return Err(RpcError::ProtocolViolation(format!("Too many arguments for '{}'", kind)));
        }
        Ok(notification)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let notification = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(notification)
    }
}

fn encode_args(enc: &mut Encoder, args: &[MetaValueFromClient]) -> Result<()> {
    enc.list_begin()?;
    for arg in args {
        encode_client_meta(enc, arg)?;
    }
    enc.list_end()?;
    Ok(())
}

fn decode_args(dec: &mut Decoder) -> Result<Vec<MetaValueFromClient>> {
    let mut args = Vec::new();
    for item in dec.list()? {
        args.push(decode_client_meta(&mut item?)?);
    }
    Ok(args)
}

fn next_string(items: &mut ListIter) -> Result<String> {
    Ok(items.expect_next()?.str()?.to_string())
}
