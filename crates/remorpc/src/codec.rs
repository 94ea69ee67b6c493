//! # Codec
//!
//! The translation layer between meta values and the `remopack` byte format.
//!
//! Every meta value is written as `variant(type) { map { fields } }`, using the
//! protocol's type strings. Unknown fields are skipped on decode; unknown type
//! strings are a serialization error for the whole frame.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_DEPTH`.
//! - **Panic Safety**: Every decoding path returns `Result`.

use remopack::Decoder;
use remopack::Encoder;

use crate::error::Result;
use crate::error::RpcError;
use crate::meta::ImageRepresentation;
use crate::meta::MemberKind;
use crate::meta::MetaValue;
use crate::meta::MetaValueFromClient;
use crate::meta::ObjectMember;
use crate::meta::Plain;
use crate::meta::ProcessKind;
use crate::meta::ProtoFrame;
use crate::meta::RemoteObjectMeta;
use crate::meta::SerializedError;
use crate::meta::SerializedImage;
use crate::MAX_DEPTH;

// ============================================================================
//  Plain
// ============================================================================

/// Encodes a plain (copied) value.
pub fn encode_plain(enc: &mut Encoder, plain: &Plain) -> Result<()> {
    encode_plain_impl(enc, plain, 0)
}

fn encode_plain_impl(enc: &mut Encoder, plain: &Plain, depth: usize) -> Result<()> {
    check_depth(depth)?;
    enc.variant_begin(plain.tag())?;
    match plain {
        Plain::Undefined => enc.undefined()?,
        Plain::Null => enc.null()?,
        Plain::Bool(b) => enc.bool(*b)?,
        Plain::Number(n) | Plain::Date(n) => enc.f64(*n)?,
        Plain::String(s) => enc.str(s)?,
        Plain::RegExp { source, flags } => {
            enc.map_begin()?;
            write_str(enc, "source", source)?;
            write_str(enc, "flags", flags)?;
            enc.map_end()?;
        }
        Plain::Bytes(b) => enc.bytes(b)?,
        Plain::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_plain_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Plain::Record(fields) => {
            enc.map_begin()?;
            for (name, value) in fields {
                enc.variant_begin(name)?;
                encode_plain_impl(enc, value, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
        }
    }
    enc.variant_end()?;
    Ok(())
}

/// Decodes a plain value.
pub fn decode_plain(dec: &mut Decoder) -> Result<Plain> {
    decode_plain_impl(dec, 0)
}

fn decode_plain_impl(dec: &mut Decoder, depth: usize) -> Result<Plain> {
    check_depth(depth)?;
    let (tag, mut body) = dec.variant()?;
    let plain = match tag {
        "undefined" => { body.undefined()?; Plain::Undefined }
        "null" => { body.null()?; Plain::Null }
        "bool" => Plain::Bool(body.bool()?),
        "number" => Plain::Number(body.f64()?),
        "string" => Plain::String(body.str()?.to_string()),
        "date" => Plain::Date(body.f64()?),
        "regexp" => {
            let mut source = None;
            let mut flags = None;
            for entry in body.map()? {
                let (key, mut val) = entry?;
                match key {
                    "source" => source = Some(val.str()?.to_string()),
                    "flags" => flags = Some(val.str()?.to_string()),
                    _ => val.skip()?,
                }
            }
            Plain::RegExp { source: required(source, "source")?, flags: flags.unwrap_or_default() }
        }
        "bytes" => Plain::Bytes(body.bytes()?.to_vec()),
        "list" => {
            let mut items = Vec::new();
            for item in body.list()? {
                items.push(decode_plain_impl(&mut item?, depth + 1)?);
            }
            Plain::List(items)
        }
        "record" => {
            let mut fields = Vec::new();
            for entry in body.map()? {
                let (key, mut val) = entry?;
                fields.push((key.to_string(), decode_plain_impl(&mut val, depth + 1)?));
            }
            Plain::Record(fields)
        }
        other => return Err(RpcError::UnknownVariant(format!("plain value: {}", other))),
    };
    Ok(plain)
}

// ============================================================================
//  Host → client
// ============================================================================

/// Encodes a host → client meta value.
///
/// # Errors
/// Returns `RpcError::RecursionLimitExceeded` if the value is too deeply nested.
pub fn encode_meta(enc: &mut Encoder, meta: &MetaValue) -> Result<()> {
    encode_meta_impl(enc, meta, 0)
}

fn encode_meta_impl(enc: &mut Encoder, meta: &MetaValue, depth: usize) -> Result<()> {
    check_depth(depth)?;
    enc.variant_begin(meta.type_name())?;
    enc.map_begin()?;
    match meta {
        MetaValue::Value(plain) => {
            enc.variant_begin("value")?;
            encode_plain_impl(enc, plain, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValue::Buffer(bytes) => write_bytes(enc, "value", bytes)?,
        MetaValue::Date(ms) => write_f64(enc, "value", *ms)?,
        MetaValue::Array(members) => {
            enc.variant_begin("members")?;
            enc.list_begin()?;
            for member in members {
                encode_meta_impl(enc, member, depth + 1)?;
            }
            enc.list_end()?;
            enc.variant_end()?;
        }
        MetaValue::Object(object) | MetaValue::Function(object) => {
            encode_remote_object(enc, object, depth)?;
        }
        MetaValue::Error { error, members } => {
            enc.variant_begin("value")?;
            encode_error(enc, error, depth + 1)?;
            enc.variant_end()?;

            enc.variant_begin("members")?;
            enc.map_begin()?;
            for (name, value) in members {
                enc.variant_begin(name)?;
                encode_meta_impl(enc, value, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
            enc.variant_end()?;
        }
        MetaValue::Exception(inner) => {
            enc.variant_begin("value")?;
            encode_meta_impl(enc, inner, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValue::Promise { then } => {
            enc.variant_begin("then")?;
            encode_meta_impl(enc, then, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValue::NativeImage(image) => encode_image(enc, image)?,
    }
    enc.map_end()?;
    enc.variant_end()?;
    Ok(())
}

fn encode_remote_object(enc: &mut Encoder, object: &RemoteObjectMeta, depth: usize) -> Result<()> {
    write_u64(enc, "id", object.id)?;
    write_str(enc, "name", &object.name)?;
    enc.variant_begin("members")?;
    encode_members(enc, &object.members)?;
    enc.variant_end()?;
    enc.variant_begin("proto")?;
    encode_proto(enc, object.proto.as_deref(), depth + 1)?;
    enc.variant_end()?;
    Ok(())
}

fn encode_members(enc: &mut Encoder, members: &[ObjectMember]) -> Result<()> {
    enc.list_begin()?;
    for member in members {
        enc.map_begin()?;
        write_str(enc, "name", &member.name)?;
        write_bool(enc, "enumerable", member.enumerable)?;
        write_bool(enc, "writable", member.writable)?;
        write_str(enc, "type", member.kind.as_str())?;
        enc.map_end()?;
    }
    enc.list_end()?;
    Ok(())
}

fn encode_proto(enc: &mut Encoder, proto: Option<&ProtoFrame>, depth: usize) -> Result<()> {
    check_depth(depth)?;
    let Some(frame) = proto else {
        return Ok(enc.option_none()?);
    };
    enc.option_some_begin()?;
    enc.map_begin()?;
    enc.variant_begin("members")?;
    encode_members(enc, &frame.members)?;
    enc.variant_end()?;
    enc.variant_begin("proto")?;
    encode_proto(enc, frame.proto.as_deref(), depth + 1)?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.option_some_end()?;
    Ok(())
}

fn encode_error(enc: &mut Encoder, error: &SerializedError, depth: usize) -> Result<()> {
    check_depth(depth)?;
    enc.map_begin()?;
    write_str(enc, "name", &error.name)?;
    write_str(enc, "message", &error.message)?;
    enc.variant_begin("stack")?;
    match &error.stack {
        Some(stack) => {
            enc.option_some_begin()?;
            enc.str(stack)?;
            enc.option_some_end()?;
        }
        None => enc.option_none()?,
    }
    enc.variant_end()?;
    write_str(enc, "from", error.from.as_str())?;
    enc.variant_begin("cause")?;
    match &error.cause {
        Some(cause) => {
            enc.option_some_begin()?;
            encode_error(enc, cause, depth + 1)?;
            enc.option_some_end()?;
        }
        None => enc.option_none()?,
    }
    enc.variant_end()?;
    enc.map_end()?;
    Ok(())
}

fn encode_image(enc: &mut Encoder, image: &SerializedImage) -> Result<()> {
    enc.variant_begin("representations")?;
    enc.list_begin()?;
    for rep in &image.representations {
        enc.map_begin()?;
        write_f64(enc, "scaleFactor", rep.scale_factor)?;
        write_u32(enc, "width", rep.width)?;
        write_u32(enc, "height", rep.height)?;
        write_bytes(enc, "buffer", &rep.buffer)?;
        enc.map_end()?;
    }
    enc.list_end()?;
    enc.variant_end()?;
    Ok(())
}

/// Decodes a host → client meta value.
pub fn decode_meta(dec: &mut Decoder) -> Result<MetaValue> {
    decode_meta_impl(dec, 0)
}

fn decode_meta_impl(dec: &mut Decoder, depth: usize) -> Result<MetaValue> {
    check_depth(depth)?;
    let (type_name, mut body) = dec.variant()?;
    let fields = body.map()?;

    let meta = match type_name {
        "value" | "buffer" | "date" => {
            let mut value = None;
            for entry in fields {
                let (key, mut val) = entry?;
                match key {
                    "value" => value = Some(val),
                    _ => val.skip()?,
                }
            }
            let mut value = required(value, "value")?;
            match type_name {
                "value" => MetaValue::Value(decode_plain_impl(&mut value, depth + 1)?),
                "buffer" => MetaValue::Buffer(value.bytes()?.to_vec()),
                _ => MetaValue::Date(value.f64()?),
            }
        }
        "array" => {
            let mut members = None;
            for entry in fields {
                let (key, mut val) = entry?;
                match key {
                    "members" => {
                        let mut items = Vec::new();
                        for item in val.list()? {
                            items.push(decode_meta_impl(&mut item?, depth + 1)?);
                        }
                        members = Some(items);
                    }
                    _ => val.skip()?,
                }
            }
            MetaValue::Array(required(members, "members")?)
        }
        "object" | "function" => {
            let object = decode_remote_object(fields, depth)?;
            if type_name == "object" { MetaValue::Object(object) } else { MetaValue::Function(object) }
        }
        "error" => {
            let mut error = None;
            let mut members = Vec::new();
            for entry in fields {
                let (key, mut val) = entry?;
                match key {
                    "value" => error = Some(decode_error(&mut val, depth + 1)?),
                    "members" => {
                        for member in val.map()? {
                            let (name, mut value) = member?;
                            members.push((name.to_string(), decode_meta_impl(&mut value, depth + 1)?));
                        }
                    }
                    _ => val.skip()?,
                }
            }
            MetaValue::Error { error: required(error, "value")?, members }
        }
        "exception" | "promise" => {
            let key_name = if type_name == "exception" { "value" } else { "then" };
            let mut inner = None;
            for entry in fields {
                let (key, mut val) = entry?;
                if key == key_name {
                    inner = Some(decode_meta_impl(&mut val, depth + 1)?);
                } else {
                    val.skip()?;
                }
            }
            let inner = Box::new(required(inner, key_name)?);
            if type_name == "exception" { MetaValue::Exception(inner) } else { MetaValue::Promise { then: inner } }
        }
        "nativeimage" => MetaValue::NativeImage(decode_image(fields)?),
        other => return Err(RpcError::UnknownVariant(other.to_string())),
    };
    Ok(meta)
}

fn decode_remote_object(fields: remopack::MapIter, depth: usize) -> Result<RemoteObjectMeta> {
    let mut id = None;
    let mut name = None;
    let mut members = None;
    let mut proto = None;
    for entry in fields {
        let (key, mut val) = entry?;
        match key {
            "id" => id = Some(val.u64()?),
            "name" => name = Some(val.str()?.to_string()),
            "members" => members = Some(decode_members(&mut val)?),
            "proto" => proto = Some(decode_proto(&mut val, depth + 1)?),
            _ => val.skip()?,
        }
    }
    Ok(RemoteObjectMeta {
        id: required(id, "id")?,
        name: name.unwrap_or_default(),
        members: members.unwrap_or_default(),
        proto: proto.flatten(),
    })
}

fn decode_members(dec: &mut Decoder) -> Result<Vec<ObjectMember>> {
    let mut members = Vec::new();
    for item in dec.list()? {
        let mut name = None;
        let mut enumerable = false;
        let mut writable = false;
        let mut kind = None;
        for entry in item?.map()? {
            let (key, mut val) = entry?;
            match key {
                "name" => name = Some(val.str()?.to_string()),
                "enumerable" => enumerable = val.bool()?,
                "writable" => writable = val.bool()?,
                "type" => {
                    kind = Some(match val.str()? {
                        "method" => MemberKind::Method,
                        "get" => MemberKind::Get,
                        other => return Err(RpcError::UnknownVariant(format!("member type: {}", other))),
                    })
                }
                _ => val.skip()?,
            }
        }
        members.push(ObjectMember {
            name: required(name, "name")?,
            enumerable,
            writable,
            kind: required(kind, "type")?,
        });
    }
    Ok(members)
}

fn decode_proto(dec: &mut Decoder, depth: usize) -> Result<Option<Box<ProtoFrame>>> {
    check_depth(depth)?;
    let Some(mut some) = dec.option()? else {
        return Ok(None);
    };
    let mut members = Vec::new();
    let mut proto = None;
    for entry in some.map()? {
        let (key, mut val) = entry?;
        match key {
            "members" => members = decode_members(&mut val)?,
            "proto" => proto = decode_proto(&mut val, depth + 1)?,
            _ => val.skip()?,
        }
    }
    Ok(Some(Box::new(ProtoFrame { members, proto })))
}

fn decode_error(dec: &mut Decoder, depth: usize) -> Result<SerializedError> {
    check_depth(depth)?;
    let mut name = None;
    let mut message = None;
    let mut stack = None;
    let mut from = ProcessKind::Host;
    let mut cause = None;
    for entry in dec.map()? {
        let (key, mut val) = entry?;
        match key {
            "name" => name = Some(val.str()?.to_string()),
            "message" => message = Some(val.str()?.to_string()),
            "stack" => {
                stack = match val.option()? {
                    Some(mut s) => Some(s.str()?.to_string()),
                    None => None,
                }
            }
            "from" => {
                let raw = val.str()?;
                from = ProcessKind::parse(raw)
                    .ok_or_else(|| RpcError::UnknownVariant(format!("process kind: {}", raw)))?;
            }
            "cause" => {
                cause = match val.option()? {
                    Some(mut c) => Some(Box::new(decode_error(&mut c, depth + 1)?)),
                    None => None,
                }
            }
            _ => val.skip()?,
        }
    }
    Ok(SerializedError {
        name: name.unwrap_or_else(|| "Error".to_string()),
        message: message.unwrap_or_default(),
        stack,
        from,
        cause,
    })
}

fn decode_image(fields: remopack::MapIter) -> Result<SerializedImage> {
    let mut representations = Vec::new();
    for entry in fields {
        let (key, mut val) = entry?;
        if key != "representations" {
            val.skip()?;
            continue;
        }
        for item in val.list()? {
            let mut scale_factor = 1.0;
            let mut width = 0;
            let mut height = 0;
            let mut buffer = Vec::new();
            for field in item?.map()? {
                let (key, mut val) = field?;
                match key {
                    "scaleFactor" => scale_factor = val.f64()?,
                    "width" => width = val.u32()?,
                    "height" => height = val.u32()?,
                    "buffer" => buffer = val.bytes()?.to_vec(),
                    _ => val.skip()?,
                }
            }
            representations.push(ImageRepresentation { scale_factor, width, height, buffer });
        }
    }
    Ok(SerializedImage { representations })
}

// ============================================================================
//  Client → host
// ============================================================================

/// Encodes a client → host meta value.
pub fn encode_client_meta(enc: &mut Encoder, meta: &MetaValueFromClient) -> Result<()> {
    encode_client_meta_impl(enc, meta, 0)
}

fn encode_client_meta_impl(enc: &mut Encoder, meta: &MetaValueFromClient, depth: usize) -> Result<()> {
    check_depth(depth)?;
    enc.variant_begin(meta.type_name())?;
    enc.map_begin()?;
    match meta {
        MetaValueFromClient::Value(plain) => {
            enc.variant_begin("value")?;
            encode_plain_impl(enc, plain, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValueFromClient::RemoteObject { id } => write_u64(enc, "id", *id)?,
        MetaValueFromClient::Array(items) => {
            enc.variant_begin("value")?;
            enc.list_begin()?;
            for item in items {
                encode_client_meta_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
            enc.variant_end()?;
        }
        MetaValueFromClient::Buffer(bytes) => write_bytes(enc, "value", bytes)?,
        MetaValueFromClient::Date(ms) => write_f64(enc, "value", *ms)?,
        MetaValueFromClient::Promise { then } => {
            enc.variant_begin("then")?;
            encode_client_meta_impl(enc, then, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValueFromClient::Object { name, members } => {
            write_str(enc, "name", name)?;
            enc.variant_begin("members")?;
            enc.map_begin()?;
            for (key, value) in members {
                enc.variant_begin(key)?;
                encode_client_meta_impl(enc, value, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
            enc.variant_end()?;
        }
        MetaValueFromClient::FunctionWithReturnValue(value) => {
            enc.variant_begin("value")?;
            encode_client_meta_impl(enc, value, depth + 1)?;
            enc.variant_end()?;
        }
        MetaValueFromClient::Function { id, location, length } => {
            write_u64(enc, "id", *id)?;
            write_str(enc, "location", location)?;
            write_u32(enc, "length", *length)?;
        }
        MetaValueFromClient::NativeImage(image) => encode_image(enc, image)?,
    }
    enc.map_end()?;
    enc.variant_end()?;
    Ok(())
}

/// Decodes a client → host meta value.
pub fn decode_client_meta(dec: &mut Decoder) -> Result<MetaValueFromClient> {
    decode_client_meta_impl(dec, 0)
}

fn decode_client_meta_impl(dec: &mut Decoder, depth: usize) -> Result<MetaValueFromClient> {
    check_depth(depth)?;
    let (type_name, mut body) = dec.variant()?;
    let fields = body.map()?;

    if type_name == "nativeimage" {
        return Ok(MetaValueFromClient::NativeImage(decode_image(fields)?));
    }

    let mut value = None;
    let mut then = None;
    let mut id = None;
    let mut name = None;
    let mut members = None;
    let mut location = None;
    let mut length = None;
    for entry in fields {
        let (key, mut val) = entry?;
        match key {
            "value" => value = Some(val),
            "then" => then = Some(val),
            "id" => id = Some(val.u64()?),
            "name" => name = Some(val.str()?.to_string()),
            "members" => members = Some(val),
            "location" => location = Some(val.str()?.to_string()),
            "length" => length = Some(val.u32()?),
            _ => val.skip()?,
        }
    }

    let meta = match type_name {
        "value" => MetaValueFromClient::Value(decode_plain_impl(&mut required(value, "value")?, depth + 1)?),
        "remote-object" => MetaValueFromClient::RemoteObject { id: required(id, "id")? },
        "array" => {
            let mut items = Vec::new();
            for item in required(value, "value")?.list()? {
                items.push(decode_client_meta_impl(&mut item?, depth + 1)?);
            }
            MetaValueFromClient::Array(items)
        }
        "buffer" => MetaValueFromClient::Buffer(required(value, "value")?.bytes()?.to_vec()),
        "date" => MetaValueFromClient::Date(required(value, "value")?.f64()?),
        "promise" => {
            let then = decode_client_meta_impl(&mut required(then, "then")?, depth + 1)?;
            MetaValueFromClient::Promise { then: Box::new(then) }
        }
        "object" => {
            let mut fields = Vec::new();
            if let Some(mut members) = members {
                for entry in members.map()? {
                    let (key, mut val) = entry?;
                    fields.push((key.to_string(), decode_client_meta_impl(&mut val, depth + 1)?));
                }
            }
            MetaValueFromClient::Object { name: name.unwrap_or_default(), members: fields }
        }
        "function-with-return-value" => {
            let inner = decode_client_meta_impl(&mut required(value, "value")?, depth + 1)?;
            MetaValueFromClient::FunctionWithReturnValue(Box::new(inner))
        }
        "function" => MetaValueFromClient::Function {
            id: required(id, "id")?,
            location: location.unwrap_or_default(),
            length: length.unwrap_or(0),
        },
        other => return Err(RpcError::UnknownVariant(other.to_string())),
    };
    Ok(meta)
}

// ============================================================================
//  Helpers
// ============================================================================

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(RpcError::RecursionLimitExceeded);
    }
    Ok(())
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| RpcError::ProtocolViolation(format!("missing field '{}'", field)))
}

fn write_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_bool(enc: &mut Encoder, key: &str, val: bool) -> Result<()> {
    enc.variant_begin(key)?;
    enc.bool(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_u32(enc: &mut Encoder, key: &str, val: u32) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u32(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_f64(enc: &mut Encoder, key: &str, val: f64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.f64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_bytes(enc: &mut Encoder, key: &str, val: &[u8]) -> Result<()> {
    enc.variant_begin(key)?;
    enc.bytes(val)?;
    enc.variant_end()?;
    Ok(())
}
