//! # Host Marshalling
//!
//! Converts between runtime values and wire metas on the host side.
//!
//! Outbound, anything with identity is pinned in the registry and described by
//! its member layout. Inbound, back-references resolve to the pinned originals and
//! client callbacks become stand-in functions that notify the client when called.

use std::collections::HashSet;
use std::sync::Arc;

use remorpc::MAX_DEPTH;
use remorpc::MemberKind;
use remorpc::MetaValue;
use remorpc::MetaValueFromClient;
use remorpc::NOTIFY_CHANNEL;
use remorpc::Notification;
use remorpc::ObjectMember;
use remorpc::Plain;
use remorpc::ProcessKind;
use remorpc::ProtoFrame;
use remorpc::RemoteObjectMeta;
use remorpc::SerializedError;
use remorpc::SerializedImage;
use tracing::debug;
use tracing::warn;

use super::Endpoint;
use super::Host;
use super::rpc_error;
use crate::object::Object;
use crate::object::Property;
use crate::promise::Promise;
use crate::transport::FrameId;
use crate::value::ErrorValue;
use crate::value::Exception;
use crate::value::NativeImage;
use crate::value::Value;

/// Own properties every function has that are never exposed as members.
const FUNCTION_PROPERTIES: [&str; 5] = ["length", "name", "arguments", "caller", "prototype"];

impl Host {
    // ========================================================================
    //  Outbound
    // ========================================================================

    /// Describes `value` for `context`, pinning every object it references.
    ///
    /// With `optimize`, objects the simple-object policy accepts are copied
    /// instead of referenced.
    pub(crate) fn value_to_meta(&self, context: &str, value: Value, optimize: bool) -> MetaValue {
        match value {
            Value::Buffer(bytes) => MetaValue::Buffer(bytes),
            Value::Date(ms) => MetaValue::Date(ms),
            Value::Image(image) => MetaValue::NativeImage(SerializedImage { representations: image.representations }),
            Value::Array(items) => {
                MetaValue::Array(items.into_iter().map(|v| self.value_to_meta(context, v, optimize)).collect())
            }
            Value::Error(error) => {
                let mut members: Vec<(String, MetaValue)> = error
                    .props
                    .iter()
                    .map(|(name, v)| (name.clone(), self.value_to_meta(context, v.clone(), false)))
                    .collect();
                // Error causes ride in the serialized chain; anything else travels as a member.
                if let Some(cause) = error.cause.as_deref().filter(|c| !matches!(c, Value::Error(_))) {
                    members.push(("cause".to_string(), self.value_to_meta(context, cause.clone(), false)));
                }
                MetaValue::Error { error: serialize_error(&error), members }
            }
            Value::Promise(promise) => self.promise_meta(context, promise),
            Value::Object(object) => {
                if optimize && !object.is_callable() && (self.config.simple_policy)(&object) {
                    let mut seen = HashSet::new();
                    return MetaValue::Value(copy_simple(&object, &mut seen, 0));
                }
                if object.is_callable() {
                    MetaValue::Function(self.object_meta(context, &object))
                } else {
                    MetaValue::Object(self.object_meta(context, &object))
                }
            }
            other => MetaValue::Value(other.to_plain().unwrap_or(Plain::Undefined)),
        }
    }

    fn object_meta(&self, context: &str, object: &Object) -> RemoteObjectMeta {
        let id = self.registry.add(context, object);

        let mut layers = Vec::new();
        let mut layer = object.proto();
        while let Some(proto) = layer {
            if layers.len() >= MAX_DEPTH {
                break;
            }
            layer = proto.proto();
            layers.push(proto);
        }
        let proto = layers
            .iter()
            .rev()
            .fold(None, |below, layer| Some(Box::new(ProtoFrame { members: members_of(layer, false), proto: below })));

        RemoteObjectMeta {
            id,
            name: object.class_name().to_string(),
            members: members_of(object, object.is_callable()),
            proto,
        }
    }

    /// A promise travels as a `then` function forwarding to the real one. The
    /// forwarder returns nothing, so reading the result never starts another chain.
    fn promise_meta(&self, context: &str, promise: Promise) -> MetaValue {
        // Keeps a rejection from being reported as unhandled on the host.
        promise.on_settled(|_| {});

        let then = Object::function("then", 2, move |inv| {
            let on_fulfilled = inv.arg(0).as_object().filter(|o| o.is_callable()).cloned();
            let on_rejected = inv.arg(1).as_object().filter(|o| o.is_callable()).cloned();
            promise.then(on_fulfilled, on_rejected);
            Ok(Value::Undefined)
        });
        MetaValue::Promise { then: Box::new(self.value_to_meta(context, Value::Object(then), false)) }
    }

    // ========================================================================
    //  Inbound
    // ========================================================================

    pub(crate) fn unwrap_args(
        &self,
        endpoint: &Arc<Endpoint>,
        frame: FrameId,
        context: &str,
        args: Vec<MetaValueFromClient>,
    ) -> Result<Vec<Value>, Exception> {
        args.into_iter().map(|meta| self.client_meta_to_value(endpoint, frame, context, meta)).collect()
    }

    fn client_meta_to_value(
        &self,
        endpoint: &Arc<Endpoint>,
        frame: FrameId,
        context: &str,
        meta: MetaValueFromClient,
    ) -> Result<Value, Exception> {
        let value = match meta {
            MetaValueFromClient::Value(plain) => Value::from_plain(plain),
            MetaValueFromClient::RemoteObject { id } => {
                let object = self
                    .registry
                    .get(context, id)
                    .ok_or_else(|| rpc_error(format!("Cannot pass missing remote object {}", id)))?;
                Value::Object(object)
            }
            MetaValueFromClient::Array(items) => Value::Array(self.unwrap_args(endpoint, frame, context, items)?),
            MetaValueFromClient::Buffer(bytes) => Value::Buffer(bytes),
            MetaValueFromClient::Date(ms) => Value::Date(ms),
            MetaValueFromClient::Promise { then } => {
                let then = self.client_meta_to_value(endpoint, frame, context, *then)?;
                Value::Promise(adopt_thenable(then))
            }
            MetaValueFromClient::Object { name, members } => {
                let object = Object::new(if name.is_empty() { "Object".to_string() } else { name });
                for (key, member) in members {
                    let member = self.client_meta_to_value(endpoint, frame, context, member)?;
                    object.define(key, Property::data(member));
                }
                Value::Object(object)
            }
            MetaValueFromClient::FunctionWithReturnValue(inner) => {
                let value = self.client_meta_to_value(endpoint, frame, context, *inner)?;
                Value::Object(Object::function("", 0, move |_| Ok(value.clone())))
            }
            MetaValueFromClient::Function { id, location, length } => {
                Value::Object(self.callback_stand_in(endpoint, frame, context, id, &location, length))
            }
            MetaValueFromClient::NativeImage(image) => {
                Value::Image(NativeImage { representations: image.representations })
            }
        };
        Ok(value)
    }

    /// The host function standing in for client callback `id` of `context`.
    ///
    /// Calling it notifies the client. Once it is dropped, the client is told to
    /// release the original.
    fn callback_stand_in(
        &self,
        endpoint: &Arc<Endpoint>,
        frame: FrameId,
        context: &str,
        id: u64,
        location: &str,
        length: u32,
    ) -> Object {
        if let Some(stand_in) = self.callbacks.get(context, id) {
            return stand_in;
        }

        let host = self.this.clone();
        let target = Arc::downgrade(endpoint);
        let ctx = context.to_string();
        let origin = location.to_string();
        let stand_in = Object::function("", length, move |inv| {
            let delivered = match (host.upgrade(), target.upgrade()) {
                (Some(host), Some(endpoint)) if !endpoint.is_destroyed() => {
                    host.send_callback(&endpoint, frame, &ctx, id, inv.args.clone())
                }
                _ => false,
            };
            if !delivered {
                remove_remote_listeners_and_log_warning(&inv.this, &inv.callee, &origin);
            }
            Ok(Value::Undefined)
        });

        let cache = self.callbacks.clone();
        let target = Arc::downgrade(endpoint);
        let ctx = context.to_string();
        stand_in.on_finalize(move || {
            cache.forget(&ctx, id);
            let Some(endpoint) = target.upgrade() else {
                return;
            };
            if endpoint.is_destroyed() {
                return;
            }
            let release = Notification::ReleaseCallback { context: ctx, id };
            match release.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = endpoint.sink().send_to_frame(frame, NOTIFY_CHANNEL, &bytes) {
                        debug!(id, error = %e, "release-callback not delivered");
                    }
                }
                Err(e) => warn!(id, error = %e, "release-callback could not be encoded"),
            }
        });

        self.callbacks.insert(context, id, &stand_in, location);
        stand_in
    }

    /// Returns false when the client could not be reached.
    fn send_callback(&self, endpoint: &Endpoint, frame: FrameId, context: &str, id: u64, args: Vec<Value>) -> bool {
        let args = self.value_to_meta(context, Value::Array(args), false);
        let notification = Notification::Callback { context: context.to_string(), id, args };
        let bytes = match notification.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(context, id, error = %e, "callback arguments could not be encoded");
                return true;
            }
        };
        match endpoint.sink().send_to_frame(frame, NOTIFY_CHANNEL, &bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(context, id, error = %e, "callback not delivered");
                false
            }
        }
    }
}

/// The wire form of an error and its chain of error causes. A cause that is not an
/// error is sent as the `cause` member instead.
pub(crate) fn serialize_error(error: &ErrorValue) -> SerializedError {
    let cause = match error.cause.as_deref() {
        Some(Value::Error(cause)) => Some(Box::new(serialize_error(cause))),
        _ => None,
    };
    SerializedError {
        name: error.name.clone(),
        message: error.message.clone(),
        stack: error.stack.clone(),
        from: ProcessKind::Host,
        cause,
    }
}

/// Detaches a dead client callback from `sender`'s events and logs where it came from.
pub fn remove_remote_listeners_and_log_warning(sender: &Value, callback: &Object, location: &str) {
    let mut message = format!(
        "Attempting to call a function in a client context that has been closed or released.\nFunction provided here: {}",
        location
    );

    if let Some(emitter) = sender.as_object().and_then(Object::emitter) {
        let events: Vec<String> = emitter
            .event_names()
            .into_iter()
            .filter(|event| emitter.listeners(event).iter().any(|l| Object::ptr_eq(l, callback)))
            .collect();
        for event in &events {
            while emitter.remove_listener(event, callback) {}
        }
        if !events.is_empty() {
            message.push_str(&format!("\nRemote event names: {}", events.join(", ")));
        }
    }

    warn!("{}", message);
}

fn members_of(object: &Object, skip_function_properties: bool) -> Vec<ObjectMember> {
    object
        .own_properties()
        .into_iter()
        .filter(|(name, _)| !(skip_function_properties && FUNCTION_PROPERTIES.contains(&name.as_str())))
        .map(|(name, prop)| match prop {
            Property::Data { value, enumerable, .. } if value.is_callable() => {
                ObjectMember { name, enumerable, writable: false, kind: MemberKind::Method }
            }
            Property::Data { writable, enumerable, .. } => {
                ObjectMember { name, enumerable, writable, kind: MemberKind::Get }
            }
            Property::Accessor { set, enumerable, .. } => {
                ObjectMember { name, enumerable, writable: set.is_some(), kind: MemberKind::Get }
            }
        })
        .collect()
}

/// Copies the enumerable data of a simple object. Functions are left out and a
/// reference back to an enclosing object becomes `null`.
fn copy_simple(object: &Object, seen: &mut HashSet<usize>, depth: usize) -> Plain {
    if depth >= MAX_DEPTH || !seen.insert(object.addr()) {
        return Plain::Null;
    }
    let mut fields = Vec::new();
    for (name, prop) in object.own_properties() {
        let Property::Data { value, enumerable: true, .. } = prop else {
            continue;
        };
        if let Some(copy) = copy_value(&value, seen, depth + 1) {
            fields.push((name, copy));
        }
    }
    seen.remove(&object.addr());
    Plain::Record(fields)
}

fn copy_value(value: &Value, seen: &mut HashSet<usize>, depth: usize) -> Option<Plain> {
    match value {
        Value::Object(o) if o.is_callable() => None,
        Value::Object(o) => Some(copy_simple(o, seen, depth)),
        Value::Array(items) if depth < MAX_DEPTH => Some(Plain::List(
            items.iter().map(|v| copy_value(v, seen, depth + 1).unwrap_or(Plain::Null)).collect(),
        )),
        Value::Buffer(bytes) => Some(Plain::Bytes(bytes.clone())),
        other => other.to_plain(),
    }
}

/// Follows a client thenable into a host promise. A `then` that throws rejects it.
fn adopt_thenable(then: Value) -> Promise {
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
