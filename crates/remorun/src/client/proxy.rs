//! # Proxies
//!
//! Local stand-ins for host objects.
//!
//! A proxy has the remote object's member layout. Methods and accessors forward
//! to the host on use; nothing is read eagerly. Each proxy owns a
//! [`RemoteHandle`] counting how many times the host handed the object out, and
//! dropping the handle returns all of them at once.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use remorpc::Command;
use remorpc::HandleId;
use remorpc::MemberKind;
use remorpc::MetaValue;
use remorpc::MetaValueFromClient;
use remorpc::ObjectMember;
use remorpc::ProtoFrame;
use remorpc::REQUEST_CHANNEL;
use remorpc::RemoteObjectMeta;
use remorpc::Request;
use tracing::debug;
use tracing::warn;

use super::ClientInner;
use crate::error::Error;
use crate::object::Object;
use crate::object::Property;
use crate::transport::Channel;
use crate::value::Exception;
use crate::value::Value;

/// The client's claim on one host object.
pub struct RemoteHandle {
    id: HandleId,
    context: String,
    channel: Arc<dyn Channel>,
    refs: AtomicU32,
    released: AtomicBool,
    client_released: Arc<AtomicBool>,
}

impl RemoteHandle {
    pub(crate) fn new(id: HandleId, client: &ClientInner) -> Self {
        RemoteHandle {
            id,
            context: client.context_id.clone(),
            channel: Arc::clone(&client.channel),
            refs: AtomicU32::new(1),
            released: AtomicBool::new(false),
            client_released: Arc::clone(&client.released),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// How many times the host has handed this object to the context.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns every reference at once. Later calls do nothing.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // The host already dropped everything this context held.
        if self.client_released.load(Ordering::Acquire) {
            return;
        }

        let count = self.refs();
        let request = Request::new(self.context.clone(), Command::Dereference { id: self.id, count });
        let sent = request.to_bytes().map_err(Error::from).and_then(|bytes| {
            self.channel.send(REQUEST_CHANNEL, &bytes).map_err(Error::from)
        });
        match sent {
            Ok(()) => debug!(id = self.id, count, "dereferenced"),
            Err(e) => warn!(id = self.id, error = %e, "dereference not sent"),
        }
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("refs", &self.refs())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
//  Construction
// ============================================================================

fn connected(client: &Weak<ClientInner>) -> Result<Arc<ClientInner>, Exception> {
    client.upgrade().ok_or_else(|| Error::Released.into_exception())
}

/// Builds the proxy for an object or function descriptor and caches it.
pub(crate) fn build(client: &Arc<ClientInner>, meta: RemoteObjectMeta, callable: bool) -> Object {
    let weak = Arc::downgrade(client);
    let handle = Arc::new(RemoteHandle::new(meta.id, client));
    let id = meta.id;

    let proxy = if callable {
        let client = weak.clone();
        // The handle rides along so a detached call target keeps the host object alive.
        let pinned = Arc::clone(&handle);
        Object::constructor("", 0, move |inv| {
            let client = connected(&client)?;
            let args = client.wrap_args(&inv.args)?;
            let command = if inv.construct {
                Command::Constructor { id: pinned.id, args }
            } else {
                Command::FunctionCall { id: pinned.id, args }
            };
            client.request_value(command).map_err(Error::into_exception)
        })
    } else {
        Object::new(if meta.name.is_empty() { "Object".to_string() } else { meta.name.clone() })
    };

    set_members(&weak, &proxy, &handle, &meta.members);
    if let Some(frame) = meta.proto {
        let _ = proxy.set_proto(Some(proto_chain(&weak, &handle, *frame)));
    }
    proxy.set_remote(Arc::clone(&handle));

    let cache = weak.clone();
    proxy.on_finalize(move || {
        if let Some(client) = cache.upgrade() {
            client.cache.remove_if(&id, |_, proxy| proxy.is_dead());
        }
    });
    client.cache.insert(id, proxy.downgrade());
    proxy
}

/// Prototype layers become plain objects whose members still address the original handle.
fn proto_chain(client: &Weak<ClientInner>, handle: &Arc<RemoteHandle>, frame: ProtoFrame) -> Object {
    let mut frames = Vec::new();
    let mut next = Some(frame);
    while let Some(frame) = next {
        next = frame.proto.map(|p| *p);
        frames.push(frame.members);
    }

    let mut below: Option<Object> = None;
    for members in frames.into_iter().rev() {
        let layer = Object::plain();
        set_members(client, &layer, handle, &members);
        if let Some(proto) = below.take() {
            let _ = layer.set_proto(Some(proto));
        }
        below = Some(layer);
    }
    below.unwrap_or_else(Object::plain)
}

/// Defines one forwarding property per member. Names `target` already has are kept.
fn set_members(client: &Weak<ClientInner>, target: &Object, handle: &Arc<RemoteHandle>, members: &[ObjectMember]) {
    for member in members {
        if target.has_own_raw(&member.name) {
            continue;
        }
        let prop = match member.kind {
            MemberKind::Method => Property::Data {
                value: Value::Object(member_function(client, handle, &member.name)),
                writable: true,
                enumerable: member.enumerable,
            },
            MemberKind::Get => {
                let getter = member_getter(client, handle, &member.name);
                let setter = member.writable.then(|| member_setter(client, handle, &member.name));
                Property::Accessor { get: Some(getter), set: setter, enumerable: member.enumerable }
            }
        };
        target.define(member.name.clone(), prop);
    }
}

/// A method proxy. Its own members are fetched from the host on first inspection.
fn member_function(client: &Weak<ClientInner>, handle: &Arc<RemoteHandle>, name: &str) -> Object {
    let weak = client.clone();
    let pinned = Arc::clone(handle);
    let method = name.to_string();
    let function = Object::constructor(name, 0, move |inv| {
        let client = connected(&weak)?;
        let args = client.wrap_args(&inv.args)?;
        let command = if inv.construct {
            Command::MemberConstructor { id: pinned.id, name: method.clone(), args }
        } else {
            Command::MemberCall { id: pinned.id, name: method.clone(), args }
        };
        client.request_value(command).map_err(Error::into_exception)
    });

    let weak = client.clone();
    let owner = handle.id;
    let method = name.to_string();
    function.set_lazy_loader(move |function| {
        let Some(client) = weak.upgrade() else {
            return;
        };
        let reply = client.request(Command::MemberGet { id: owner, name: method.clone() });
        let meta = match reply {
            Ok(Some(MetaValue::Object(meta) | MetaValue::Function(meta))) => meta,
            Ok(_) => return,
            Err(e) => {
                warn!(method = %method, error = %e, "method members could not be loaded");
                return;
            }
        };
        let member_handle = Arc::new(RemoteHandle::new(meta.id, &client));
        set_members(&weak, function, &member_handle, &meta.members);
    });
    function
}

fn member_getter(client: &Weak<ClientInner>, handle: &Arc<RemoteHandle>, name: &str) -> Object {
    let weak = client.clone();
    let pinned = Arc::clone(handle);
    let member = name.to_string();
    Object::function(format!("get {}", name), 0, move |_| {
        let client = connected(&weak)?;
        client
            .request_value(Command::MemberGet { id: pinned.id, name: member.clone() })
            .map_err(Error::into_exception)
    })
}

fn member_setter(client: &Weak<ClientInner>, handle: &Arc<RemoteHandle>, name: &str) -> Object {
    let weak = client.clone();
    let pinned = Arc::clone(handle);
    let member = name.to_string();
    Object::function(format!("set {}", name), 1, move |inv| {
        let client = connected(&weak)?;
        let value = client.wrap_args(&[inv.arg(0)])?.pop().unwrap_or_else(MetaValueFromClient::null);
        client
            .request(Command::MemberSet { id: pinned.id, name: member.clone(), value })
            .map_err(Error::into_exception)?;
        Ok(Value::Undefined)
    })
}
