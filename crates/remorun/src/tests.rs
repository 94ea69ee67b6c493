use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::Result;
use rand::Rng;
use remorpc::Command;
use remorpc::MetaValue;
use remorpc::MetaValueFromClient;
use remorpc::Plain;
use remorpc::Reply;
use remorpc::Request;

use crate::*;

// ============================================================================
//  HELPERS
// ============================================================================

fn counter() -> (Arc<AtomicUsize>, Object) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let f = Object::function("count", 0, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Undefined)
    });
    (calls, f)
}

fn handle(host: &Host, endpoint: &Arc<Endpoint>, context: &str, command: Command) -> Result<Option<MetaValue>> {
    let bytes = Request::new(context, command).to_bytes()?;
    let Reply(meta) = Reply::from_bytes(&host.handle(endpoint, 0, &bytes))?;
    Ok(meta)
}

fn thrown_message(meta: Option<MetaValue>) -> Option<String> {
    match meta {
        Some(MetaValue::Exception(inner)) => match *inner {
            MetaValue::Error { error, .. } => Some(error.message),
            _ => None,
        },
        _ => None,
    }
}

// ============================================================================
//  OBJECTS
// ============================================================================

#[test]
fn test_layered_lookup() -> Result<()> {
    let base = Object::plain().with("kind", "base").with("shared", 1);
    let middle = Object::plain().with("shared", 2).with_proto(base);
    let top = Object::plain().with_proto(middle);

    assert_eq!(top.get("shared")?, Value::Number(2.0));
    assert_eq!(top.get("kind")?, Value::from("base"));
    assert_eq!(top.get("missing")?, Value::Undefined);
    assert!(!top.has_own("shared"));
    Ok(())
}

#[test]
fn test_prototype_cycle_rejected() {
    let a = Object::plain();
    let b = Object::plain().with_proto(a.clone());
    assert!(a.set_proto(Some(b)).is_err());
    assert!(a.proto().is_none());
}

#[test]
fn test_lazy_loader_runs_once() -> Result<()> {
    let loads = Arc::new(AtomicUsize::new(0));
    let seen = loads.clone();
    let object = Object::plain();
    object.set_lazy_loader(move |o| {
        seen.fetch_add(1, Ordering::SeqCst);
        o.define("late", Property::data(7));
    });

    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert_eq!(object.get("late")?, Value::Number(7.0));
    assert_eq!(object.own_keys(), vec!["late".to_string()]);
    assert_eq!(object.get("other")?, Value::Undefined);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_calling_does_not_load() -> Result<()> {
    let loads = Arc::new(AtomicUsize::new(0));
    let seen = loads.clone();
    let f = Object::function("f", 0, |_| Ok(Value::from(3)));
    f.set_lazy_loader(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(f.call(Value::Undefined, vec![])?, Value::Number(3.0));
    assert_eq!(f.get("name")?, Value::from("f"));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_set_semantics() -> Result<()> {
    let stored = Arc::new(std::sync::Mutex::new(Value::Undefined));
    let sink = stored.clone();
    let object = Object::plain()
        .with_accessor("ro", |_| Ok(Value::from(1)), None)
        .with_accessor(
            "rw",
            |_| Ok(Value::from(2)),
            Some(Arc::new(move |inv: value::Invocation| {
                *sink.lock().unwrap() = inv.arg(0);
                Ok(Value::Undefined)
            })),
        );
    object.define("fixed", Property::read_only(5));

    let err = object.set("ro", 9).unwrap_err();
    assert_eq!(err.message(), "Cannot set property ro of #<Object> which has only a getter");
    assert!(object.set("fixed", 9).is_err());

    object.set("rw", 4)?;
    assert_eq!(*stored.lock().unwrap(), Value::Number(4.0));
    assert_eq!(object.get("rw")?, Value::Number(2.0));

    object.set("fresh", "x")?;
    assert_eq!(object.get("fresh")?, Value::from("x"));
    Ok(())
}

#[test]
fn test_construct_uses_prototype() -> Result<()> {
    let point = Object::constructor("Point", 2, |inv| {
        if let Value::Object(this) = &inv.this {
            this.set("x", inv.arg(0))?;
        }
        Ok(Value::Undefined)
    });
    if let Value::Object(prototype) = point.get("prototype")? {
        prototype.define("dims", Property::data(2));
    }

    let instance = point.construct(vec![Value::from(5)])?;
    let instance = instance.as_object().cloned().ok_or_else(|| anyhow::anyhow!("not an object"))?;
    assert_eq!(instance.class_name(), "Point");
    assert_eq!(instance.get("x")?, Value::Number(5.0));
    assert_eq!(instance.get("dims")?, Value::Number(2.0));

    let plain = Object::function("plain", 0, |_| Ok(Value::Undefined));
    assert_eq!(plain.construct(vec![]).unwrap_err().message(), "plain is not a constructor");
    Ok(())
}

#[test]
fn test_finalizer_runs_on_last_drop() {
    let (calls, _) = counter();
    let seen = calls.clone();
    let object = Object::plain();
    object.on_finalize(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let clone = object.clone();
    drop(object);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    drop(clone);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
//  PROMISES AND EMITTERS
// ============================================================================

#[test]
fn test_promise_then_chains() -> Result<()> {
    let promise = Promise::new();
    let double = Object::function("double", 1, |inv| Ok(Value::from(inv.arg(0).as_number().unwrap_or(0.0) * 2.0)));
    let derived = promise.then(Some(double), None);
    assert_eq!(derived.state(), PromiseState::Pending);

    promise.resolve(21);
    assert_eq!(derived.state(), PromiseState::Fulfilled(Value::Number(42.0)));

    let failed = Promise::rejected("nope").then(None, None);
    assert_eq!(failed.state(), PromiseState::Rejected(Value::from("nope")));
    Ok(())
}

#[test]
fn test_emitter_identity_removal() -> Result<()> {
    let emitter = EventEmitter::default();
    let (calls, listener) = counter();
    emitter.on("tick", listener.clone());
    emitter.on("tick", listener.clone());
    emitter.on("tock", listener.clone());

    assert!(emitter.emit(Value::Undefined, "tick", vec![])?);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(emitter.event_names(), vec!["tick".to_string(), "tock".to_string()]);

    assert!(emitter.remove_listener("tick", &listener));
    assert_eq!(emitter.listener_count("tick"), 1);
    assert!(!emitter.emit(Value::Undefined, "none", vec![])?);
    Ok(())
}

// ============================================================================
//  REGISTRIES
// ============================================================================

#[test]
fn test_registry_handle_stability() {
    let registry = ObjectRegistry::new();
    let object = Object::plain();
    let first = registry.add("ctx", &object);
    let second = registry.add("ctx", &object);
    assert_eq!(first, second);
    assert_eq!(registry.count("ctx", first), Some(2));

    let other = registry.add("other", &object);
    assert_ne!(first, other);
    assert!(registry.get("other", first).is_none());
    assert!(registry.get("ctx", first).is_some_and(|o| Object::ptr_eq(&o, &object)));

    assert_eq!(registry.clear("ctx"), 1);
    assert!(registry.get("ctx", first).is_none());
    assert!(registry.get("other", other).is_some_and(|o| Object::ptr_eq(&o, &object)));
}

#[test]
fn test_registry_clamps_over_release() {
    let registry = ObjectRegistry::new();
    let object = Object::plain();
    let id = registry.add("ctx", &object);
    registry.add("ctx", &object);

    registry.remove("ctx", id, 5);
    assert!(registry.get("ctx", id).is_none());
    registry.remove("ctx", id, 1);
    assert!(registry.is_empty());
}

#[test]
fn test_registry_random_refcounts() {
    let mut rng = rand::thread_rng();
    let registry = ObjectRegistry::new();
    let objects: Vec<Object> = (0..8).map(|_| Object::plain()).collect();
    let mut expected = vec![0u32; objects.len()];
    let mut ids = vec![0u64; objects.len()];

    for _ in 0..500 {
        let i = rng.gen_range(0..objects.len());
        if expected[i] == 0 || rng.gen_bool(0.6) {
            ids[i] = registry.add("ctx", &objects[i]);
            expected[i] += 1;
        } else {
            let by = rng.gen_range(1..=expected[i]);
            registry.remove("ctx", ids[i], by);
            expected[i] -= by;
        }
        let live = if expected[i] == 0 { None } else { Some(expected[i]) };
        assert_eq!(registry.count("ctx", ids[i]), live);
    }

    assert_eq!(registry.len(), expected.iter().filter(|&&c| c > 0).count());
    registry.clear("ctx");
    assert!(registry.is_empty());
}

#[test]
fn test_callbacks_registry() -> Result<()> {
    let callbacks = CallbacksRegistry::new();
    let (calls, f) = counter();
    let id = callbacks.add(&f);
    assert_eq!(callbacks.add(&f), id);
    assert_eq!(callbacks.len(), 1);
    assert!(callbacks.location(id).is_some_and(|l| l.contains("tests.rs")));

    callbacks.apply(id, vec![])?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    callbacks.remove(id);
    assert!(!callbacks.contains(id));
    assert_eq!(callbacks.apply(id, vec![])?, Value::Undefined);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

// ============================================================================
//  HOST DISPATCH
// ============================================================================

#[test]
fn test_malformed_request_replies_with_exception() -> Result<()> {
    let host = Host::builder().build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));
    let Reply(meta) = Reply::from_bytes(&host.handle(&endpoint, 0, &[0xff, 0x00]))?;
    let message = thrown_message(meta).unwrap_or_default();
    assert!(message.starts_with("Malformed remote request"), "{}", message);
    Ok(())
}

fn protocol_error(meta: Option<MetaValue>) -> Option<String> {
    let Some(MetaValue::Exception(inner)) = meta else { return None };
    let MetaValue::Error { error, members } = *inner else { return None };
    let code = members.contains(&("code".to_string(), MetaValue::Value(Plain::String("EBADRPC".into()))));
    let errno = members.contains(&("errno".to_string(), MetaValue::Value(Plain::Number(-72.0))));
    (code && errno).then_some(error.message)
}

#[test]
fn test_member_get_on_missing_handle() -> Result<()> {
    let host = Host::builder().build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));
    let meta = handle(&host, &endpoint, "ctx", Command::MemberGet { id: 999_999, name: "a".into() })?;
    assert_eq!(protocol_error(meta).as_deref(), Some("Cannot get property 'a' on missing remote object 999999"));
    Ok(())
}

#[test]
fn test_every_handle_command_rejects_missing_ids() -> Result<()> {
    let module = Object::plain().with_method("echo", 1, |inv| Ok(inv.arg(0)));
    let host = Host::builder().module("m", module).build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));

    let Some(MetaValue::Object(meta)) = handle(&host, &endpoint, "ctx", Command::Require { module: "m".into() })? else {
        anyhow::bail!("expected an object");
    };
    let live = meta.id;
    let Some(MetaValue::Object(released)) = handle(&host, &endpoint, "ctx", Command::Require { module: "m".into() })?
    else {
        anyhow::bail!("expected an object");
    };
    assert_eq!(released.id, live);
    handle(&host, &endpoint, "ctx", Command::Dereference { id: live, count: 1 })?;
    let Some(MetaValue::Object(other)) = handle(&host, &endpoint, "other", Command::Require { module: "m".into() })?
    else {
        anyhow::bail!("expected an object");
    };

    let missing = 987_654;
    let cases = vec![
        Command::Constructor { id: missing, args: vec![] },
        Command::FunctionCall { id: missing, args: vec![] },
        Command::MemberConstructor { id: missing, name: "echo".into(), args: vec![] },
        Command::MemberCall { id: missing, name: "echo".into(), args: vec![] },
        Command::MemberSet { id: missing, name: "a".into(), value: MetaValueFromClient::null() },
        Command::MemberGet { id: missing, name: "a".into() },
        // Handles are scoped to the context that received them.
        Command::MemberGet { id: other.id, name: "echo".into() },
        Command::MemberCall {
            id: live,
            name: "echo".into(),
            args: vec![MetaValueFromClient::RemoteObject { id: missing }],
        },
    ];
    for command in cases {
        let name = command.name();
        let meta = handle(&host, &endpoint, "ctx", command)?;
        assert!(protocol_error(meta).is_some(), "{} did not fail with EBADRPC", name);
    }

    // Fully dereferenced handles are gone as well.
    handle(&host, &endpoint, "ctx", Command::Dereference { id: live, count: 1 })?;
    let meta = handle(&host, &endpoint, "ctx", Command::MemberCall { id: live, name: "echo".into(), args: vec![] })?;
    assert!(protocol_error(meta).is_some_and(|m| m.contains("missing remote object")));
    Ok(())
}

#[test]
fn test_require_enable_gate() -> Result<()> {
    let host = Host::builder().module("m", Object::plain()).require_enable(true).build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));

    let blocked = handle(&host, &endpoint, "ctx", Command::Require { module: "m".into() })?;
    assert!(thrown_message(blocked).is_some_and(|m| m.starts_with("remote is disabled")));
    assert_eq!(handle(&host, &endpoint, "ctx", Command::ContextRelease)?, None);

    endpoint.enable();
    let allowed = handle(&host, &endpoint, "ctx", Command::Require { module: "m".into() })?;
    assert!(matches!(allowed, Some(MetaValue::Object(_))));
    Ok(())
}

#[test]
fn test_optimized_result_copies_simple_objects() -> Result<()> {
    let config = Object::plain().with("debug", true).with("level", 3).simple();
    let module = Object::plain().with_method("config", 0, move |_| Ok(Value::Object(config.clone())));
    let host = Host::builder().module("settings", module).build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));

    let Some(MetaValue::Object(meta)) = handle(&host, &endpoint, "ctx", Command::Require { module: "settings".into() })?
    else {
        anyhow::bail!("expected an object");
    };
    let reply = handle(&host, &endpoint, "ctx", Command::MemberCall { id: meta.id, name: "config".into(), args: vec![] })?;
    let expected = Plain::Record(vec![("debug".into(), Plain::Bool(true)), ("level".into(), Plain::Number(3.0))]);
    assert_eq!(reply, Some(MetaValue::Value(expected)));

    let reply = handle(&host, &endpoint, "ctx", Command::MemberGet { id: meta.id, name: "config".into() })?;
    assert!(matches!(reply, Some(MetaValue::Function(_))));
    Ok(())
}

#[test]
fn test_dates_use_the_date_meta() -> Result<()> {
    let started = Value::Date(1_700_000_000_000.0);
    let host = Host::builder().global("started", started.clone()).global("both", vec![started]).build();
    let endpoint = Arc::new(Endpoint::new(Arc::new(loopback::QueueSink::new().0)));

    let reply = handle(&host, &endpoint, "ctx", Command::GetGlobal { name: "started".into() })?;
    assert_eq!(reply, Some(MetaValue::Date(1_700_000_000_000.0)));
    let reply = handle(&host, &endpoint, "ctx", Command::GetGlobal { name: "both".into() })?;
    assert_eq!(reply, Some(MetaValue::Array(vec![MetaValue::Date(1_700_000_000_000.0)])));
    Ok(())
}
