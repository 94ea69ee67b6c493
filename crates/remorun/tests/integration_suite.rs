use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use remorpc::Command;
use remorpc::MetaValue;
use remorpc::NOTIFY_CHANNEL;
use remorpc::Notification;
use remorpc::Plain;
use remorpc::REQUEST_CHANNEL;
use remorpc::Reply;
use remorpc::Request;

use remorun::Channel;
use remorun::Error;
use remorun::Exception;
use remorun::Host;
use remorun::Object;
use remorun::Promise;
use remorun::PromiseState;
use remorun::RemoteClient;
use remorun::RemoteEventKind;
use remorun::Value;
use remorun::logging;
use remorun::loopback;
use remorun::loopback::LoopbackChannel;
use remorun::transport;

// ============================================================================
//  HELPERS
// ============================================================================

fn greeter() -> Object {
    Object::plain().with("a", 1).with_method("greet", 0, |_| Ok(Value::from("hi")))
}

fn object(value: Value) -> anyhow::Result<Object> {
    value.as_object().cloned().ok_or_else(|| anyhow::anyhow!("expected an object, got {:?}", value))
}

fn method(target: &Object, name: &str) -> anyhow::Result<Object> {
    object(target.get(name)?)
}

fn call(target: &Object, name: &str, args: Vec<Value>) -> Result<Value, Exception> {
    let function = target.get(name)?;
    match function.as_object() {
        Some(f) => f.call(Value::Object(target.clone()), args),
        None => Err(Exception::type_error(format!("{} is not a function", name))),
    }
}

fn raw(channel: &dyn Channel, context: &str, command: Command) -> anyhow::Result<Option<MetaValue>> {
    let bytes = Request::new(context, command).to_bytes()?;
    let Reply(meta) = Reply::from_bytes(&channel.send_sync(REQUEST_CHANNEL, &bytes)?)?;
    Ok(meta)
}

fn thrown_code(meta: Option<MetaValue>) -> Option<Plain> {
    let Some(MetaValue::Exception(inner)) = meta else { return None };
    let MetaValue::Error { members, .. } = *inner else { return None };
    members.into_iter().find(|(name, _)| name == "code").and_then(|(_, m)| match m {
        MetaValue::Value(plain) => Some(plain),
        _ => None,
    })
}

fn remote_message(error: Error) -> String {
    match error {
        Error::Remote(thrown) => thrown.message(),
        other => format!("not a remote error: {}", other),
    }
}

/// Counts requests by command name before passing them on.
struct CountingChannel {
    inner: Arc<LoopbackChannel>,
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl CountingChannel {
    fn new(inner: Arc<LoopbackChannel>) -> Self {
        Self { inner, counts: Mutex::new(HashMap::new()) }
    }

    fn count(&self, command: &str) -> usize {
        self.counts.lock().unwrap().get(command).copied().unwrap_or(0)
    }

    fn record(&self, payload: &[u8]) {
        if let Ok(request) = Request::from_bytes(payload) {
            *self.counts.lock().unwrap().entry(request.command.name()).or_default() += 1;
        }
    }
}

impl Channel for CountingChannel {
    fn send_sync(&self, channel: &str, payload: &[u8]) -> transport::Result<Vec<u8>> {
        self.record(payload);
        self.inner.send_sync(channel, payload)
    }

    fn send(&self, channel: &str, payload: &[u8]) -> transport::Result<()> {
        self.record(payload);
        self.inner.send(channel, payload)
    }
}

// ============================================================================
//  SCENARIOS
// ============================================================================

#[test]
fn test_object_exposure_on_the_wire() -> anyhow::Result<()> {
    logging::init();
    let host = Host::builder().module("greeter", greeter()).build();
    let connection = loopback::connect(&host);
    let channel = connection.channel.as_ref();

    let Some(MetaValue::Object(meta)) = raw(channel, "c1", Command::Require { module: "greeter".into() })? else {
        anyhow::bail!("expected an object meta");
    };
    assert_eq!(meta.name, "Object");

    let a = raw(channel, "c1", Command::MemberGet { id: meta.id, name: "a".into() })?;
    assert_eq!(a, Some(MetaValue::Value(Plain::Number(1.0))));

    let greet = raw(channel, "c1", Command::MemberCall { id: meta.id, name: "greet".into(), args: vec![] })?;
    assert_eq!(greet, Some(MetaValue::Value(Plain::String("hi".into()))));
    Ok(())
}

#[test]
fn test_object_exposure_through_proxy() -> anyhow::Result<()> {
    let host = Host::builder().module("greeter", greeter()).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let greeter = object(client.require("greeter")?)?;
    assert_eq!(greeter.get("a")?, Value::Number(1.0));
    assert_eq!(call(&greeter, "greet", vec![])?, Value::from("hi"));

    greeter.set("a", 5)?;
    assert_eq!(greeter.get("a")?, Value::Number(5.0));
    Ok(())
}

#[tokio::test]
async fn test_callback_round_trip() -> anyhow::Result<()> {
    logging::init();
    let slot: Arc<Mutex<Option<Object>>> = Arc::new(Mutex::new(None));
    let keep = slot.clone();
    let events = Object::plain().with_method("subscribe", 1, move |inv| {
        *keep.lock().unwrap() = inv.arg(0).as_object().cloned();
        Ok(Value::Undefined)
    });
    let host = Host::builder().module("events", events).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let seen = calls.clone();
    let f = Object::function("f", 1, move |inv| {
        seen.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(inv.arg(0));
        Ok(Value::Undefined)
    });

    let events = object(client.require("events")?)?;
    call(&events, "subscribe", vec![Value::Object(f)])?;

    let notifications = connection.notifications;
    let pump = {
        let client = client.clone();
        tokio::spawn(async move { client.pump(notifications).await })
    };

    let stand_in = slot.lock().unwrap().clone().ok_or_else(|| anyhow::anyhow!("no callback stored"))?;
    stand_in.call(Value::Undefined, vec![Value::from(42)])?;

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(received, Some(Value::Number(42.0)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    pump.abort();
    Ok(())
}

#[test]
fn test_released_callback_is_not_invoked() -> anyhow::Result<()> {
    logging::init();
    let host = Host::builder().build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let f = Object::function("f", 0, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Undefined)
    });
    let id = client.callbacks().add(&f);
    let invoke = Notification::Callback {
        context: client.context_id().to_string(),
        id,
        args: MetaValue::Array(vec![]),
    }
    .to_bytes()?;

    client.handle_message(NOTIFY_CHANNEL, &invoke)?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.callbacks().remove(id);
    client.handle_message(NOTIFY_CHANNEL, &invoke)?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_context_teardown() -> anyhow::Result<()> {
    let host = Host::builder()
        .module("one", Object::plain().with("n", 1))
        .module("two", Object::plain().with("n", 2))
        .module("three", Object::plain().with("n", 3))
        .build();
    let connection = loopback::connect(&host);
    let channel = connection.channel.as_ref();

    let mut ids = Vec::new();
    for module in ["one", "two", "three"] {
        let meta = raw(channel, "c2", Command::Require { module: module.into() })?;
        ids.push(meta.and_then(|m| m.handle_id()).ok_or_else(|| anyhow::anyhow!("no handle"))?);
    }
    raw(channel, "c3", Command::Require { module: "one".into() })?;
    assert_eq!(host.registry().len(), 4);

    assert_eq!(raw(channel, "c2", Command::ContextRelease)?, None);
    assert_eq!(host.registry().len(), 1);

    for id in ids {
        let reply = raw(channel, "c2", Command::MemberGet { id, name: "n".into() })?;
        assert_eq!(thrown_code(reply), Some(Plain::String("EBADRPC".into())));
    }
    Ok(())
}

// ============================================================================
//  PROPERTIES
// ============================================================================

#[test]
fn test_proxy_identity_and_refcount() -> anyhow::Result<()> {
    let host = Host::builder().module("greeter", greeter()).build();
    let connection = loopback::connect(&host);
    let client = RemoteClient::builder(connection.channel.clone()).context_id("identity").build();

    let first = object(client.require("greeter")?)?;
    let second = object(client.require("greeter")?)?;
    assert!(Object::ptr_eq(&first, &second));

    let handle = first.remote().ok_or_else(|| anyhow::anyhow!("not a proxy"))?;
    let id = handle.id();
    assert_eq!(handle.refs(), 2);
    assert_eq!(host.registry().count("identity", id), Some(2));

    drop(first);
    drop(second);
    assert_eq!(host.registry().count("identity", id), None);
    assert_eq!(client.proxy_count(), 0);
    Ok(())
}

#[test]
fn test_lazy_method_hydration() -> anyhow::Result<()> {
    let tool = Object::function("tool", 0, |_| Ok(Value::from("used"))).with("version", 2);
    let host = Host::builder().module("kit", Object::plain().with("tool", tool)).build();
    let connection = loopback::connect(&host);
    let counting = Arc::new(CountingChannel::new(connection.channel.clone()));
    let client = RemoteClient::builder(counting.clone()).build();

    let kit = object(client.require("kit")?)?;
    let tool = method(&kit, "tool")?;
    assert_eq!(counting.count("member-get"), 0);

    assert_eq!(tool.call(Value::Object(kit.clone()), vec![])?, Value::from("used"));
    assert_eq!(counting.count("member-call"), 1);
    assert_eq!(counting.count("member-get"), 0);

    assert!(tool.own_keys().contains(&"version".to_string()));
    assert_eq!(counting.count("member-get"), 1);
    tool.own_keys();
    assert_eq!(counting.count("member-get"), 1);

    assert_eq!(tool.get("version")?, Value::Number(2.0));
    Ok(())
}

#[test]
fn test_circular_values() -> anyhow::Result<()> {
    let looped = Object::plain().with("name", "host-loop").simple();
    looped.set("me", looped.clone())?;
    let echo = Object::plain()
        .with_method("inspect", 1, |inv| match inv.arg(0).as_object() {
            Some(o) => Ok(Value::Bool(o.get("me")?.is_nullish())),
            None => Ok(Value::Bool(false)),
        })
        .with_method("looped", 0, move |_| Ok(Value::Object(looped.clone())));
    let host = Host::builder().module("echo", echo).build();
    let connection = loopback::connect(&host);
    let client = connection.client();
    let echo = object(client.require("echo")?)?;

    let mine = Object::plain().with("name", "client-loop");
    mine.set("me", mine.clone())?;
    assert_eq!(call(&echo, "inspect", vec![Value::Object(mine.clone())])?, Value::Bool(true));

    let theirs = object(call(&echo, "looped", vec![])?)?;
    assert!(theirs.remote().is_none());
    assert_eq!(theirs.get("name")?, Value::from("host-loop"));
    assert_eq!(theirs.get("me")?, Value::Null);

    let _ = mine.delete("me");
    Ok(())
}

#[test]
fn test_throwing_getter_fails_the_call() -> anyhow::Result<()> {
    let received = Arc::new(AtomicUsize::new(0));
    let seen = received.clone();
    let module = Object::plain().with_method("take", 1, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Undefined)
    });
    let host = Host::builder().module("sink", module).build();
    let connection = loopback::connect(&host);
    let client = connection.client();
    let sink = object(client.require("sink")?)?;

    let argument = Object::plain().with("ok", 1).with_accessor("bad", |_| Err(Exception::error("getter failed")), None);
    let thrown = call(&sink, "take", vec![Value::Object(argument)]).unwrap_err();
    assert_eq!(thrown.message(), "getter failed");
    assert_eq!(received.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_error_wrapping() -> anyhow::Result<()> {
    let module = Object::plain().with_method("explode", 0, |_| Err(Exception::range_error("x")));
    let host = Host::builder().module("bomb", module).build();
    let connection = loopback::connect(&host);
    let client = connection.client();
    let bomb = object(client.require("bomb")?)?;

    let thrown = call(&bomb, "explode", vec![]).unwrap_err();
    let error = thrown.as_error().ok_or_else(|| anyhow::anyhow!("not an error"))?;
    assert!(error.message.starts_with("Could not call remote method 'explode'"), "{}", error.message);
    assert!(error.message.contains("Underlying error: x"));
    assert_eq!(error.from, Some(remorpc::ProcessKind::Host));

    let Some(Value::Error(cause)) = error.cause.as_deref() else {
        anyhow::bail!("missing cause");
    };
    assert_eq!(cause.name, "RangeError");
    assert_eq!(cause.message, "x");
    Ok(())
}

#[test]
fn test_error_wrapping_keeps_thrown_strings() -> anyhow::Result<()> {
    let module = Object::plain().with_method("boom", 0, |_| Err(Exception(Value::from("x"))));
    let host = Host::builder().module("bomb", module).build();
    let connection = loopback::connect(&host);
    let client = connection.client();
    let bomb = object(client.require("bomb")?)?;

    let thrown = call(&bomb, "boom", vec![]).unwrap_err();
    let error = thrown.as_error().ok_or_else(|| anyhow::anyhow!("not an error"))?;
    assert!(error.message.contains("Underlying error: x"), "{}", error.message);
    assert_eq!(error.cause.as_deref(), Some(&Value::from("x")));
    assert!(error.prop("cause").is_none());
    Ok(())
}

#[test]
fn test_missing_handle_after_dispose() -> anyhow::Result<()> {
    let host = Host::builder().module("greeter", greeter()).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let value = client.require("greeter")?;
    let greeter = object(value.clone())?;
    assert!(client.dispose(&value));
    assert!(!client.dispose(&value));
    assert!(host.registry().is_empty());

    let thrown = greeter.get("a").unwrap_err();
    let error = thrown.as_error().ok_or_else(|| anyhow::anyhow!("not an error"))?;
    assert!(error.message.starts_with("Cannot get property 'a' on missing remote object"));
    assert_eq!(error.prop("code"), Some(&Value::from("EBADRPC")));
    assert_eq!(error.prop("errno"), Some(&Value::Number(-72.0)));
    Ok(())
}

// ============================================================================
//  HOST FEATURES
// ============================================================================

#[test]
fn test_override_events() -> anyhow::Result<()> {
    let host = Host::builder()
        .module("secret", Object::plain())
        .global("answer", 41)
        .on_remote_event(|event| {
            let argument = event.argument().map(str::to_string);
            match (event.kind(), argument.as_deref()) {
                (RemoteEventKind::Require, Some("secret")) => event.prevent_default(),
                (RemoteEventKind::GetGlobal, Some("answer")) => event.set_return_value(42),
                _ => {}
            }
        })
        .build();
    let connection = loopback::connect_with(&host, |endpoint| endpoint.with_window(Object::new("Window")));
    connection.endpoint.on_remote_event(|event| {
        if event.kind() == RemoteEventKind::GetCurrentWindow {
            event.prevent_default();
        }
    });
    let client = connection.client();

    assert_eq!(remote_message(client.require("secret").unwrap_err()), "Blocked remote.require('secret')");
    assert_eq!(remote_message(client.require("absent").unwrap_err()), "Cannot find module 'absent'");
    assert_eq!(client.get_global("answer")?, Value::Number(42.0));
    assert_eq!(client.get_global("unset")?, Value::Undefined);
    assert_eq!(remote_message(client.get_current_window().unwrap_err()), "Blocked remote.getCurrentWindow()");
    Ok(())
}

#[test]
fn test_member_constructor() -> anyhow::Result<()> {
    let point = Object::constructor("Point", 1, |inv| {
        if let Value::Object(this) = &inv.this {
            this.set("x", inv.arg(0))?;
        }
        Ok(Value::Undefined)
    });
    let host = Host::builder().module("geometry", Object::plain().with("Point", point)).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let geometry = object(client.require("geometry")?)?;
    let constructor = method(&geometry, "Point")?;
    let instance = object(constructor.construct(vec![Value::from(3)])?)?;
    assert_eq!(instance.class_name(), "Point");
    assert_eq!(instance.get("x")?, Value::Number(3.0));
    Ok(())
}

#[test]
fn test_dead_endpoint_strips_listeners() -> anyhow::Result<()> {
    let bus = Object::event_emitter("Bus").with_method("on", 2, |inv| {
        let event = inv.arg(0).as_str().unwrap_or_default().to_string();
        if let (Some(emitter), Value::Object(listener)) = (inv.this.as_object().and_then(Object::emitter), inv.arg(1)) {
            emitter.on(event, listener);
        }
        Ok(Value::Undefined)
    });
    let host = Host::builder().global("bus", bus.clone()).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let remote_bus = object(client.get_global("bus")?)?;
    let listener = Object::function("listener", 0, |_| Ok(Value::Undefined));
    call(&remote_bus, "on", vec![Value::from("ping"), Value::Object(listener)])?;

    let emitter = bus.emitter().ok_or_else(|| anyhow::anyhow!("no emitter"))?;
    assert_eq!(emitter.listener_count("ping"), 1);

    host.endpoint_destroyed(&connection.endpoint);
    assert!(host.contexts_of(&connection.endpoint).is_empty());
    emitter.emit(Value::Object(bus.clone()), "ping", vec![])?;
    assert_eq!(emitter.listener_count("ping"), 0);
    Ok(())
}

#[test]
fn test_wrong_context_notification() -> anyhow::Result<()> {
    let contents = Object::event_emitter("WebContents").with_method("on", 2, |inv| {
        let event = inv.arg(0).as_str().unwrap_or_default().to_string();
        if let (Some(emitter), Value::Object(listener)) = (inv.this.as_object().and_then(Object::emitter), inv.arg(1)) {
            emitter.on(event, listener);
        }
        Ok(Value::Undefined)
    });
    let host = Host::builder().build();
    let mut connection = loopback::connect_with(&host, |endpoint| endpoint.with_contents(contents.clone()));
    let old = connection.client();
    let new = connection.client();

    let remote = object(old.get_current_web_contents()?)?;
    let listener = Object::function("listener", 0, |_| Ok(Value::Undefined));
    call(&remote, "on", vec![Value::from("did-navigate"), Value::Object(listener)])?;

    let emitter = contents.emitter().ok_or_else(|| anyhow::anyhow!("no emitter"))?;
    emitter.emit(Value::Object(contents.clone()), "did-navigate", vec![])?;
    let delivery = connection.notifications.try_next().ok_or_else(|| anyhow::anyhow!("nothing delivered"))?;

    new.handle_message(&delivery.channel, &delivery.payload)?;
    assert_eq!(emitter.listener_count("did-navigate"), 0);
    Ok(())
}

#[test]
fn test_error_values_round_trip() -> anyhow::Result<()> {
    let original = remorun::ErrorValue::type_error("bad input")
        .with_cause(remorun::ErrorValue::range_error("inner"))
        .with_prop("code", "E_INPUT");
    let host = Host::builder().global("failure", original.clone()).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let Value::Error(mut decoded) = client.get_global("failure")? else {
        anyhow::bail!("expected an error value");
    };
    // Decoding records where an error came from; everything else survives.
    assert_eq!(decoded.from, Some(remorpc::ProcessKind::Host));
    decoded.from = None;
    if let Some(Value::Error(cause)) = decoded.cause.as_deref_mut() {
        assert_eq!(cause.from, Some(remorpc::ProcessKind::Host));
        cause.from = None;
    }
    assert_eq!(decoded, original);
    Ok(())
}

#[test]
fn test_promise_from_host() -> anyhow::Result<()> {
    let pending = Promise::new();
    let exported = pending.clone();
    let module = Object::plain().with_method("later", 0, move |_| Ok(Value::Promise(exported.clone())));
    let host = Host::builder().module("async", module).build();
    let mut connection = loopback::connect(&host);
    let client = connection.client();

    let module = object(client.require("async")?)?;
    let Value::Promise(local) = call(&module, "later", vec![])? else {
        anyhow::bail!("expected a promise");
    };
    assert_eq!(local.state(), PromiseState::Pending);

    pending.resolve(5);
    assert!(client.drain(&mut connection.notifications) >= 1);
    assert_eq!(local.state(), PromiseState::Fulfilled(Value::Number(5.0)));
    Ok(())
}

#[test]
fn test_promise_from_client() -> anyhow::Result<()> {
    let slot: Arc<Mutex<Option<Promise>>> = Arc::new(Mutex::new(None));
    let keep = slot.clone();
    let module = Object::plain().with_method("track", 1, move |inv| {
        if let Value::Promise(p) = inv.arg(0) {
            *keep.lock().unwrap() = Some(p);
        }
        Ok(Value::Undefined)
    });
    let host = Host::builder().module("tracker", module).build();
    let mut connection = loopback::connect(&host);
    let client = connection.client();

    let tracker = object(client.require("tracker")?)?;
    let local = Promise::new();
    call(&tracker, "track", vec![Value::Promise(local.clone())])?;
    client.drain(&mut connection.notifications);

    local.resolve("done");
    let tracked = slot.lock().unwrap().clone().ok_or_else(|| anyhow::anyhow!("not tracked"))?;
    assert_eq!(tracked.state(), PromiseState::Fulfilled(Value::from("done")));
    Ok(())
}

#[test]
fn test_function_with_return_value() -> anyhow::Result<()> {
    let module = Object::plain().with_method("invoke", 1, |inv| match inv.arg(0).as_object() {
        Some(f) => f.call(Value::Undefined, vec![]),
        None => Ok(Value::Undefined),
    });
    let host = Host::builder().module("runner", module).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let runner = object(client.require("runner")?)?;
    let fixed = client.create_function_with_return_value("constant");
    assert_eq!(call(&runner, "invoke", vec![Value::Object(fixed)])?, Value::from("constant"));
    assert!(client.callbacks().is_empty());
    Ok(())
}

#[test]
fn test_release_clears_context() -> anyhow::Result<()> {
    let host = Host::builder().module("greeter", greeter()).build();
    let connection = loopback::connect(&host);
    let client = connection.client();

    let greeter = client.require("greeter")?;
    assert_eq!(host.registry().len(), 1);

    client.release();
    client.release();
    assert!(host.registry().is_empty());
    assert!(matches!(client.require("greeter"), Err(Error::Released)));
    drop(greeter);
    Ok(())
}
