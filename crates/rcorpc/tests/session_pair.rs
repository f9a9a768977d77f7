//! Two sessions talking over an in-process duplex channel.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use rcopack::Function;
use rcopack::Object;
use rcopack::Value;
use rcorpc::DuplexChannel;
use rcorpc::Error;
use rcorpc::Message;
use rcorpc::Packet;
use rcorpc::Port;
use rcorpc::Session;
use rcorpc::SessionConfig;
use rcorpc::WireFormat;
use tokio::sync::mpsc;

fn pair(wire: WireFormat) -> (Session, Session) {
    let (a, b) = DuplexChannel::pair();
    let left = Session::new(SessionConfig::new().wire(wire).id_prefix("a"), a);
    let right = Session::new(SessionConfig::new().wire(wire).id_prefix("b"), b);
    (left, right)
}

/// Polls until `cond` holds or a second has passed.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_named_call() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "add",
        Function::from_sync(|args| {
            let x = arg(&args, 0).as_i64().unwrap_or(0);
            let y = arg(&args, 1).as_i64().unwrap_or(0);
            Ok(Value::Int(x + y))
        }),
    );

    let sum = a.call("add", vec![Value::Int(2), Value::Int(40)]).await?;
    assert_eq!(sum, Value::Int(42));
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.id_functions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_resolution() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "delay",
        Function::from_async(|args: Vec<Value>| async move {
            let ms = arg(&args, 0).as_i64().unwrap_or(0) as u64;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(arg(&args, 1))
        }),
    );

    let (slow, fast, mid) = tokio::join!(
        a.call("delay", vec![Value::Int(60), Value::from("slow")]),
        a.call("delay", vec![Value::Int(5), Value::from("fast")]),
        a.call("delay", vec![Value::Int(30), Value::from("mid")]),
    );
    assert_eq!(slow?, Value::from("slow"));
    assert_eq!(fast?, Value::from("fast"));
    assert_eq!(mid?, Value::from("mid"));
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.id_functions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_both_directions() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    a.expose("whoami", Function::from_sync(|_| Ok(Value::from("a"))));
    b.expose("whoami", Function::from_sync(|_| Ok(Value::from("b"))));

    assert_eq!(a.call("whoami", vec![]).await?, Value::from("b"));
    assert_eq!(b.call("whoami", vec![]).await?, Value::from("a"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_target_rejects() -> Result<()> {
    let (a, _b) = pair(WireFormat::Binary);
    match a.call("nope", vec![]).await {
        Err(Error::Remote(v)) => {
            let msg = v.as_str().unwrap_or_default().to_owned();
            assert!(msg.contains("nope"), "{}", msg);
            assert!(msg.contains("does not exist"), "{}", msg);
        }
        other => bail!("expected rejection, got {:?}", other),
    }
    assert_eq!(a.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_application_error_rejects() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose("fail", Function::from_sync(|_| Err(Value::object([("code", Value::Int(7))]))));

    let Err(Error::Remote(thrown)) = a.call("fail", vec![]).await else {
        bail!("expected rejection");
    };
    assert_eq!(thrown.as_object().and_then(|o| o.get("code")), Some(Value::Int(7)));
    Ok(())
}

#[tokio::test]
async fn test_withdraw() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose("once", Function::from_sync(|_| Ok(Value::Null)));
    assert_eq!(a.call("once", vec![]).await?, Value::Null);

    assert!(b.withdraw("once").is_some());
    assert!(matches!(a.call("once", vec![]).await, Err(Error::Remote(_))));
    Ok(())
}

#[tokio::test]
async fn test_notify() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.expose(
        "record",
        Function::from_sync(move |args| {
            let _ = tx.send(arg(&args, 0));
            // thrown errors of a notification go nowhere
            Err(Value::from("ignored"))
        }),
    );

    a.notify("record", vec![Value::from("event")])?;
    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(got, Some(Value::from("event")));
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.id_functions(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notifications_run_in_arrival_order() -> Result<()> {
    const N: i64 = 2000;
    let (a, b) = pair(WireFormat::Binary);
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.expose(
        "append",
        Function::from_sync(move |args| {
            let _ = tx.send(arg(&args, 0));
            Ok(Value::Undefined)
        }),
    );

    for i in 0..N {
        a.notify("append", vec![Value::Int(i)])?;
    }
    for i in 0..N {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(got, Some(Value::Int(i)));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_callees_start_in_arrival_order() -> Result<()> {
    const N: i64 = 500;
    let (a, b) = pair(WireFormat::Binary);
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.expose(
        "step",
        Function::from_async(move |args: Vec<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(arg(&args, 0));
                tokio::task::yield_now().await;
                Ok(arg(&args, 0))
            }
        }),
    );

    for i in 0..N {
        a.notify("step", vec![Value::Int(i)])?;
    }
    // each callee runs up to its first await before the next packet is read
    for i in 0..N {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(got, Some(Value::Int(i)));
    }
    assert_eq!(a.call("step", vec![Value::Int(N)]).await?, Value::Int(N));
    Ok(())
}

// ============================================================================
//  FUNCTIONS ACROSS THE LINK
// ============================================================================

#[tokio::test]
async fn test_callback_argument() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "map",
        Function::from_async(|args: Vec<Value>| async move {
            let items = arg(&args, 0).as_list().map(|l| l.items()).unwrap_or_default();
            let Some(f) = arg(&args, 1).as_function().cloned() else {
                return Err(Value::from("not a function"));
            };
            let mut out = Vec::new();
            for item in items {
                out.push(f.call(vec![item]).await?);
            }
            Ok(Value::list(out))
        }),
    );

    let double = Function::from_sync(|args| Ok(Value::Int(arg(&args, 0).as_i64().unwrap_or(0) * 2)));
    let list = Value::list([Value::Int(1), Value::Int(2), Value::Int(3)]);
    let out = a.call("map", vec![list, Value::Function(double)]).await?;
    assert_eq!(out, Value::list([Value::Int(2), Value::Int(4), Value::Int(6)]));

    // b dropped its proxy when the call finished, so a's export goes away
    assert!(eventually(|| a.id_functions() == 0).await);
    assert!(eventually(|| b.held_functions() == 0).await);
    Ok(())
}

#[tokio::test]
async fn test_callback_exported_again_after_release() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "apply",
        Function::from_async(|args: Vec<Value>| async move {
            let Some(f) = arg(&args, 0).as_function().cloned() else {
                return Err(Value::from("not a function"));
            };
            f.call(vec![]).await
        }),
    );

    let cb = Function::from_sync(|_| Ok(Value::from("again")));
    for _ in 0..3 {
        let out = a.call("apply", vec![Value::Function(cb.clone())]).await?;
        assert_eq!(out, Value::from("again"));
        // the peer dropped its proxy, so the next call exports under a new id
        assert!(eventually(|| a.id_functions() == 0).await);
    }
    Ok(())
}

#[tokio::test]
async fn test_same_function_same_proxy() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "same",
        Function::from_sync(|args| Ok(Value::Bool(arg(&args, 0).ptr_eq(&arg(&args, 1))))),
    );

    let f = Function::from_sync(|_| Ok(Value::Null));
    let g = Function::from_sync(|_| Ok(Value::Null));
    let same = a.call("same", vec![Value::Function(f.clone()), Value::Function(f.clone())]).await?;
    let different = a.call("same", vec![Value::Function(f), Value::Function(g)]).await?;
    assert_eq!(same, Value::Bool(true));
    assert_eq!(different, Value::Bool(false));
    Ok(())
}

#[tokio::test]
async fn test_returned_function_and_release_on_drop() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "counter",
        Function::from_sync(|_| {
            let n = Arc::new(AtomicI64::new(0));
            Ok(Value::Function(Function::from_sync(move |_| {
                Ok(Value::Int(n.fetch_add(1, Ordering::SeqCst) + 1))
            })))
        }),
    );

    let counter = a.call("counter", vec![]).await?;
    let Some(next) = counter.as_function().cloned() else { bail!("expected a function") };
    assert_eq!(next.call(vec![]).await, Ok(Value::Int(1)));
    assert_eq!(next.call(vec![]).await, Ok(Value::Int(2)));
    assert_eq!(a.held_functions(), 1);
    assert_eq!(b.id_functions(), 1);

    drop(next);
    drop(counter);
    assert!(eventually(|| b.id_functions() == 0).await);
    assert_eq!(a.held_functions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_shared_graph_with_cycle() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "inspect",
        Function::from_sync(|args| {
            let root = arg(&args, 0);
            let obj = root.as_object().cloned().ok_or_else(|| Value::from("not an object"))?;
            let me = obj.get("me").unwrap_or(Value::Undefined);
            Ok(Value::list([Value::Bool(me.ptr_eq(&root)), obj.get("n").unwrap_or(Value::Null)]))
        }),
    );

    let obj = Object::new();
    obj.insert("me", Value::Object(obj.clone()));
    obj.insert("n", Value::Int(5));
    let out = a.call("inspect", vec![Value::Object(obj)]).await?;
    assert_eq!(out, Value::list([Value::Bool(true), Value::Int(5)]));
    Ok(())
}

// ============================================================================
//  WIRE FORMATS
// ============================================================================

#[tokio::test]
async fn test_every_wire_format() -> Result<()> {
    for wire in [WireFormat::Value, WireFormat::Binary, WireFormat::Text] {
        let (a, b) = pair(wire);
        assert_eq!(a.wire(), wire);
        b.expose(
            "apply",
            Function::from_async(|args: Vec<Value>| async move {
                let Some(f) = arg(&args, 0).as_function().cloned() else {
                    return Err(Value::from("not a function"));
                };
                f.call(vec![arg(&args, 1)]).await
            }),
        );
        let shout = Function::from_sync(|args| {
            Ok(Value::from(arg(&args, 0).as_str().unwrap_or_default().to_uppercase()))
        });
        let out = a.call("apply", vec![Value::Function(shout), Value::from("hi")]).await?;
        assert_eq!(out, Value::from("HI"), "wire {:?}", wire);
    }
    Ok(())
}

#[tokio::test]
async fn test_mixed_wire_formats() -> Result<()> {
    // inbound accepts any representation
    let (a, b) = DuplexChannel::pair();
    let left = Session::new(SessionConfig::new().wire(WireFormat::Text), a);
    let right = Session::new(SessionConfig::new().wire(WireFormat::Binary), b);
    right.expose("echo", Function::from_sync(|args| Ok(arg(&args, 0))));
    left.expose("echo", Function::from_sync(|args| Ok(arg(&args, 0))));

    assert_eq!(left.call("echo", vec![Value::Int(1)]).await?, Value::Int(1));
    assert_eq!(right.call("echo", vec![Value::Int(2)]).await?, Value::Int(2));
    Ok(())
}

// ============================================================================
//  RELEASE AND SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_release_is_idempotent() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose("ping", Function::from_sync(|_| Ok(Value::from("pong"))));

    a.release_remote(["never-registered"])?;
    a.release_remote(["never-registered", "also-unknown"])?;
    b.handle(Message::Value(Packet::Release(vec!["x".into(), "x".into()]).to_value())).await?;

    assert_eq!(a.call("ping", vec![]).await?, Value::from("pong"));
    Ok(())
}

#[tokio::test]
async fn test_explicit_release() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    let kept = Arc::new(std::sync::Mutex::new(None));
    let slot = kept.clone();
    b.expose(
        "keep",
        Function::from_sync(move |args| {
            if let Ok(mut slot) = slot.lock() {
                *slot = arg(&args, 0).as_function().cloned();
            }
            Ok(Value::Null)
        }),
    );

    let cb = Function::from_sync(|_| Ok(Value::from("called")));
    a.call("keep", vec![Value::Function(cb)]).await?;
    assert_eq!(a.id_functions(), 1);
    assert_eq!(b.held_functions(), 1);

    // b still holds the proxy, so nothing is released on its own
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.id_functions(), 1);

    let Some(proxy) = kept.lock().ok().and_then(|slot| slot.clone()) else {
        bail!("callback was not kept");
    };
    assert_eq!(proxy.call(vec![]).await, Ok(Value::from("called")));

    let Some(id) = b.remote_id(&proxy) else { bail!("proxy has no remote id") };
    b.release_remote([id])?;
    assert!(eventually(|| a.id_functions() == 0).await);

    // the released identifier no longer resolves on a
    let Err(thrown) = proxy.call(vec![]).await else { bail!("released callback still answered") };
    assert!(thrown.as_str().unwrap_or_default().contains("does not exist"));
    Ok(())
}

#[tokio::test]
async fn test_pending_calls_fail_on_close() -> Result<()> {
    let (a, b) = DuplexChannel::pair();
    let session = Session::new(SessionConfig::new(), a);

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.call("slow", vec![]).await }
    });

    // the call is on the wire, then the other end disappears
    let first = b.recv().await?;
    assert!(matches!(first, Some(Message::Binary(_))));
    assert_eq!(session.pending_calls(), 1);
    drop(b);

    let out = tokio::time::timeout(Duration::from_secs(1), call).await??;
    assert!(matches!(out, Err(Error::Closed)));
    assert!(eventually(|| session.is_closed()).await);
    assert!(matches!(session.call("later", vec![]).await, Err(Error::Closed)));
    assert_eq!(session.pending_calls(), 0);
    assert_eq!(session.id_functions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_fails_pending() -> Result<()> {
    let (a, b) = pair(WireFormat::Binary);
    b.expose(
        "hang",
        Function::from_async(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }),
    );

    let call = tokio::spawn({
        let a = a.clone();
        async move { a.call("hang", vec![]).await }
    });
    assert!(eventually(|| a.pending_calls() == 1).await);

    a.close();
    let out = tokio::time::timeout(Duration::from_secs(1), call).await??;
    assert!(matches!(out, Err(Error::Closed)));
    assert!(a.is_closed());
    assert_eq!(a.pending_calls(), 0);
    assert!(matches!(a.call("hang", vec![]).await, Err(Error::Closed)));
    Ok(())
}
