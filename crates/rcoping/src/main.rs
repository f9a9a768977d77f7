//! # rcoping
//!
//! Runs two sessions over an in-process channel and drives a few round
//! trips through them: a named call, a callback passed as an argument, a
//! function returned as a result, and its release once dropped.
//!
//! Usage: `rcoping [value|binary|text]`. Set `RUST_LOG=rcorpc=debug` to see
//! packet flow.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use rcopack::Function;
use rcopack::Value;
use rcorpc::DuplexChannel;
use rcorpc::Session;
use rcorpc::SessionConfig;
use rcorpc::WireFormat;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn parse_wire(arg: Option<String>) -> Result<WireFormat> {
    Ok(match arg.as_deref() {
        None | Some("binary") => WireFormat::Binary,
        Some("value") => WireFormat::Value,
        Some("text") => WireFormat::Text,
        Some(other) => bail!("unknown wire format '{}', expected value, binary or text", other),
    })
}

fn first(args: &[Value]) -> Value {
    args.first().cloned().unwrap_or(Value::Undefined)
}

/// The serving side's API.
fn serve(session: &Session) {
    session.expose("ping", Function::from_sync(|_| Ok(Value::from("pong"))));

    session.expose(
        "each",
        Function::from_async(|args: Vec<Value>| async move {
            let items = first(&args).as_list().map(|l| l.items()).unwrap_or_default();
            let Some(visit) = args.get(1).and_then(Value::as_function).cloned() else {
                return Err(Value::from("each expects a callback"));
            };
            for item in &items {
                visit.call(vec![item.clone()]).await?;
            }
            Ok(Value::Int(items.len() as i64))
        }),
    );

    session.expose(
        "counter",
        Function::from_sync(|args| {
            let n = Arc::new(AtomicI64::new(first(&args).as_i64().unwrap_or(0)));
            Ok(Value::Function(Function::from_sync(move |_| {
                Ok(Value::Int(n.fetch_add(1, Ordering::SeqCst) + 1))
            })))
        }),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let wire = parse_wire(std::env::args().nth(1))?;
    let (left, right) = DuplexChannel::pair();
    let client = Session::new(SessionConfig::new().wire(wire).id_prefix("client-"), left);
    let server = Session::new(SessionConfig::new().wire(wire).id_prefix("server-"), right);
    serve(&server);
    info!(?wire, "sessions up");

    let pong = client.call("ping", vec![]).await?;
    info!(reply = ?pong, "ping");

    let seen = Arc::new(AtomicI64::new(0));
    let visit = {
        let seen = seen.clone();
        Function::from_sync(move |args| {
            seen.fetch_add(first(&args).as_i64().unwrap_or(0), Ordering::SeqCst);
            Ok(Value::Undefined)
        })
    };
    let items = Value::list([Value::Int(1), Value::Int(2), Value::Int(3)]);
    let count = client.call("each", vec![items, Value::Function(visit)]).await?;
    info!(?count, sum = seen.load(Ordering::SeqCst), "callback");

    let counter = client.call("counter", vec![Value::Int(10)]).await?;
    let next = counter.as_function().cloned().context("counter did not return a function")?;
    for _ in 0..3 {
        let n = next.call(vec![]).await.map_err(|thrown| anyhow::anyhow!("counter threw {:?}", thrown))?;
        info!(value = ?n, "counter");
    }
    info!(exported = server.id_functions(), held = client.held_functions(), "before drop");
    drop(next);
    drop(counter);

    // release is asynchronous; give it a moment to land
    for _ in 0..50 {
        if server.id_functions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!(exported = server.id_functions(), held = client.held_functions(), "after drop");

    match client.call("missing", vec![]).await {
        Err(rcorpc::Error::Remote(reason)) => info!(?reason, "missing function rejected"),
        other => bail!("expected a rejection, got {:?}", other),
    }

    client.close();
    server.close();
    Ok(())
}
