use std::sync::Arc;

use rcopack::Builtin;
use rcopack::Codec;
use rcopack::Function;
use rcopack::Limits;
use rcopack::List;
use rcopack::Object;
use rcopack::OrderedMap;
use rcopack::Symbol;
use rcopack::Value;

use crate::channel::DuplexChannel;
use crate::error::Error;
use crate::error::Result;
use crate::marshal;
use crate::packet::Invoke;
use crate::packet::Packet;
use crate::packet::Target;
use crate::transport::Port;
use crate::wire::Message;
use crate::wire::WireFormat;

type R<T> = Result<T>;

fn noop() -> Function {
    Function::from_sync(|_| Ok(Value::Undefined))
}

fn invoke(target: Target, args: Value) -> Invoke {
    Invoke { target, args, tokens: None, resolve: None, reject: None }
}

// ============================================================================
//  PACKETS
// ============================================================================

#[test]
fn test_packet_tail_is_trimmed() {
    let p = Packet::Invoke(invoke(Target::Named("ping".into()), Value::list([])));
    let items = p.to_value().as_list().unwrap().items();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Value::Int(0));
    assert_eq!(items[1], Value::from("ping"));
}

#[test]
fn test_packet_gap_is_undefined() {
    let mut inv = invoke(Target::Id("7".into()), Value::list([]));
    inv.reject = Some("r".into());
    let items = Packet::Invoke(inv).to_value().as_list().unwrap().items();
    assert_eq!(items.len(), 6);
    assert_eq!(items[0], Value::Int(1));
    assert!(items[3].is_undefined());
    assert!(items[4].is_undefined());
    assert_eq!(items[5], Value::from("r"));
}

#[test]
fn test_packet_from_value() -> R<()> {
    let tokens = OrderedMap::new();
    tokens.insert(Value::Symbol(Symbol::new(None)), Value::from("f1"));
    let v = Value::list([
        Value::Int(0),
        Value::from("sum"),
        Value::list([Value::Int(1), Value::Int(2)]),
        Value::from(tokens),
        Value::from("ok"),
        Value::from("err"),
    ]);

    let Packet::Invoke(inv) = Packet::from_value(&v)? else { panic!("expected invoke") };
    assert!(format!("{:?}", inv).contains("tokens: Some(Map {Symbol(): \"f1\"})"));
    assert_eq!(inv.target, Target::Named("sum".into()));
    assert_eq!(inv.args, Value::list([Value::Int(1), Value::Int(2)]));
    assert_eq!(inv.tokens.map(|t| t.len()), Some(1));
    assert_eq!(inv.resolve.as_deref(), Some("ok"));
    assert_eq!(inv.reject.as_deref(), Some("err"));
    Ok(())
}

#[test]
fn test_release_packet() -> R<()> {
    let v = Packet::Release(vec!["a".into(), "b".into()]).to_value();
    assert_eq!(v, Value::list([Value::Int(2), Value::from("a"), Value::from("b")]));

    let Packet::Release(ids) = Packet::from_value(&v)? else { panic!("expected release") };
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    Ok(())
}

#[test]
fn test_malformed_packets() {
    let bad = [
        Value::Int(0),
        Value::list([]),
        Value::list([Value::Int(9), Value::from("x"), Value::list([])]),
        Value::list([Value::Int(0), Value::Int(1), Value::list([])]),
        Value::list([Value::Int(0), Value::from("x")]),
        Value::list([Value::Int(0), Value::from("x"), Value::list([]), Value::Int(3)]),
        Value::list([Value::Int(0), Value::from("x"), Value::list([]), Value::Undefined, Value::Int(4)]),
        Value::list([Value::Int(2), Value::Int(1)]),
    ];
    for v in &bad {
        assert!(matches!(Packet::from_value(v), Err(Error::Protocol(_))), "accepted {:?}", v);
    }
}

// ============================================================================
//  MARSHALLING
// ============================================================================

#[test]
fn test_extract_without_functions() -> R<()> {
    let v = Value::object([("a", Value::Int(1))]);
    let (out, tokens) = marshal::extract(&v, Limits::default(), |_| unreachable!())?;
    assert!(tokens.is_none());
    assert_eq!(out, v);
    assert!(!out.ptr_eq(&v));
    Ok(())
}

#[test]
fn test_extract_shares_placeholder() -> R<()> {
    let f = noop();
    let g = noop();
    let v = Value::list([Value::Function(f.clone()), Value::Function(g), Value::Function(f)]);

    let mut exported = Vec::new();
    let (out, tokens) = marshal::extract(&v, Limits::default(), |func| {
        exported.push(func.id());
        format!("id{}", exported.len())
    })?;
    assert_eq!(exported.len(), 2);

    let tokens = tokens.unwrap();
    assert_eq!(tokens.len(), 2);
    let items = out.as_list().unwrap().items();
    assert!(items[0].as_symbol().is_some());
    assert!(items[0].ptr_eq(&items[2]));
    assert!(!items[0].ptr_eq(&items[1]));
    assert_eq!(tokens.get(&items[0]), Some(Value::from("id1")));
    assert_eq!(tokens.get(&items[1]), Some(Value::from("id2")));
    Ok(())
}

#[test]
fn test_extract_keeps_cycles() -> R<()> {
    let obj = Object::new();
    obj.insert("self", Value::Object(obj.clone()));
    obj.insert("cb", Value::Function(noop()));

    let (out, tokens) = marshal::extract(&Value::Object(obj.clone()), Limits::default(), |_| "x".into())?;
    assert!(tokens.is_some());
    let copy = out.as_object().unwrap();
    assert!(copy.get("self").unwrap().ptr_eq(&out));
    assert!(copy.get("cb").unwrap().as_symbol().is_some());
    // the original still holds its function
    assert!(obj.get("cb").unwrap().as_function().is_some());
    Ok(())
}

#[test]
fn test_inject_roundtrip() -> R<()> {
    let f = noop();
    let inner = List::new();
    inner.push(Value::Function(f.clone()));
    let v = Value::list([Value::List(inner.clone()), Value::List(inner), Value::Function(f)]);

    let (stripped, tokens) = marshal::extract(&v, Limits::default(), |_| "cb".into())?;
    let tokens = tokens.unwrap();

    let proxy = noop();
    let mut asked = Vec::new();
    let back = marshal::inject(&stripped, &tokens, Limits::default(), |id| {
        asked.push(id.to_owned());
        proxy.clone()
    })?;
    assert_eq!(asked, vec!["cb".to_string()]);

    let items = back.as_list().unwrap().items();
    assert!(items[0].ptr_eq(&items[1]));
    let nested = items[0].as_list().unwrap().get(0).unwrap();
    assert!(nested.as_function().unwrap().ptr_eq(&proxy));
    assert!(items[2].as_function().unwrap().ptr_eq(&proxy));
    Ok(())
}

#[test]
fn test_inject_function_as_map_key() -> R<()> {
    let f = noop();
    let map = OrderedMap::new();
    map.insert(Value::Function(f), Value::Int(1));

    let (stripped, tokens) = marshal::extract(&map.into(), Limits::default(), |_| "k".into())?;
    let proxy = noop();
    let back = marshal::inject(&stripped, &tokens.unwrap(), Limits::default(), |_| proxy.clone())?;

    let Some(Builtin::Map(m)) = back.as_builtin() else { panic!("expected map") };
    assert_eq!(m.get(&Value::Function(proxy)), Some(Value::Int(1)));
    Ok(())
}

#[test]
fn test_inject_rejects_bad_tokens() {
    let tokens = OrderedMap::new();
    tokens.insert(Value::from("not a symbol"), Value::from("id"));
    let out = marshal::inject(&Value::list([]), &tokens, Limits::default(), |_| noop());
    assert!(matches!(out, Err(Error::Protocol(_))));
}

#[test]
fn test_extract_depth_limit() {
    let mut v = Value::Int(0);
    for _ in 0..8 {
        v = Value::list([v]);
    }
    let out = marshal::extract(&v, Limits::new(4), |_| String::new());
    assert!(matches!(out, Err(Error::Codec(rcopack::Error::DepthExceeded(4)))));
}

// ============================================================================
//  WIRE
// ============================================================================

#[test]
fn test_wire_formats() -> R<()> {
    let codec = Codec::default();
    let packet = Packet::Release(vec!["x".into()]).to_value();

    for format in [WireFormat::Value, WireFormat::Binary, WireFormat::Text] {
        let msg = format.encode(&codec, packet.clone())?;
        assert_eq!(msg.format(), format);
        assert_eq!(msg.decode(&codec)?, packet);
    }
    Ok(())
}

#[test]
fn test_text_is_base64_of_binary() -> R<()> {
    let codec = Codec::default();
    let packet = Value::list([Value::Int(2)]);
    let Message::Binary(bytes) = WireFormat::Binary.encode(&codec, packet.clone())? else { panic!() };
    let Message::Text(text) = WireFormat::Text.encode(&codec, packet)? else { panic!() };
    assert_eq!(bytes, vec![5, 1, 0x82, 0]);
    assert_eq!(text, "BQGCAA==");
    Ok(())
}

#[test]
fn test_text_rejects_garbage() {
    let out = Message::Text("not base64!".into()).decode(&Codec::default());
    assert!(matches!(out, Err(Error::Protocol(_))));
}

#[test]
fn test_binary_decode_error() {
    let out = Message::Binary(vec![16]).decode(&Codec::default());
    assert!(matches!(out, Err(Error::Codec(rcopack::Error::FunctionForbidden))));
}

// ============================================================================
//  CHANNEL
// ============================================================================

#[tokio::test]
async fn test_duplex_channel() -> R<()> {
    let (a, b) = DuplexChannel::pair();
    a.send(Message::Text("hi".into())).await?;
    b.send(Message::Binary(vec![1])).await?;

    assert!(matches!(b.recv().await?, Some(Message::Text(t)) if t == "hi"));
    assert!(matches!(a.recv().await?, Some(Message::Binary(v)) if v == vec![1]));

    drop(a);
    assert!(b.recv().await?.is_none());
    assert!(b.send(Message::Text("late".into())).await.is_err());
    Ok(())
}

#[test]
fn test_error_into_thrown() {
    assert_eq!(Error::Remote(Value::Int(3)).into_thrown(), Value::Int(3));
    assert_eq!(Error::Closed.into_thrown(), Value::from("session closed"));
}

#[test]
fn test_registry_shared_with_codec() -> R<()> {
    let log = noop();
    let mut registry = rcopack::Registry::new();
    registry.register_function("log", log.clone())?;
    let codec = Codec::new(Arc::new(registry));
    let msg = WireFormat::Binary.encode(&codec, Value::Function(log.clone()))?;
    assert!(msg.decode(&codec)?.as_function().unwrap().ptr_eq(&log));
    Ok(())
}
