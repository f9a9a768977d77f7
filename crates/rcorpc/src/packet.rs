//! # Packets
//!
//! Every packet is a list whose first element selects its kind:
//!
//! ```text
//! [0, name, args, tokens?, resolve?, reject?]   invoke a named function
//! [1, id,   args, tokens?, resolve?, reject?]   invoke an id function
//! [2, id, id, ...]                              release id functions
//! ```
//!
//! Optional fields are `undefined` when a later field is present and are
//! left off entirely at the tail.

use std::fmt;

use rcopack::Builtin;
use rcopack::OrderedMap;
use rcopack::Value;

use crate::error::Error;
use crate::error::Result;

const INVOKE_NAMED: i64 = 0;
const INVOKE_ID: i64 = 1;
const RELEASE: i64 = 2;

/// The function an invocation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Named(String),
    Id(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Named(s) | Target::Id(s) => s,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Named(s) => write!(f, "{}", s),
            Target::Id(s) => write!(f, "#{}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invoke {
    pub target: Target,
    /// Argument list, already stripped of functions.
    pub args: Value,
    /// Placeholder symbol -> function identifier.
    pub tokens: Option<OrderedMap>,
    pub resolve: Option<String>,
    pub reject: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Packet {
    Invoke(Invoke),
    Release(Vec<String>),
}

fn opt_str(s: &Option<String>) -> Value {
    s.as_deref().map_or(Value::Undefined, Value::from)
}

fn protocol(msg: &str) -> Error {
    Error::Protocol(msg.to_string())
}

impl Packet {
    pub fn to_value(&self) -> Value {
        let items = match self {
            Packet::Invoke(inv) => {
                let (kind, name) = match &inv.target {
                    Target::Named(name) => (INVOKE_NAMED, name),
                    Target::Id(id) => (INVOKE_ID, id),
                };
                let mut items = vec![
                    Value::Int(kind),
                    Value::from(name.as_str()),
                    inv.args.clone(),
                    inv.tokens.clone().map_or(Value::Undefined, Value::from),
                    opt_str(&inv.resolve),
                    opt_str(&inv.reject),
                ];
                while items.len() > 3 && items.last().is_some_and(Value::is_undefined) {
                    items.pop();
                }
                items
            }
            Packet::Release(ids) => {
                let mut items = Vec::with_capacity(ids.len() + 1);
                items.push(Value::Int(RELEASE));
                items.extend(ids.iter().map(|id| Value::from(id.as_str())));
                items
            }
        };
        Value::list(items)
    }

    pub fn from_value(v: &Value) -> Result<Packet> {
        let items = v.as_list().ok_or_else(|| protocol("packet is not a list"))?.items();
        let kind = items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| protocol("packet has no kind"))?;

        if kind == RELEASE {
            let ids = items[1..]
                .iter()
                .map(|id| id.as_str().map(str::to_owned).ok_or_else(|| protocol("release id is not a string")))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Packet::Release(ids));
        }

        let name = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| protocol("invocation target is not a string"))?
            .to_owned();
        let target = match kind {
            INVOKE_NAMED => Target::Named(name),
            INVOKE_ID => Target::Id(name),
            _ => return Err(Error::Protocol(format!("unknown packet kind {}", kind))),
        };
        let args = items.get(2).cloned().ok_or_else(|| protocol("invocation has no arguments"))?;
        let tokens = match items.get(3) {
            None | Some(Value::Undefined) => None,
            Some(Value::Builtin(Builtin::Map(m))) => Some(m.clone()),
            Some(_) => return Err(protocol("token map is not a map")),
        };
        let continuation = |i: usize| match items.get(i) {
            None | Some(Value::Undefined) => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(protocol("continuation id is not a string")),
        };
        let resolve = continuation(4)?;
        let reject = continuation(5)?;

        Ok(Packet::Invoke(Invoke { target, args, tokens, resolve, reject }))
    }
}
