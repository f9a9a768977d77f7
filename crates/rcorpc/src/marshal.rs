//! # Function Marshalling
//!
//! Functions never go through the codec. Before a packet is built every
//! function in its argument graph is swapped for a fresh placeholder symbol,
//! and a token map records placeholder -> function identifier. The receiver
//! swaps each placeholder back for a proxy.
//!
//! Both directions copy the graph with an identity memo, so shared handles
//! stay shared and cycles terminate. Symbols, buffers and typed views cannot
//! hold functions and are carried over as the same handle.

use std::collections::HashMap;

use rcopack::Builtin;
use rcopack::Function;
use rcopack::Instance;
use rcopack::Limits;
use rcopack::List;
use rcopack::Object;
use rcopack::OrderedMap;
use rcopack::Set;
use rcopack::Symbol;
use rcopack::Value;

use crate::error::Error;
use crate::error::Result;

/// Identity-preserving copy with a leaf substitution hook.
struct Walker<F> {
    memo: HashMap<usize, Value>,
    swap: F,
    limits: Limits,
    depth: usize,
}

impl<F> Walker<F>
where
    F: FnMut(&Value) -> Option<Value>,
{
    fn new(limits: Limits, swap: F) -> Self {
        Self { memo: HashMap::new(), swap, limits, depth: 0 }
    }

    fn remember(&mut self, id: usize, v: Value) -> Value {
        self.memo.insert(id, v.clone());
        v
    }

    fn walk(&mut self, v: &Value) -> Result<Value> {
        let id = v.identity();
        if let Some(done) = id.and_then(|id| self.memo.get(&id)) {
            return Ok(done.clone());
        }
        if let Some(out) = (self.swap)(v) {
            return Ok(match id {
                Some(id) => self.remember(id, out),
                None => out,
            });
        }
        let Some(id) = id else { return Ok(v.clone()) };

        if self.depth >= self.limits.max_depth {
            return Err(rcopack::Error::DepthExceeded(self.limits.max_depth).into());
        }
        self.depth += 1;
        let out = match v {
            Value::List(list) => {
                let copy = List::new();
                self.remember(id, copy.clone().into());
                for item in list.items() {
                    let item = self.walk(&item)?;
                    copy.push(item);
                }
                copy.into()
            }
            Value::Object(obj) => {
                let copy = Object::new();
                self.remember(id, copy.clone().into());
                for (k, item) in obj.entries() {
                    let item = self.walk(&item)?;
                    copy.insert(k, item);
                }
                copy.into()
            }
            Value::Instance(inst) => {
                let copy = Instance::new(inst.class());
                self.remember(id, copy.clone().into());
                for (k, item) in inst.fields() {
                    let item = self.walk(&item)?;
                    copy.set(k, item);
                }
                copy.into()
            }
            Value::Builtin(Builtin::Map(map)) => {
                let copy = OrderedMap::new();
                self.remember(id, copy.clone().into());
                for (k, item) in map.entries() {
                    let k = self.walk(&k)?;
                    let item = self.walk(&item)?;
                    copy.insert(k, item);
                }
                copy.into()
            }
            Value::Builtin(Builtin::Set(set)) => {
                let copy = Set::new();
                self.remember(id, copy.clone().into());
                for item in set.values() {
                    let item = self.walk(&item)?;
                    copy.add(item);
                }
                copy.into()
            }
            _ => v.clone(),
        };
        self.depth -= 1;
        Ok(out)
    }
}

/// Replaces every distinct function in `value` with a placeholder.
///
/// `export` assigns the identifier the peer will address the function by.
/// Returns the function-free copy and, if any function was found, the token
/// map for it.
pub fn extract(
    value: &Value,
    limits: Limits,
    mut export: impl FnMut(&Function) -> String,
) -> Result<(Value, Option<OrderedMap>)> {
    let tokens = OrderedMap::new();
    let out = {
        let mut walker = Walker::new(limits, |v: &Value| {
            let Value::Function(f) = v else { return None };
            let placeholder = Value::Symbol(Symbol::new(None));
            tokens.insert(placeholder.clone(), Value::from(export(f)));
            Some(placeholder)
        });
        walker.walk(value)?
    };
    Ok((out, (!tokens.is_empty()).then_some(tokens)))
}

/// Replaces every placeholder listed in `tokens` with the function `resolve`
/// returns for its identifier.
pub fn inject(
    value: &Value,
    tokens: &OrderedMap,
    limits: Limits,
    mut resolve: impl FnMut(&str) -> Function,
) -> Result<Value> {
    let mut functions = HashMap::new();
    for (placeholder, id) in tokens.entries() {
        let (Some(symbol), Some(id)) = (placeholder.as_symbol(), id.as_str()) else {
            return Err(Error::Protocol("malformed token map".into()));
        };
        let key = Value::Symbol(symbol.clone()).identity();
        functions.insert(key, resolve(id));
    }

    let mut walker = Walker::new(limits, |v: &Value| match v {
        Value::Symbol(_) => functions.get(&v.identity()).cloned().map(Value::Function),
        _ => None,
    });
    walker.walk(value)
}
