use std::collections::HashMap;

use crate::builtin;
use crate::registry::Registry;
use crate::types::Error;
use crate::types::Limits;
use crate::types::Result;
use crate::types::Tag;
use crate::types::END;
use crate::value::Value;
use crate::vint;

/// Depth-first writer for one value graph.
///
/// Every visited node takes the next reference index on entry, scalars
/// included, so indices stay dense and match the decoder's positional list.
/// A handle seen before is written as a back-reference and takes no index.
pub struct Encoder<'r> {
    buf: Vec<u8>,
    registry: &'r Registry,
    limits: Limits,
    seen: HashMap<usize, u32>,
    /// Keeps visited handles alive so their addresses cannot be reused
    /// while `seen` refers to them.
    pinned: Vec<Value>,
    next_index: u32,
    depth: usize,
}

impl<'r> Encoder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self::with_limits(registry, Limits::default())
    }

    pub fn with_limits(registry: &'r Registry, limits: Limits) -> Self {
        Self {
            buf: Vec::new(),
            registry,
            limits,
            seen: HashMap::new(),
            pinned: Vec::new(),
            next_index: 0,
            depth: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[inline(always)]
    fn tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub(crate) fn vint(&mut self, v: u32) {
        vint::write(&mut self.buf, v);
    }

    /// Writes a length or count, which must fit the 32-bit vint.
    pub(crate) fn len(&mut self, n: usize) -> Result<()> {
        let v = u32::try_from(n).map_err(|_| Error::TooLarge(n))?;
        self.vint(v);
        Ok(())
    }

    pub(crate) fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn end(&mut self) {
        self.buf.push(END);
    }

    fn str(&mut self, s: &str) -> Result<()> {
        self.len(s.len())?;
        self.raw(s.as_bytes());
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= self.limits.max_depth {
            return Err(Error::DepthExceeded(self.limits.max_depth));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Encodes one value and everything reachable from it.
    pub fn value(&mut self, v: &Value) -> Result<()> {
        let identity = v.identity();
        if let Some(id) = identity {
            if let Some(&index) = self.seen.get(&id) {
                self.tag(Tag::Reference);
                self.vint(index);
                return Ok(());
            }
        }

        let index = self.next_index;
        self.next_index = index.checked_add(1).ok_or(Error::TooLarge(index as usize))?;
        if let Some(id) = identity {
            self.seen.insert(id, index);
            self.pinned.push(v.clone());
        }

        let registry = self.registry;
        match v {
            Value::Undefined => self.tag(Tag::Undefined),
            Value::Null => self.tag(Tag::Null),
            Value::Bool(false) => self.tag(Tag::False),
            Value::Bool(true) => self.tag(Tag::True),
            Value::Int(i) => match i32::try_from(*i) {
                Ok(small) => {
                    self.tag(Tag::Int);
                    self.vint(small as u32);
                }
                Err(_) => self.float(*i as f64),
            },
            Value::Float(x) => self.float(*x),
            Value::Str(s) => {
                self.tag(Tag::String);
                self.str(s)?;
            }
            Value::BigInt(b) => {
                self.tag(if b.is_negative() { Tag::BigIntNeg } else { Tag::BigIntPos });
                self.len(b.magnitude().len())?;
                self.raw(b.magnitude());
            }
            Value::Symbol(s) => {
                self.tag(Tag::Symbol);
                let description = match s.description() {
                    Some(d) => Value::Str(d.to_owned()),
                    None => Value::Undefined,
                };
                self.value(&description)?;
            }
            Value::List(l) => {
                self.tag(Tag::List);
                self.enter()?;
                for item in &l.items() {
                    self.value(item)?;
                }
                self.end();
                self.leave();
            }
            Value::Object(o) => {
                self.tag(Tag::Object);
                self.enter()?;
                let entries = o.entries();
                self.len(entries.len())?;
                for (k, item) in &entries {
                    self.str(k)?;
                    self.value(item)?;
                }
                self.leave();
            }
            Value::Instance(inst) => {
                self.tag(Tag::Instance);
                self.enter()?;
                self.str(inst.class())?;
                // unregistered classes are written as-is; the decoder rejects them
                let fields = match registry.class(inst.class()) {
                    Some(def) => def.fields_of(inst),
                    None => inst.fields(),
                };
                self.len(fields.len())?;
                for (k, item) in &fields {
                    self.str(k)?;
                    self.value(item)?;
                }
                self.leave();
            }
            Value::Builtin(b) => {
                let id = b.sub_type_id();
                let ext = builtin::extension(id).ok_or(Error::UnknownBuiltin(id))?;
                self.tag(Tag::Builtin);
                self.vint(id);
                self.enter()?;
                ext.encode(self, b)?;
                self.leave();
            }
            Value::Function(f) => match registry.function_name(f) {
                Some(name) => {
                    self.tag(Tag::SafetyFunction);
                    self.str(name)?;
                }
                None => self.tag(Tag::Undefined),
            },
        }
        Ok(())
    }

    fn float(&mut self, x: f64) {
        self.tag(Tag::Float);
        self.raw(&x.to_le_bytes());
    }
}
