use crate::bigint::BigInt;
use crate::builtin;
use crate::cursor::Cursor;
use crate::registry::Registry;
use crate::types::Error;
use crate::types::Limits;
use crate::types::Result;
use crate::types::Tag;
use crate::types::END;
use crate::value::Instance;
use crate::value::List;
use crate::value::Object;
use crate::value::Symbol;
use crate::value::Value;

/// Rebuilds a value graph from bytes written by `Encoder`.
///
/// Each node reserves its slot in the positional reference list before its
/// children are read, so a child can refer back to a container that is still
/// being filled.
#[derive(Debug)]
pub struct Decoder<'a, 'r> {
    cursor: Cursor<'a>,
    registry: &'r Registry,
    limits: Limits,
    refs: Vec<Value>,
    depth: usize,
}

impl<'a, 'r> Decoder<'a, 'r> {
    pub fn new(buf: &'a [u8], registry: &'r Registry) -> Self {
        Self::with_limits(buf, registry, Limits::default())
    }

    pub fn with_limits(buf: &'a [u8], registry: &'r Registry, limits: Limits) -> Self {
        Self {
            cursor: Cursor::new(buf),
            registry,
            limits,
            refs: Vec::new(),
            depth: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub(crate) fn cursor_mut(&mut self) -> &mut Cursor<'a> {
        &mut self.cursor
    }

    /// Decodes the single root value; leftover bytes are an error.
    pub fn finish(mut self) -> Result<Value> {
        let root = self.value()?;
        match self.cursor.remaining() {
            0 => Ok(root),
            n => Err(Error::TrailingBytes(n)),
        }
    }

    fn reserve(&mut self) -> usize {
        self.refs.push(Value::Undefined);
        self.refs.len() - 1
    }

    pub(crate) fn fill(&mut self, slot: usize, v: Value) {
        if let Some(entry) = self.refs.get_mut(slot) {
            *entry = v;
        }
    }

    /// Consumes the terminator if the next byte is one.
    pub(crate) fn at_end(&mut self) -> Result<bool> {
        if self.cursor.peek_byte()? == END {
            self.cursor.read_byte()?;
            return Ok(true);
        }
        Ok(false)
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

    fn string(&mut self) -> Result<String> {
        Ok(self.cursor.read_str()?.to_owned())
    }

    pub fn value(&mut self) -> Result<Value> {
        let byte = self.cursor.read_byte()?;
        let tag = Tag::from_u8(byte).ok_or(Error::InvalidTag(byte))?;

        match tag {
            Tag::Reference => {
                let index = self.cursor.read_vint()?;
                return self.refs.get(index as usize).cloned().ok_or(Error::BadReference(index));
            }
            Tag::FunctionCode => return Err(Error::FunctionForbidden),
            _ => {}
        }

        let slot = self.reserve();
        let v = match tag {
            Tag::Undefined => Value::Undefined,
            Tag::Null => Value::Null,
            Tag::False => Value::Bool(false),
            Tag::True => Value::Bool(true),
            Tag::Int => Value::Int(i64::from(self.cursor.read_vint()? as i32)),
            Tag::Float => Value::Float(self.cursor.read_f64()?),
            Tag::String => Value::Str(self.string()?),
            Tag::BigIntPos | Tag::BigIntNeg => {
                let len = self.cursor.read_len()?;
                let magnitude = self.cursor.read_bytes(len)?.to_vec();
                Value::BigInt(BigInt::from_parts(tag == Tag::BigIntNeg, magnitude))
            }
            Tag::Symbol => {
                // only a flat description may follow, so this never nests
                let next = self.cursor.peek_byte()?;
                if next != Tag::String as u8 && next != Tag::Undefined as u8 {
                    return Err(Error::Malformed("symbol description must be a string"));
                }
                let description = match self.value()? {
                    Value::Str(s) => Some(s),
                    Value::Undefined => None,
                    _ => return Err(Error::Malformed("symbol description must be a string")),
                };
                Value::Symbol(Symbol::new(description))
            }
            Tag::List => {
                let list = List::new();
                self.fill(slot, Value::List(list.clone()));
                self.enter()?;
                while !self.at_end()? {
                    let item = self.value()?;
                    list.push(item);
                }
                self.leave();
                Value::List(list)
            }
            Tag::Object => {
                let obj = Object::new();
                self.fill(slot, Value::Object(obj.clone()));
                self.enter()?;
                self.fields_into(|k, v| { obj.insert(k, v); })?;
                self.leave();
                Value::Object(obj)
            }
            Tag::Instance => self.instance(slot)?,
            Tag::Builtin => {
                let id = self.cursor.read_vint()?;
                let ext = builtin::extension(id).ok_or(Error::UnknownBuiltin(id))?;
                self.enter()?;
                let v = ext.decode(self, slot)?;
                self.leave();
                v
            }
            Tag::SafetyFunction => {
                let name = self.cursor.read_str()?;
                let func = self
                    .registry
                    .function(name)
                    .ok_or_else(|| Error::UnknownFunction(name.to_owned()))?;
                Value::Function(func.clone())
            }
            // handled above
            Tag::Reference | Tag::FunctionCode => return Err(Error::InvalidTag(byte)),
        };
        self.fill(slot, v.clone());
        Ok(v)
    }

    /// Reads `count` key/value pairs into `sink`.
    fn fields_into(&mut self, mut sink: impl FnMut(String, Value)) -> Result<()> {
        let count = self.cursor.read_len()?;
        for _ in 0..count {
            let key = self.string()?;
            let v = self.value()?;
            sink(key, v);
        }
        Ok(())
    }

    fn instance(&mut self, slot: usize) -> Result<Value> {
        let class_name = self.string()?;
        let registry = self.registry;
        let def = registry
            .class(&class_name)
            .ok_or_else(|| Error::UnknownClass(class_name.clone()))?;

        self.enter()?;
        let v = match def.from_fields() {
            // Hooked classes see a plain field bag; a self-reference inside
            // the fields resolves to that bag.
            Some(hook) => {
                let bag = Object::new();
                self.fill(slot, Value::Object(bag.clone()));
                self.fields_into(|k, v| { bag.insert(k, v); })?;
                hook(bag)?
            }
            None => {
                let inst = Instance::new(class_name);
                self.fill(slot, Value::Instance(inst.clone()));
                self.fields_into(|k, v| inst.set(k, v))?;
                Value::Instance(inst)
            }
        };
        self.leave();
        Ok(v)
    }
}
