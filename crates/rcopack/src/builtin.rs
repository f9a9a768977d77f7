//! Host-standard containers and the extension table that codes them.
//!
//! A built-in is written as `[Tag::Builtin][vint sub-type id][payload]`. The
//! payload routine is looked up by sub-type id in `EXTENSIONS`; an id with no
//! entry fails the decode.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::bigint::BigInt;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::types::Error;
use crate::types::Result;
use crate::value::addr;
use crate::value::eq_graph;
use crate::value::lock;
use crate::value::Dbg;
use crate::value::Value;

pub const MAP_ID: u32 = 1;
pub const SET_ID: u32 = 2;
pub const BUFFER_ID: u32 = 3;

/// Hashable form of a map key or set member: handles by identity, scalars by
/// value. Integral floats share the key of the equal `Int`, and every NaN is
/// one key.
#[derive(Clone, PartialEq, Eq, Hash)]
enum Key {
    Handle(usize),
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    BigInt(BigInt),
}

const NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

impl Key {
    fn of(v: &Value) -> Key {
        match v {
            Value::Undefined => Key::Undefined,
            Value::Null => Key::Null,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) if f.is_nan() => Key::Float(NAN_BITS),
            Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Key::Int(*f as i64)
            }
            Value::Float(f) => Key::Float(f.to_bits()),
            Value::Str(s) => Key::Str(s.clone()),
            Value::BigInt(b) => Key::BigInt(b.clone()),
            _ => Key::Handle(v.identity().unwrap_or_default()),
        }
    }
}

#[derive(Default)]
struct MapData {
    entries: Vec<(Value, Value)>,
    index: HashMap<Key, usize>,
}

/// Insertion-ordered map with arbitrary keys.
#[derive(Clone, Default)]
pub struct OrderedMap(Arc<Mutex<MapData>>);

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: Value, v: Value) -> Option<Value> {
        let mut map = lock(&self.0);
        let MapData { entries, index } = &mut *map;
        let k = Key::of(&key);
        if let Some(slot) = index.get(&k).and_then(|&i| entries.get_mut(i)) {
            return Some(std::mem::replace(&mut slot.1, v));
        }
        index.insert(k, entries.len());
        entries.push((key, v));
        None
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        let map = lock(&self.0);
        let i = *map.index.get(&Key::of(key))?;
        map.entries.get(i).map(|(_, v)| v.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.0).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        lock(&self.0).entries.clone()
    }
}

#[derive(Default)]
struct SetData {
    members: Vec<Value>,
    index: HashSet<Key>,
}

/// Insertion-ordered set.
#[derive(Clone, Default)]
pub struct Set(Arc<Mutex<SetData>>);

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an equal member was already present.
    pub fn add(&self, v: Value) -> bool {
        let mut set = lock(&self.0);
        if !set.index.insert(Key::of(&v)) {
            return false;
        }
        set.members.push(v);
        true
    }

    pub fn contains(&self, v: &Value) -> bool {
        lock(&self.0).index.contains(&Key::of(v))
    }

    pub fn len(&self) -> usize {
        lock(&self.0).members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<Value> {
        lock(&self.0).members.clone()
    }
}

/// A fixed-size binary buffer, shareable between typed views.
#[derive(Clone)]
pub struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    /// Overwrites bytes starting at `offset`; the length never changes.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = lock(&self.0);
        let end = offset.checked_add(bytes.len()).ok_or(Error::TooLarge(offset))?;
        let dest = data.get_mut(offset..end).ok_or(Error::Malformed("write past end of buffer"))?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Element type of a typed numeric view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedKind {
    I8,
    U8,
    U8Clamped,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
    BigI64,
    BigU64,
}

impl TypedKind {
    pub const ALL: [TypedKind; 11] = [
        TypedKind::I8,
        TypedKind::U8,
        TypedKind::U8Clamped,
        TypedKind::I16,
        TypedKind::U16,
        TypedKind::I32,
        TypedKind::U32,
        TypedKind::F32,
        TypedKind::F64,
        TypedKind::BigI64,
        TypedKind::BigU64,
    ];

    pub const fn sub_type_id(self) -> u32 {
        match self {
            TypedKind::I8 => 4,
            TypedKind::U8 => 5,
            TypedKind::U8Clamped => 6,
            TypedKind::I16 => 7,
            TypedKind::U16 => 8,
            TypedKind::I32 => 9,
            TypedKind::U32 => 10,
            TypedKind::F32 => 11,
            TypedKind::F64 => 12,
            TypedKind::BigI64 => 13,
            TypedKind::BigU64 => 14,
        }
    }

    pub fn from_sub_type_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.sub_type_id() == id)
    }

    pub const fn element_size(self) -> usize {
        match self {
            TypedKind::I8 | TypedKind::U8 | TypedKind::U8Clamped => 1,
            TypedKind::I16 | TypedKind::U16 => 2,
            TypedKind::I32 | TypedKind::U32 | TypedKind::F32 => 4,
            TypedKind::F64 | TypedKind::BigI64 | TypedKind::BigU64 => 8,
        }
    }
}

struct TypedData {
    kind: TypedKind,
    buffer: Buffer,
    byte_offset: usize,
    length: usize,
}

/// A typed window onto a `Buffer`.
#[derive(Clone)]
pub struct TypedArray(Arc<TypedData>);

impl TypedArray {
    /// `length` counts elements. The view must be aligned and in range.
    pub fn new(kind: TypedKind, buffer: Buffer, byte_offset: usize, length: usize) -> Result<Self> {
        let size = kind.element_size();
        if byte_offset % size != 0 {
            return Err(Error::Malformed("typed view offset is not element aligned"));
        }
        let end = length
            .checked_mul(size)
            .and_then(|n| n.checked_add(byte_offset))
            .ok_or(Error::TooLarge(length))?;
        if end > buffer.len() {
            return Err(Error::Malformed("typed view exceeds its buffer"));
        }
        Ok(Self(Arc::new(TypedData { kind, buffer, byte_offset, length })))
    }

    /// A view covering a fresh buffer holding `bytes`.
    pub fn from_bytes(kind: TypedKind, bytes: Vec<u8>) -> Result<Self> {
        let size = kind.element_size();
        if bytes.len() % size != 0 {
            return Err(Error::Malformed("byte length is not a multiple of the element size"));
        }
        let length = bytes.len() / size;
        Self::new(kind, Buffer::new(bytes), 0, length)
    }

    pub fn kind(&self) -> TypedKind {
        self.0.kind
    }

    pub fn buffer(&self) -> &Buffer {
        &self.0.buffer
    }

    pub fn byte_offset(&self) -> usize {
        self.0.byte_offset
    }

    pub fn len(&self) -> usize {
        self.0.length
    }

    pub fn is_empty(&self) -> bool {
        self.0.length == 0
    }

    /// Copy of the bytes the view covers.
    pub fn bytes(&self) -> Vec<u8> {
        let start = self.0.byte_offset;
        let end = start + self.0.length * self.0.kind.element_size();
        self.0.buffer.to_vec().get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

#[derive(Clone)]
pub enum Builtin {
    Map(OrderedMap),
    Set(Set),
    Buffer(Buffer),
    Typed(TypedArray),
}

impl Builtin {
    pub fn sub_type_id(&self) -> u32 {
        match self {
            Builtin::Map(_) => MAP_ID,
            Builtin::Set(_) => SET_ID,
            Builtin::Buffer(_) => BUFFER_ID,
            Builtin::Typed(t) => t.kind().sub_type_id(),
        }
    }

    pub(crate) fn identity(&self) -> usize {
        match self {
            Builtin::Map(m) => addr(&m.0),
            Builtin::Set(s) => addr(&s.0),
            Builtin::Buffer(b) => addr(&b.0),
            Builtin::Typed(t) => addr(&t.0),
        }
    }

    pub(crate) fn eq_graph(&self, other: &Builtin, seen: &mut HashSet<(usize, usize)>) -> bool {
        match (self, other) {
            (Builtin::Map(a), Builtin::Map(b)) => {
                let (xs, ys) = (a.entries(), b.entries());
                xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|((ka, va), (kb, vb))| {
                        eq_graph(ka, kb, seen) && eq_graph(va, vb, seen)
                    })
            }
            (Builtin::Set(a), Builtin::Set(b)) => {
                let (xs, ys) = (a.values(), b.values());
                xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| eq_graph(p, q, seen))
            }
            (Builtin::Buffer(a), Builtin::Buffer(b)) => a.to_vec() == b.to_vec(),
            (Builtin::Typed(a), Builtin::Typed(b)) => {
                a.kind() == b.kind()
                    && a.byte_offset() == b.byte_offset()
                    && a.len() == b.len()
                    && a.buffer().to_vec() == b.buffer().to_vec()
            }
            _ => false,
        }
    }

    pub(crate) fn fmt_with(&self, f: &mut fmt::Formatter<'_>, dbg: &Dbg<'_>) -> fmt::Result {
        match self {
            Builtin::Map(m) => {
                let entries = m.entries();
                f.write_str("Map ")?;
                f.debug_map()
                    .entries(entries.iter().map(|(k, v)| (dbg.child(k), dbg.child(v))))
                    .finish()
            }
            Builtin::Set(s) => {
                let values = s.values();
                f.write_str("Set ")?;
                f.debug_set().entries(values.iter().map(|v| dbg.child(v))).finish()
            }
            Builtin::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Builtin::Typed(t) => write!(f, "{:?}Array(+{}, {})", t.kind(), t.byte_offset(), t.len()),
        }
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Builtin(self.clone()), f)
    }
}

macro_rules! debug_as_builtin {
    ($($ty:ty),*) => {$(
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&Builtin::from(self.clone()), f)
            }
        }
    )*};
}

debug_as_builtin!(OrderedMap, Set, Buffer, TypedArray);

impl From<OrderedMap> for Builtin {
    fn from(v: OrderedMap) -> Self { Builtin::Map(v) }
}
impl From<Set> for Builtin {
    fn from(v: Set) -> Self { Builtin::Set(v) }
}
impl From<Buffer> for Builtin {
    fn from(v: Buffer) -> Self { Builtin::Buffer(v) }
}
impl From<TypedArray> for Builtin {
    fn from(v: TypedArray) -> Self { Builtin::Typed(v) }
}

impl From<OrderedMap> for Value {
    fn from(v: OrderedMap) -> Self { Value::Builtin(v.into()) }
}
impl From<Set> for Value {
    fn from(v: Set) -> Self { Value::Builtin(v.into()) }
}
impl From<Buffer> for Value {
    fn from(v: Buffer) -> Self { Value::Builtin(v.into()) }
}
impl From<TypedArray> for Value {
    fn from(v: TypedArray) -> Self { Value::Builtin(v.into()) }
}

// ============================================================================
//  EXTENSION TABLE
// ============================================================================

type EncodeFn = fn(&mut Encoder<'_>, &Builtin) -> Result<()>;
/// Receives the sub-type id and the reference slot reserved for the value.
type DecodeFn = fn(&mut Decoder<'_, '_>, u32, usize) -> Result<Value>;

/// Payload routines for one built-in sub-type.
pub struct Extension {
    pub id: u32,
    pub name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl Extension {
    pub(crate) fn encode(&self, enc: &mut Encoder<'_>, b: &Builtin) -> Result<()> {
        (self.encode)(enc, b)
    }

    pub(crate) fn decode(&self, dec: &mut Decoder<'_, '_>, slot: usize) -> Result<Value> {
        (self.decode)(dec, self.id, slot)
    }
}

macro_rules! typed_extension {
    ($kind:expr, $name:literal) => {
        Extension { id: $kind.sub_type_id(), name: $name, encode: encode_typed, decode: decode_typed }
    };
}

pub static EXTENSIONS: [Extension; 14] = [
    Extension { id: MAP_ID, name: "Map", encode: encode_map, decode: decode_map },
    Extension { id: SET_ID, name: "Set", encode: encode_set, decode: decode_set },
    Extension { id: BUFFER_ID, name: "ArrayBuffer", encode: encode_buffer, decode: decode_buffer },
    typed_extension!(TypedKind::I8, "Int8Array"),
    typed_extension!(TypedKind::U8, "Uint8Array"),
    typed_extension!(TypedKind::U8Clamped, "Uint8ClampedArray"),
    typed_extension!(TypedKind::I16, "Int16Array"),
    typed_extension!(TypedKind::U16, "Uint16Array"),
    typed_extension!(TypedKind::I32, "Int32Array"),
    typed_extension!(TypedKind::U32, "Uint32Array"),
    typed_extension!(TypedKind::F32, "Float32Array"),
    typed_extension!(TypedKind::F64, "Float64Array"),
    typed_extension!(TypedKind::BigI64, "BigInt64Array"),
    typed_extension!(TypedKind::BigU64, "BigUint64Array"),
];

pub fn extension(id: u32) -> Option<&'static Extension> {
    EXTENSIONS.iter().find(|e| e.id == id)
}

const MISMATCH: Error = Error::Malformed("built-in does not match its extension");

fn encode_map(enc: &mut Encoder<'_>, b: &Builtin) -> Result<()> {
    let Builtin::Map(m) = b else { return Err(MISMATCH) };
    let entries = m.entries();
    enc.len(entries.len())?;
    for (k, v) in &entries {
        enc.value(k)?;
        enc.value(v)?;
    }
    Ok(())
}

fn decode_map(dec: &mut Decoder<'_, '_>, _id: u32, slot: usize) -> Result<Value> {
    let map = OrderedMap::new();
    dec.fill(slot, map.clone().into());
    let count = dec.cursor_mut().read_len()?;
    for _ in 0..count {
        let k = dec.value()?;
        let v = dec.value()?;
        map.insert(k, v);
    }
    Ok(map.into())
}

fn encode_set(enc: &mut Encoder<'_>, b: &Builtin) -> Result<()> {
    let Builtin::Set(s) = b else { return Err(MISMATCH) };
    for v in &s.values() {
        enc.value(v)?;
    }
    enc.end();
    Ok(())
}

fn decode_set(dec: &mut Decoder<'_, '_>, _id: u32, slot: usize) -> Result<Value> {
    let set = Set::new();
    dec.fill(slot, set.clone().into());
    while !dec.at_end()? {
        let v = dec.value()?;
        set.add(v);
    }
    Ok(set.into())
}

fn encode_buffer(enc: &mut Encoder<'_>, b: &Builtin) -> Result<()> {
    let Builtin::Buffer(buf) = b else { return Err(MISMATCH) };
    let bytes = buf.to_vec();
    enc.len(bytes.len())?;
    enc.raw(&bytes);
    Ok(())
}

fn decode_buffer(dec: &mut Decoder<'_, '_>, _id: u32, _slot: usize) -> Result<Value> {
    let cursor = dec.cursor_mut();
    let len = cursor.read_len()?;
    let bytes = cursor.read_bytes(len)?;
    Ok(Buffer::new(bytes.to_vec()).into())
}

fn encode_typed(enc: &mut Encoder<'_>, b: &Builtin) -> Result<()> {
    let Builtin::Typed(t) = b else { return Err(MISMATCH) };
    enc.len(t.byte_offset())?;
    enc.len(t.len())?;
    enc.value(&Value::from(t.buffer().clone()))
}

fn decode_typed(dec: &mut Decoder<'_, '_>, id: u32, _slot: usize) -> Result<Value> {
    let kind = TypedKind::from_sub_type_id(id).ok_or(Error::UnknownBuiltin(id))?;
    let byte_offset = dec.cursor_mut().read_len()?;
    let length = dec.cursor_mut().read_len()?;
    let Value::Builtin(Builtin::Buffer(buffer)) = dec.value()? else {
        return Err(Error::Malformed("typed view is not backed by a buffer"));
    };
    Ok(TypedArray::new(kind, buffer, byte_offset, length)?.into())
}
