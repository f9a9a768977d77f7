//! The value graph rcopack encodes.
//!
//! Scalars are plain data. Containers, symbols, built-ins and functions are
//! shared handles: cloning one keeps its identity, which is what the encoder
//! keys back-references on.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::bigint::BigInt;
use crate::builtin::Builtin;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn addr<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    /// Integers in the signed 32-bit range travel as vints; anything wider
    /// falls back to the float encoding.
    Int(i64),
    Float(f64),
    Str(String),
    BigInt(BigInt),
    Symbol(Symbol),
    List(List),
    Object(Object),
    Instance(Instance),
    Builtin(Builtin),
    Function(Function),
}

impl Value {
    /// Address of the shared allocation behind an identity-bearing value.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Symbol(s) => Some(addr(&s.0)),
            Value::List(l) => Some(addr(&l.0)),
            Value::Object(o) => Some(addr(&o.0)),
            Value::Instance(i) => Some(addr(&i.0)),
            Value::Builtin(b) => Some(b.identity()),
            Value::Function(f) => Some(addr(&f.0)),
            _ => None,
        }
    }

    /// True when both values are the same shared handle.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(List::from_vec(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let obj = Object::new();
        for (k, v) in entries {
            obj.insert(k, v);
        }
        Value::Object(obj)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Instance(_) => "instance",
            Value::Builtin(_) => "builtin",
            Value::Function(_) => "function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integral numbers, whichever encoding path they took.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_builtin(&self) -> Option<&Builtin> {
        match self {
            Value::Builtin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v.into()) }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_owned()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}
impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self { Value::BigInt(v) }
}
impl From<Symbol> for Value {
    fn from(v: Symbol) -> Self { Value::Symbol(v) }
}
impl From<List> for Value {
    fn from(v: List) -> Self { Value::List(v) }
}
impl From<Object> for Value {
    fn from(v: Object) -> Self { Value::Object(v) }
}
impl From<Instance> for Value {
    fn from(v: Instance) -> Self { Value::Instance(v) }
}
impl From<Builtin> for Value {
    fn from(v: Builtin) -> Self { Value::Builtin(v) }
}
impl From<Function> for Value {
    fn from(v: Function) -> Self { Value::Function(v) }
}

// ============================================================================
//  HANDLES
// ============================================================================

/// An opaque symbol. Two symbols are the same only if they are the same
/// handle; the description is informational.
#[derive(Clone)]
pub struct Symbol(Arc<Option<String>>);

impl Symbol {
    pub fn new(description: Option<String>) -> Self {
        Self(Arc::new(description))
    }

    pub fn description(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn ptr_eq(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An ordered, shared, mutable list.
#[derive(Clone, Default)]
pub struct List(Arc<Mutex<Vec<Value>>>);

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    pub fn push(&self, v: Value) {
        lock(&self.0).push(v);
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        lock(&self.0).get(i).cloned()
    }

    pub fn set(&self, i: usize, v: Value) -> bool {
        match lock(&self.0).get_mut(i) {
            Some(slot) => { *slot = v; true }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current elements; the lock is not held afterwards.
    pub fn items(&self) -> Vec<Value> {
        lock(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// String-keyed entries in insertion order with a key index.
#[derive(Clone, Default)]
struct Fields {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl Fields {
    fn insert(&mut self, key: String, v: Value) -> Option<Value> {
        if let Some(slot) = self.index.get(&key).and_then(|&i| self.entries.get_mut(i)) {
            return Some(std::mem::replace(&mut slot.1, v));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, v));
        None
    }

    fn get(&self, key: &str) -> Option<Value> {
        let i = *self.index.get(key)?;
        self.entries.get(i).map(|(_, v)| v.clone())
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.index.remove(key)?;
        let (_, v) = self.entries.remove(pos);
        for i in self.index.values_mut() {
            if *i > pos {
                *i -= 1;
            }
        }
        Some(v)
    }
}

/// A shared string-keyed mapping. Key order is kept but carries no meaning.
#[derive(Clone, Default)]
pub struct Object(Arc<Mutex<Fields>>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, v: Value) -> Option<Value> {
        lock(&self.0).insert(key.into(), v)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.0).get(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        lock(&self.0).remove(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.0).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        lock(&self.0).entries.clone()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct InstanceData {
    class: String,
    fields: Mutex<Fields>,
}

/// An instance of a registered class: identifier plus ordered fields.
#[derive(Clone)]
pub struct Instance(Arc<InstanceData>);

impl Instance {
    pub fn new(class: impl Into<String>) -> Self {
        Self(Arc::new(InstanceData {
            class: class.into(),
            fields: Mutex::new(Fields::default()),
        }))
    }

    pub fn with_fields<K: Into<String>>(
        class: impl Into<String>,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Self {
        let inst = Self::new(class);
        for (k, v) in fields {
            inst.set(k, v);
        }
        inst
    }

    pub fn class(&self) -> &str {
        &self.0.class
    }

    pub fn set(&self, field: impl Into<String>, v: Value) {
        lock(&self.0.fields).insert(field.into(), v);
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        lock(&self.0.fields).get(field)
    }

    pub fn fields(&self) -> Vec<(String, Value)> {
        lock(&self.0.fields).entries.clone()
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
//  FUNCTIONS
// ============================================================================

/// Outcome of a call: `Err` carries the thrown value.
pub type CallResult = std::result::Result<Value, Value>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Anything that can sit behind a `Function` handle.
pub trait Callable: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>) -> BoxFuture<CallResult>;
}

struct AsyncFn<F>(F);

impl<F, Fut> Callable for AsyncFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<CallResult> {
        Box::pin((self.0)(args))
    }
}

struct SyncFn<F>(F);

impl<F> Callable for SyncFn<F>
where
    F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<CallResult> {
        Box::pin(std::future::ready((self.0)(args)))
    }
}

/// A function reference. Never serialized as code: it crosses a boundary
/// either by registry name or as an RPC placeholder.
#[derive(Clone)]
pub struct Function(Arc<dyn Callable>);

impl Function {
    pub fn new(callable: impl Callable) -> Self {
        Self(Arc::new(callable))
    }

    pub fn from_arc(callable: Arc<dyn Callable>) -> Self {
        Self(callable)
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self::new(AsyncFn(f))
    }

    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        Self::new(SyncFn(f))
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<CallResult> {
        self.0.call(args)
    }

    pub fn id(&self) -> usize {
        addr(&self.0)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        self.id() == other.id()
    }
}

// ============================================================================
//  EQUALITY
// ============================================================================

/// Structural equality that terminates on cycles: a pair of handles already
/// under comparison is taken to be equal.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        eq_graph(self, other, &mut HashSet::new())
    }
}

fn same_number(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn eq_entries(
    a: &[(String, Value)],
    b: &[(String, Value)],
    seen: &mut HashSet<(usize, usize)>,
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let by_key: HashMap<&str, &Value> = b.iter().map(|(k, v)| (k.as_str(), v)).collect();
    a.iter().all(|(k, va)| by_key.get(k.as_str()).is_some_and(|vb| eq_graph(va, vb, seen)))
}

pub(crate) fn eq_graph(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    if let (Some(ia), Some(ib)) = (a.identity(), b.identity()) {
        if ia == ib || !seen.insert((ia, ib)) {
            return true;
        }
    }
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => same_number(*x, *y),
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => same_number(*x as f64, *y),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x.description() == y.description(),
        (Value::List(x), Value::List(y)) => {
            let (xs, ys) = (x.items(), y.items());
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| eq_graph(p, q, seen))
        }
        (Value::Object(x), Value::Object(y)) => eq_entries(&x.entries(), &y.entries(), seen),
        (Value::Instance(x), Value::Instance(y)) => {
            x.class() == y.class() && eq_entries(&x.fields(), &y.fields(), seen)
        }
        (Value::Builtin(x), Value::Builtin(y)) => x.eq_graph(y, seen),
        (Value::Function(x), Value::Function(y)) => x.ptr_eq(y),
        _ => false,
    }
}

// ============================================================================
//  DEBUG
// ============================================================================

/// Debug view that prints `<cycle>` instead of re-entering a handle that is
/// already on the current path.
pub(crate) struct Dbg<'a> {
    pub(crate) value: &'a Value,
    pub(crate) path: &'a RefCell<Vec<usize>>,
}

impl Dbg<'_> {
    pub(crate) fn child<'b>(&'b self, value: &'b Value) -> Dbg<'b> {
        Dbg { value, path: self.path }
    }
}

impl fmt::Debug for Dbg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.value.identity();
        if let Some(id) = id {
            if self.path.borrow().contains(&id) {
                return f.write_str("<cycle>");
            }
            self.path.borrow_mut().push(id);
        }
        let out = match self.value {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::BigInt(b) => write!(f, "{}n", b),
            Value::Symbol(s) => match s.description() {
                Some(d) => write!(f, "Symbol({:?})", d),
                None => f.write_str("Symbol()"),
            },
            Value::List(l) => {
                let items = l.items();
                f.debug_list().entries(items.iter().map(|v| self.child(v))).finish()
            }
            Value::Object(o) => {
                let entries = o.entries();
                f.debug_map().entries(entries.iter().map(|(k, v)| (k, self.child(v)))).finish()
            }
            Value::Instance(i) => {
                let fields = i.fields();
                let mut s = f.debug_struct(i.class());
                for (k, v) in &fields {
                    s.field(k, &self.child(v));
                }
                s.finish()
            }
            Value::Builtin(b) => b.fmt_with(f, self),
            Value::Function(func) => write!(f, "Function({:#x})", func.id()),
        };
        if id.is_some() {
            self.path.borrow_mut().pop();
        }
        out
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = RefCell::new(Vec::new());
        Dbg { value: self, path: &path }.fmt(f)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:#x})", self.id())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Symbol(self.clone()), f)
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::List(self.clone()), f)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Object(self.clone()), f)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Instance(self.clone()), f)
    }
}
