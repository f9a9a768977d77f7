//! # rcopack
//!
//! A tagged binary codec for structured value graphs that may contain cycles,
//! shared handles, big integers, binary buffers, and function references.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag][payload]`, integers as vints, floats as 8 LE bytes.
//! - **Strings**: `[Tag][vint len][UTF-8]`.
//! - **Lists / sets**: `[Tag][elements...][0x00]`.
//! - **Objects / instances**: `[Tag][vint count][key value]...`.
//! - **Back-references**: `[Tag][vint index]` into the decode-order list of
//!   values, which is how sharing and cycles survive the trip.
//!
//! Functions only cross by registry name. The function-by-value tag is never
//! written and always refused on decode.

use std::sync::Arc;

pub mod bigint;
pub mod builtin;
pub mod cursor;
pub mod decoder;
pub mod encoder;
pub mod registry;
pub mod types;
pub mod value;
pub mod vint;

pub use types::Error;
pub use types::Limits;
pub use types::Result;
pub use types::Tag;

pub use bigint::BigInt;
pub use builtin::Buffer;
pub use builtin::Builtin;
pub use builtin::OrderedMap;
pub use builtin::Set;
pub use builtin::TypedArray;
pub use builtin::TypedKind;
pub use cursor::Cursor;
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use registry::ClassDef;
pub use registry::Registry;
pub use value::BoxFuture;
pub use value::CallResult;
pub use value::Callable;
pub use value::Function;
pub use value::Instance;
pub use value::List;
pub use value::Object;
pub use value::Symbol;
pub use value::Value;

/// An encoder/decoder pair bound to one registry.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    registry: Arc<Registry>,
    limits: Limits,
}

impl Codec {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, limits: Limits::default() }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn encode(&self, v: &Value) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_limits(&self.registry, self.limits);
        enc.value(v)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Decoder::with_limits(bytes, &self.registry, self.limits).finish()
    }
}
