//! Core types for the rcopack binary format

/// Leading byte of every encoded value.
///
/// Zero is never a tag; it terminates lists and sets.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Int = 1,
    Float = 2,
    String = 3,
    Object = 4,
    List = 5,
    Instance = 6,
    Undefined = 7,
    False = 8,
    True = 9,
    Symbol = 10,
    Null = 11,
    BigIntPos = 12,
    BigIntNeg = 13,
    Reference = 14,
    Builtin = 15,
    /// Function-by-value. Reserved so that it can be refused, never emitted.
    FunctionCode = 16,
    SafetyFunction = 17,
}

/// Terminates the element run of a list or set.
pub const END: u8 = 0x00;

impl Tag {
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Tag::Int),
            2 => Some(Tag::Float),
            3 => Some(Tag::String),
            4 => Some(Tag::Object),
            5 => Some(Tag::List),
            6 => Some(Tag::Instance),
            7 => Some(Tag::Undefined),
            8 => Some(Tag::False),
            9 => Some(Tag::True),
            10 => Some(Tag::Symbol),
            11 => Some(Tag::Null),
            12 => Some(Tag::BigIntPos),
            13 => Some(Tag::BigIntNeg),
            14 => Some(Tag::Reference),
            15 => Some(Tag::Builtin),
            16 => Some(Tag::FunctionCode),
            17 => Some(Tag::SafetyFunction),
            _ => None,
        }
    }
}

/// Codec failures.
///
/// Every decode error aborts the whole buffer; no partially built value is
/// ever handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted; the payload needs this many more bytes.
    Pending(usize),
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// A vint carried more than 32 bits.
    VintOverflow,
    /// Built-in container sub-type id with no entry in the extension table.
    UnknownBuiltin(u32),
    /// Class identifier with no registered class.
    UnknownClass(String),
    /// Safety-function identifier with no registered function.
    UnknownFunction(String),
    /// Tag 16 was read. Code never crosses a context boundary.
    FunctionForbidden,
    /// Back-reference to an index that has not been decoded yet.
    BadReference(u32),
    /// Structurally invalid payload.
    Malformed(&'static str),
    /// Bytes left over after the root value.
    TrailingBytes(usize),
    /// Nesting went deeper than `Limits::max_depth`.
    DepthExceeded(usize),
    /// A length does not fit in 32 bits.
    TooLarge(usize),
    /// Registry name or function registered twice.
    DuplicateName(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Pending(n) => write!(f, "unexpected end of buffer, {} more bytes needed", n),
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            Error::VintOverflow => write!(f, "vint exceeds 32 bits"),
            Error::UnknownBuiltin(id) => write!(f, "unknown built-in sub-type id {}", id),
            Error::UnknownClass(name) => write!(f, "class '{}' is not registered", name),
            Error::UnknownFunction(name) => write!(f, "safety function '{}' is not registered", name),
            Error::FunctionForbidden => write!(f, "function-by-value is never decoded"),
            Error::BadReference(i) => write!(f, "back-reference to undecoded index {}", i),
            Error::Malformed(what) => write!(f, "malformed payload: {}", what),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after root value", n),
            Error::DepthExceeded(d) => write!(f, "nesting depth exceeds {}", d),
            Error::TooLarge(n) => write!(f, "length {} does not fit in 32 bits", n),
            Error::DuplicateName(name) => write!(f, "'{}' is already registered", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Bounds applied to a single encode or decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum container nesting.
    pub max_depth: usize,
}

impl Limits {
    pub const fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_depth: 512 }
    }
}
