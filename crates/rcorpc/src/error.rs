//! # Error Definitions
//!
//! Local failures of the RPC layer. A remote function that throws is not a
//! local failure in itself; it surfaces to the caller as `Error::Remote`
//! carrying whatever value was thrown.

use rcopack::Value;

use crate::transport::PortError;

#[derive(Debug, Clone)]
pub enum Error {
    /// Encoding or decoding a packet failed.
    Codec(rcopack::Error),
    /// The port refused a message.
    Port(PortError),
    /// A decoded value does not have the shape of a packet.
    Protocol(String),
    /// The remote side rejected the call with this value.
    Remote(Value),
    /// The session or its transport is gone.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::Port(e) => write!(f, "port error: {}", e),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::Remote(v) => match v.as_str() {
                Some(s) => write!(f, "remote error: {}", s),
                None => write!(f, "remote error: {:?}", v),
            },
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rcopack::Error> for Error {
    fn from(e: rcopack::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<PortError> for Error {
    fn from(e: PortError) -> Self {
        Self::Port(e)
    }
}

impl Error {
    /// The value a proxy throws into application code for this failure.
    pub fn into_thrown(self) -> Value {
        match self {
            Self::Remote(v) => v,
            other => Value::Str(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
