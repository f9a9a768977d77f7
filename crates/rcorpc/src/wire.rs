//! # Wire Formats
//!
//! A session picks one outbound representation for its whole life:
//!
//! - **Value**: the packet graph itself, for in-process ports.
//! - **Binary**: rcopack bytes.
//! - **Text**: the rcopack bytes in standard base64, for channels that only
//!   carry strings.
//!
//! Inbound messages are accepted in any representation.

use base64::Engine as _;
use base64::engine::general_purpose;
use rcopack::Codec;
use rcopack::Value;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    Value,
    #[default]
    Binary,
    Text,
}

/// What crosses a `Port`.
#[derive(Debug, Clone)]
pub enum Message {
    Value(Value),
    Binary(Vec<u8>),
    Text(String),
}

impl WireFormat {
    pub fn encode(self, codec: &Codec, packet: Value) -> Result<Message> {
        Ok(match self {
            Self::Value => Message::Value(packet),
            Self::Binary => Message::Binary(codec.encode(&packet)?),
            Self::Text => Message::Text(general_purpose::STANDARD.encode(codec.encode(&packet)?)),
        })
    }
}

impl Message {
    pub fn format(&self) -> WireFormat {
        match self {
            Self::Value(_) => WireFormat::Value,
            Self::Binary(_) => WireFormat::Binary,
            Self::Text(_) => WireFormat::Text,
        }
    }

    pub fn decode(self, codec: &Codec) -> Result<Value> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Binary(bytes) => Ok(codec.decode(&bytes)?),
            Self::Text(text) => {
                let bytes = general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map_err(|e| Error::Protocol(format!("invalid base64: {}", e)))?;
                Ok(codec.decode(&bytes)?)
            }
        }
    }
}
