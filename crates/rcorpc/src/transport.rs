//! # Port Abstraction
//!
//! An ordered, reliable message channel between two sessions. The port moves
//! `Message`s and knows nothing about packets, continuations, or functions.

use std::fmt;

use crate::wire::Message;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum PortError {
    /// The other end went away.
    ConnectionLost(String),
    /// The port cannot carry this kind of message.
    Unsupported(&'static str),
    /// Generic I/O failure.
    Io(String),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Unsupported(kind) => write!(f, "port cannot carry {} messages", kind),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PortError {}

pub type Result<T> = std::result::Result<T, PortError>;

/// One end of a message channel.
///
/// Object safe, so a session can hold it as `Arc<dyn Port>`.
#[async_trait::async_trait]
pub trait Port: Send + Sync + 'static {
    /// Queues a message for the other end.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the other end closed.
    async fn recv(&self) -> Result<Option<Message>>;
}
