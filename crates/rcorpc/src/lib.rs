//! # rcorpc
//!
//! Bidirectional remote function invocation over any ordered, reliable
//! message port, with values carried by rcopack.
//!
//! Either side can expose named functions and call the other's. Functions
//! inside arguments and results cross as identifiers and come out the other
//! side as proxies, so callbacks work in both directions.

pub mod channel;
pub mod error;
pub mod marshal;
pub mod packet;
pub mod session;
pub mod transport;
pub mod wire;

pub use channel::DuplexChannel;
pub use error::Error;
pub use error::Result;
pub use packet::Invoke;
pub use packet::Packet;
pub use packet::Target;
pub use session::Session;
pub use session::SessionConfig;
pub use transport::Port;
pub use transport::PortError;
pub use wire::Message;
pub use wire::WireFormat;

#[cfg(test)]
mod tests;
