//! In-process ports.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Port;
use crate::transport::PortError;
use crate::wire::Message;

/// One end of an in-process duplex channel.
///
/// Messages sent on one end appear on the other end's `recv`. Dropping an end
/// closes the direction it sends on.
pub struct DuplexChannel {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl DuplexChannel {
    pub fn new(tx: mpsc::UnboundedSender<Message>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Port for DuplexChannel {
    async fn send(&self, msg: Message) -> transport::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| PortError::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
