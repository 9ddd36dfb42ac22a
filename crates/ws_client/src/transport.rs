use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Connection state as reported by the platform socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events a transport delivers to the client driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
    Error(String),
}

/// One platform WebSocket, as the client sees it.
pub trait ClientTransport: Send + Sync {
    /// Enqueues one outbound text frame.
    fn send(&self, frame: &str) -> Result<(), ClientError>;

    /// Starts the close handshake.
    fn close(&self, code: u16, reason: &str);

    fn ready_state(&self) -> TransportState;
}

/// Stream of transport events; ends when the transport goes away.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Injection point for transports: real WebSockets in production, the
/// fake in tests.
///
/// `connect` resolves once the transport exists; the `Open` event on
/// the returned stream marks the socket actually open.
#[async_trait]
pub trait ClientTransportFactory: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn ClientTransport>, TransportEvents), ClientError>;
}
