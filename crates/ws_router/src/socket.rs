use thiserror::Error;

/// Connection lifecycle state as reported by the platform socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Errors surfaced by a transport adapter when a frame cannot be
/// handed to the platform socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is not open")]
    NotOpen,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Transport seam the engine talks to.
///
/// Adapters wrap their platform WebSocket behind this trait. `send` is a
/// non-blocking enqueue: the adapter owns buffering and flushing, and a
/// send against a closing socket is a harmless error, never a panic.
pub trait ServerSocket: Send + Sync {
    /// Enqueues one outbound text frame.
    fn send(&self, frame: &str) -> Result<(), SocketError>;

    /// Initiates a close handshake.
    fn close(&self, code: u16, reason: &str);

    /// Current connection state.
    fn ready_state(&self) -> ReadyState;
}
