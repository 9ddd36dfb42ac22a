//! Scriptable fake transport for exercising the client without a
//! network.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use ws_proto::Envelope;

use crate::{
    error::ClientError,
    transport::{ClientTransport, ClientTransportFactory, TransportEvent, TransportEvents},
};

/// One fake connection. Tests drive the server side through the
/// `emit_*` methods and inspect what the client sent.
pub struct FakeTransport {
    state: Mutex<crate::transport::TransportState>,
    sent: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed_by_client: Mutex<Option<(u16, String)>>,
}

impl FakeTransport {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Mutex::new(crate::transport::TransportState::Connecting),
            sent: Mutex::new(Vec::new()),
            events,
            closed_by_client: Mutex::new(None),
        }
    }

    /// Frames the client handed to this transport, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Sent frames decoded as envelopes.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("sent frame is an envelope"))
            .collect()
    }

    /// Close code/reason if the client closed this transport.
    pub fn closed_by_client(&self) -> Option<(u16, String)> {
        self.closed_by_client.lock().expect("close lock").clone()
    }

    /// Marks the socket open and notifies the client.
    pub fn emit_open(&self) {
        *self.state.lock().expect("state lock") = crate::transport::TransportState::Open;
        let _ = self.events.send(TransportEvent::Open);
    }

    /// Delivers one server frame to the client.
    pub fn emit_message(&self, frame: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(frame.into()));
    }

    /// Delivers a server envelope to the client.
    pub fn emit_envelope(&self, envelope: &Envelope) {
        self.emit_message(envelope.encode().expect("envelope encodes"));
    }

    pub fn emit_error(&self, detail: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error(detail.into()));
    }

    /// Closes the socket from the server side.
    pub fn emit_close(&self, code: Option<u16>, reason: Option<&str>) {
        *self.state.lock().expect("state lock") = crate::transport::TransportState::Closed;
        let _ = self.events.send(TransportEvent::Close {
            code,
            reason: reason.map(str::to_string),
        });
    }
}

impl ClientTransport for FakeTransport {
    fn send(&self, frame: &str) -> Result<(), ClientError> {
        if self.ready_state() == crate::transport::TransportState::Closed {
            return Err(ClientError::ConnectionClosed);
        }
        self.sent.lock().expect("sent lock").push(frame.to_string());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        *self.closed_by_client.lock().expect("close lock") = Some((code, reason.to_string()));
        *self.state.lock().expect("state lock") = crate::transport::TransportState::Closing;
        // Mirror a well-behaved peer: the close handshake completes.
        let _ = self.events.send(TransportEvent::Close {
            code: Some(code),
            reason: Some(reason.to_string()),
        });
    }

    fn ready_state(&self) -> crate::transport::TransportState {
        *self.state.lock().expect("state lock")
    }
}

/// Factory producing [`FakeTransport`]s.
///
/// `fail_next` makes the next N dials error (for reconnect tests);
/// `auto_open` emits `Open` as soon as a dial succeeds. Every created
/// transport is retained for inspection.
pub struct FakeTransportFactory {
    auto_open: bool,
    fail_next: AtomicUsize,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self {
            auto_open: true,
            fail_next: AtomicUsize::new(0),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Factory whose transports stay in `Connecting` until the test
    /// calls [`FakeTransport::emit_open`].
    pub fn manual_open() -> Self {
        Self {
            auto_open: false,
            fail_next: AtomicUsize::new(0),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Transports created so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().expect("transports lock").clone()
    }

    pub fn latest(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().expect("transports lock").last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.transports.lock().expect("transports lock").len()
    }
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransportFactory for FakeTransportFactory {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn ClientTransport>, TransportEvents), ClientError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Transport("connection refused".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::new(events_tx));
        self.transports
            .lock()
            .expect("transports lock")
            .push(Arc::clone(&transport));

        if self.auto_open {
            transport.emit_open();
        }
        Ok((transport as Arc<dyn ClientTransport>, events_rx))
    }
}
