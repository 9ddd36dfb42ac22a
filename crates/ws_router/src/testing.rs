//! In-memory test doubles: a capturing socket and a manual clock.
//!
//! These back the crate's own tests and are exported for hosts writing
//! handler tests without a real transport.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use ws_proto::Envelope;

use crate::{
    clock::Clock,
    socket::{ReadyState, ServerSocket, SocketError},
};

/// Socket double that records every outbound frame.
pub struct MemorySocket {
    state: Mutex<ReadyState>,
    sent: Mutex<Vec<String>>,
    closed_with: Mutex<Option<(u16, String)>>,
}

impl MemorySocket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadyState::Open),
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
        }
    }

    /// Raw captured frames in send order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Captured frames decoded as envelopes.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("captured frame is an envelope"))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().expect("sent lock").clear();
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Close code and reason, when the engine closed the socket.
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with.lock().expect("close lock").clone()
    }
}

impl Default for MemorySocket {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSocket for MemorySocket {
    fn send(&self, frame: &str) -> Result<(), SocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SocketError::NotOpen);
        }
        self.sent.lock().expect("sent lock").push(frame.to_string());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.set_ready_state(ReadyState::Closed);
        *self.closed_with.lock().expect("close lock") = Some((code, reason.to_string()));
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().expect("state lock")
    }
}

/// Manually driven clock for timer-sensitive tests.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Moves time backwards, for non-monotonic clock scenarios.
    pub fn rewind(&self, millis: u64) {
        let current = self.now.load(Ordering::SeqCst);
        self.now
            .store(current.saturating_sub(millis), Ordering::SeqCst);
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
