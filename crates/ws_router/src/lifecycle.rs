use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::warn;
use ws_proto::WsError;

use crate::{clock::Clock, connection::ClientId, context::MessageContext};

/// Observer invoked for every error the engine recovers. The context is
/// present when dispatch had progressed far enough to build one.
pub type ErrorHandler = Arc<dyn Fn(&WsError, Option<&MessageContext>) + Send + Sync>;

/// Hook invoked when a connection opens.
pub type OpenHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Hook invoked when a connection closes, with the close code and
/// reason when the adapter reported them.
pub type CloseHandler = Arc<dyn Fn(&str, Option<u16>, Option<&str>) + Send + Sync>;

/// Error sink, open/close hooks, and per-connection activity stamps.
///
/// Hooks are split into two tiers: internal hooks installed by
/// capability plugins run before router-level hooks registered by the
/// application, for both open and close.
pub struct LifecycleManager {
    clock: Arc<dyn Clock>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    internal_open: Mutex<Vec<OpenHandler>>,
    open_handlers: Mutex<Vec<OpenHandler>>,
    internal_close: Mutex<Vec<CloseHandler>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    activity: Mutex<HashMap<ClientId, u64>>,
}

impl LifecycleManager {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            error_handlers: Mutex::new(Vec::new()),
            internal_open: Mutex::new(Vec::new()),
            open_handlers: Mutex::new(Vec::new()),
            internal_close: Mutex::new(Vec::new()),
            close_handlers: Mutex::new(Vec::new()),
            activity: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.error_handlers
            .lock()
            .expect("error handler lock")
            .push(handler);
    }

    pub(crate) fn on_open_internal(&self, handler: OpenHandler) {
        self.internal_open
            .lock()
            .expect("open hook lock")
            .push(handler);
    }

    pub fn on_open(&self, handler: OpenHandler) {
        self.open_handlers
            .lock()
            .expect("open hook lock")
            .push(handler);
    }

    pub(crate) fn on_close_internal(&self, handler: CloseHandler) {
        self.internal_close
            .lock()
            .expect("close hook lock")
            .push(handler);
    }

    pub fn on_close(&self, handler: CloseHandler) {
        self.close_handlers
            .lock()
            .expect("close hook lock")
            .push(handler);
    }

    /// Routes one recovered error to every registered observer.
    ///
    /// Never propagates: with no observers installed the error is
    /// logged so it cannot vanish silently.
    pub fn handle_error(&self, error: &WsError, ctx: Option<&MessageContext>) {
        let handlers = self
            .error_handlers
            .lock()
            .expect("error handler lock")
            .clone();
        if handlers.is_empty() {
            warn!(code = %error.code, "unhandled router error: {error}");
            return;
        }
        for handler in handlers {
            handler(error, ctx);
        }
    }

    pub(crate) fn run_open(&self, client_id: &str) {
        let internal = self.internal_open.lock().expect("open hook lock").clone();
        let routed = self.open_handlers.lock().expect("open hook lock").clone();
        for hook in internal.iter().chain(routed.iter()) {
            hook(client_id);
        }
    }

    pub(crate) fn run_close(&self, client_id: &str, code: Option<u16>, reason: Option<&str>) {
        let internal = self.internal_close.lock().expect("close hook lock").clone();
        let routed = self.close_handlers.lock().expect("close hook lock").clone();
        for hook in internal.iter().chain(routed.iter()) {
            hook(client_id, code, reason);
        }
    }

    /// Stamps the connection's last-activity time with the current
    /// clock reading.
    pub fn mark_activity(&self, client_id: &str) {
        let now = self.clock.now_millis();
        self.activity
            .lock()
            .expect("activity lock")
            .insert(client_id.to_string(), now);
    }

    /// Last-activity time for a live connection, for external staleness
    /// monitors. The engine itself never closes stale sockets.
    pub fn last_activity(&self, client_id: &str) -> Option<u64> {
        self.activity
            .lock()
            .expect("activity lock")
            .get(client_id)
            .copied()
    }

    pub(crate) fn drop_connection(&self, client_id: &str) {
        self.activity.lock().expect("activity lock").remove(client_id);
    }
}
