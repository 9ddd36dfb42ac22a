use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time};
use tracing::debug;
use ws_proto::{ErrorCode, RetryAfter, WsError};

use crate::{clock::Clock, connection::ClientId};

/// RPC lifecycle knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcConfig {
    /// Per-socket cap on concurrently admitted requests.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Requests idle longer than this are cancelled by the sweep.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Cadence of the idle sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_max_inflight() -> usize {
    2048
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Callback fired when an in-flight request is cancelled.
pub type CancelCallback = Box<dyn FnOnce() + Send>;

struct RequestState {
    created_at: u64,
    last_activity_at: u64,
    cancel_callbacks: Vec<(u64, CancelCallback)>,
}

#[derive(Default)]
struct SocketState {
    inflight: usize,
    requests: HashMap<String, RequestState>,
}

/// Per-request RPC state: admission, activity, the one-shot terminal
/// flag, cancellation fan-out, and the idle sweep.
///
/// A request lives from `on_request` until the first of terminal,
/// abort, disconnect, or idle cancellation; every exit prunes its state,
/// so a later `reply`, `error`, or `progress` for the same correlation
/// id finds nothing and is suppressed. Between a racing `reply` and
/// `abort` the first caller to take the state wins; the loser no-ops.
pub struct RpcManager {
    config: RpcConfig,
    clock: Arc<dyn Clock>,
    sockets: Mutex<HashMap<ClientId, SocketState>>,
    next_cancel_token: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<RpcManager>,
}

impl RpcManager {
    pub(crate) fn new(config: RpcConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            clock,
            sockets: Mutex::new(HashMap::new()),
            next_cancel_token: AtomicU64::new(1),
            sweeper: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Admits a new request, or refreshes activity for a correlation id
    /// that is already live. Refuses when the per-socket cap is hit.
    pub fn on_request(&self, client_id: &str, correlation_id: &str) -> Result<(), WsError> {
        let now = self.clock.now_millis();
        let mut sockets = self.sockets.lock().expect("rpc state lock");
        let socket = sockets.entry(client_id.to_string()).or_default();

        if let Some(request) = socket.requests.get_mut(correlation_id) {
            request.last_activity_at = now;
            return Ok(());
        }

        if socket.inflight >= self.config.max_inflight {
            return Err(WsError::with_message(
                ErrorCode::ResourceExhausted,
                format!(
                    "connection at rpc capacity ({} in-flight requests)",
                    self.config.max_inflight
                ),
            )
            .with_retry_after(RetryAfter::After(100))
            .with_correlation_id(correlation_id));
        }

        socket.inflight += 1;
        socket.requests.insert(
            correlation_id.to_string(),
            RequestState {
                created_at: now,
                last_activity_at: now,
                cancel_callbacks: Vec::new(),
            },
        );
        Ok(())
    }

    /// Marks activity for a live request. Returns `false` when the
    /// request has already reached a terminal or cancelled state, in
    /// which case the caller must suppress the frame.
    pub fn on_progress(&self, client_id: &str, correlation_id: &str) -> bool {
        let now = self.clock.now_millis();
        let mut sockets = self.sockets.lock().expect("rpc state lock");
        let Some(request) = sockets
            .get_mut(client_id)
            .and_then(|socket| socket.requests.get_mut(correlation_id))
        else {
            return false;
        };
        request.last_activity_at = now;
        true
    }

    /// Claims the one-shot terminal flag. The first of `reply` / `error`
    /// to arrive gets `true`; everything afterwards gets `false`.
    pub fn on_terminal(&self, client_id: &str, correlation_id: &str) -> bool {
        let mut sockets = self.sockets.lock().expect("rpc state lock");
        let Some(socket) = sockets.get_mut(client_id) else {
            return false;
        };
        if socket.requests.remove(correlation_id).is_none() {
            return false;
        }
        socket.inflight -= 1;
        true
    }

    /// Cancels a live request, firing cancel callbacks in registration
    /// order. Idempotent: a second abort (or an abort racing a reply)
    /// finds no state and no-ops.
    pub fn on_abort(&self, client_id: &str, correlation_id: &str) {
        let callbacks = {
            let mut sockets = self.sockets.lock().expect("rpc state lock");
            let Some(socket) = sockets.get_mut(client_id) else {
                return;
            };
            let Some(request) = socket.requests.remove(correlation_id) else {
                return;
            };
            socket.inflight -= 1;
            request.cancel_callbacks
        };

        // Callbacks run outside the lock so they may call back into the
        // manager.
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Cancels every live request for a socket and drops its state.
    pub fn on_disconnect(&self, client_id: &str) {
        let requests = {
            let mut sockets = self.sockets.lock().expect("rpc state lock");
            match sockets.remove(client_id) {
                Some(socket) => socket.requests,
                None => return,
            }
        };

        for (correlation_id, request) in requests {
            debug!(client_id, correlation_id, "cancelling rpc on disconnect");
            for (_, callback) in request.cancel_callbacks {
                callback();
            }
        }
    }

    /// Subscribes to cancellation of one request. If the request is
    /// already gone the callback fires immediately.
    pub fn on_cancel(
        &self,
        client_id: &str,
        correlation_id: &str,
        callback: CancelCallback,
    ) -> CancelRegistration {
        let token = self.next_cancel_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut sockets = self.sockets.lock().expect("rpc state lock");
            if let Some(request) = sockets
                .get_mut(client_id)
                .and_then(|socket| socket.requests.get_mut(correlation_id))
            {
                request.cancel_callbacks.push((token, callback));
                return CancelRegistration {
                    manager: self.weak_self.clone(),
                    client_id: client_id.to_string(),
                    correlation_id: correlation_id.to_string(),
                    token,
                };
            }
        }

        callback();
        CancelRegistration {
            manager: Weak::new(),
            client_id: String::new(),
            correlation_id: String::new(),
            token,
        }
    }

    /// Arms the periodic idle sweep. Safe to call once per manager;
    /// restarting after `stop` re-arms.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().expect("sweeper lock");
        if sweeper.is_some() {
            return;
        }

        let manager = self.weak_self.clone();
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh manager
            // does not sweep at arm time.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_idle();
            }
        }));
    }

    /// Disarms the idle sweep.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
    }

    fn sweep_idle(&self) {
        let now = self.clock.now_millis();
        let idle_timeout = self.config.idle_timeout_ms;

        let stale: Vec<(ClientId, String)> = {
            let sockets = self.sockets.lock().expect("rpc state lock");
            sockets
                .iter()
                .flat_map(|(client_id, socket)| {
                    socket.requests.iter().filter_map(move |(correlation_id, request)| {
                        (now.saturating_sub(request.last_activity_at) > idle_timeout)
                            .then(|| (client_id.clone(), correlation_id.clone()))
                    })
                })
                .collect()
        };

        for (client_id, correlation_id) in stale {
            debug!(%client_id, %correlation_id, "cancelling idle rpc");
            self.on_abort(&client_id, &correlation_id);
        }
    }

    /// Age of a request in milliseconds, if it is live.
    pub fn request_age(&self, client_id: &str, correlation_id: &str) -> Option<u64> {
        let sockets = self.sockets.lock().expect("rpc state lock");
        let request = sockets.get(client_id)?.requests.get(correlation_id)?;
        Some(self.clock.now_millis().saturating_sub(request.created_at))
    }

    /// Number of live requests for a socket.
    pub fn inflight(&self, client_id: &str) -> usize {
        self.sockets
            .lock()
            .expect("rpc state lock")
            .get(client_id)
            .map(|socket| socket.inflight)
            .unwrap_or(0)
    }
}

impl Drop for RpcManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
    }
}

/// Handle returned by [`RpcManager::on_cancel`]; dropping it keeps the
/// subscription, calling [`CancelRegistration::unregister`] removes it.
pub struct CancelRegistration {
    manager: Weak<RpcManager>,
    client_id: ClientId,
    correlation_id: String,
    token: u64,
}

impl CancelRegistration {
    pub fn unregister(self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut sockets = manager.sockets.lock().expect("rpc state lock");
        if let Some(request) = sockets
            .get_mut(&self.client_id)
            .and_then(|socket| socket.requests.get_mut(&self.correlation_id))
        {
            request
                .cancel_callbacks
                .retain(|(token, _)| *token != self.token);
        }
    }
}
