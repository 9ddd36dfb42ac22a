use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;
use ws_proto::{
    meta, Envelope, ErrorBody, ErrorCode, MessageDescriptor, Validator, HEARTBEAT_ACK_TYPE,
    RPC_ERROR_TYPE, RPC_PROGRESS_TYPE,
};

use crate::{
    abort::AbortSignal,
    config::{ClientConfig, ReconnectConfig},
    error::ClientError,
    queue::SendQueue,
    transport::{ClientTransport, ClientTransportFactory, TransportEvent, TransportEvents},
};

/// Client connection lifecycle. Re-entering `Connecting` after `Closed`
/// is legal on reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Observer for streamed progress frames of one request.
pub type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handler for server-originated events registered with [`WsClient::on`].
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Per-call options for [`WsClient::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Explicit correlation id; a UUID v4 is generated otherwise.
    pub correlation_id: Option<String>,
    /// Deadline override; the config default applies otherwise.
    pub timeout_ms: Option<u64>,
    /// Cancellation signal. Aborting before dispatch rejects without
    /// sending; aborting later rejects and ignores any late reply.
    pub signal: Option<AbortSignal>,
    /// Invoked for each progress frame before the terminal response.
    pub on_progress: Option<ProgressHandler>,
}

struct PendingRequest {
    expected_type: String,
    responder: oneshot::Sender<Result<Value, ClientError>>,
    on_progress: Option<ProgressHandler>,
}

struct ClientShared {
    config: ClientConfig,
    factory: Arc<dyn ClientTransportFactory>,
    validator: Option<Arc<dyn Validator>>,
    state: watch::Sender<ClientState>,
    transport: Mutex<Option<Arc<dyn ClientTransport>>>,
    queue: Mutex<SendQueue>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    user_closing: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
}

/// Builder for [`WsClient`].
pub struct WsClientBuilder {
    config: ClientConfig,
    factory: Arc<dyn ClientTransportFactory>,
    validator: Option<Arc<dyn Validator>>,
}

impl WsClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a validator applied to outbound payloads while the
    /// connection is open.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> WsClient {
        let queue = SendQueue::new(self.config.queue, self.config.queue_size);
        let (state, _) = watch::channel(ClientState::Idle);
        WsClient {
            shared: Arc::new(ClientShared {
                config: self.config,
                factory: self.factory,
                validator: self.validator,
                state,
                transport: Mutex::new(None),
                queue: Mutex::new(queue),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                user_closing: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }
}

/// Caller-side state machine: connect/reconnect with jittered backoff,
/// a bounded send queue flushed on open, and a correlation-keyed
/// pending-request map with deadlines and cancellation.
#[derive(Clone)]
pub struct WsClient {
    shared: Arc<ClientShared>,
}

impl WsClient {
    /// Builder seeded with the transport injection point and the target
    /// url.
    pub fn builder(
        url: impl Into<String>,
        factory: Arc<dyn ClientTransportFactory>,
    ) -> WsClientBuilder {
        WsClientBuilder {
            config: ClientConfig::new(url),
            factory,
            validator: None,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Connects, resolving once the socket is open.
    ///
    /// When reconnect is enabled the same attempt/backoff policy covers
    /// the initial dial; on final failure the client lands in `Closed`
    /// with the last error surfaced.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.state() == ClientState::Open {
            return Ok(());
        }
        self.shared.user_closing.store(false, Ordering::SeqCst);

        let reconnect = self.shared.config.reconnect;
        let mut attempts: u32 = 0;
        loop {
            self.shared.set_state(ClientState::Connecting);
            attempts += 1;
            match self.shared.factory.connect(&self.shared.config.url).await {
                Ok((transport, events)) => {
                    *self.shared.transport.lock().expect("transport lock") = Some(transport);
                    spawn_driver(Arc::clone(&self.shared), events);
                    return self.await_state(ClientState::Open).await;
                }
                Err(err) => {
                    debug!(attempt = attempts, %err, "connect attempt failed");
                    *self.shared.last_error.lock().expect("last error lock") =
                        Some(err.to_string());
                    if reconnect.enabled && attempts < reconnect.max_attempts {
                        tokio::time::sleep(backoff_delay(attempts, &reconnect)).await;
                        if self.shared.user_closing.load(Ordering::SeqCst) {
                            self.shared.set_state(ClientState::Closed);
                            return Err(ClientError::Cancelled);
                        }
                        continue;
                    }
                    self.shared.set_state(ClientState::Closed);
                    return Err(ClientError::Connect {
                        attempts,
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }

    /// Closes the connection: clears the send queue, rejects pending
    /// requests, and resolves once the socket reports closed.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shared.user_closing.store(true, Ordering::SeqCst);
        self.shared.queue.lock().expect("queue lock").clear();
        self.shared.reject_all_pending();

        let transport = self
            .shared
            .transport
            .lock()
            .expect("transport lock")
            .clone();
        match transport {
            Some(transport) => {
                self.shared.set_state(ClientState::Closing);
                transport.close(1000, "client close");
                self.await_state(ClientState::Closed).await?;
            }
            None => self.shared.set_state(ClientState::Closed),
        }
        Ok(())
    }

    /// Sends one fire-and-forget message.
    ///
    /// Open: the payload is validated (when a validator is installed)
    /// and sent; `false` means it never left. Not open: the queue
    /// policy decides, and accepted frames flush FIFO on the next open.
    pub async fn send(&self, descriptor: &MessageDescriptor, payload: Value) -> bool {
        let envelope = Envelope::new(descriptor.message_type.clone()).with_payload(payload);
        self.dispatch_envelope(descriptor, envelope).await
    }

    /// Issues a request and resolves with the matching response
    /// payload.
    pub async fn request(
        &self,
        request: &MessageDescriptor,
        payload: Value,
        response: &MessageDescriptor,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        if let Some(signal) = &options.signal {
            // A pre-aborted call never dispatches a frame.
            if signal.is_aborted() {
                return Err(ClientError::Cancelled);
            }
        }

        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.shared.config.request_timeout_ms);

        let (responder, mut receiver) = oneshot::channel();
        self.shared.pending.lock().expect("pending lock").insert(
            correlation_id.clone(),
            PendingRequest {
                expected_type: response.message_type.clone(),
                responder,
                on_progress: options.on_progress.clone(),
            },
        );

        let envelope = Envelope::new(request.message_type.clone())
            .with_meta(meta::CORRELATION_ID, Value::from(correlation_id.clone()))
            .with_meta(meta::TIMEOUT_MS, Value::from(timeout_ms))
            .with_payload(payload);

        if !self.dispatch_envelope(request, envelope).await {
            self.shared.take_pending(&correlation_id);
            return Err(ClientError::ConnectionClosed);
        }

        let signal = options.signal.clone();
        tokio::select! {
            outcome = &mut receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(ClientError::ConnectionClosed),
            },
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                self.shared.take_pending(&correlation_id);
                Err(ClientError::DeadlineExceeded { timeout_ms })
            }
            () = wait_abort(signal.as_ref()), if signal.is_some() => {
                self.shared.take_pending(&correlation_id);
                Err(ClientError::Cancelled)
            }
        }
    }

    /// Registers a handler for a server-originated event type.
    pub fn on(&self, descriptor: &MessageDescriptor, handler: EventHandler) {
        self.shared
            .handlers
            .lock()
            .expect("handlers lock")
            .entry(descriptor.message_type.clone())
            .or_default()
            .push(handler);
    }

    /// Number of requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().expect("pending lock").len()
    }

    /// Resolves once the client reaches `wanted`; useful around
    /// reconnects, which progress in the background.
    pub async fn wait_for_state(&self, wanted: ClientState) {
        let mut receiver = self.shared.state.subscribe();
        loop {
            if *receiver.borrow_and_update() == wanted {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    async fn dispatch_envelope(&self, descriptor: &MessageDescriptor, envelope: Envelope) -> bool {
        let mut envelope = envelope;
        if self.state() == ClientState::Open {
            if let Some(validator) = &self.shared.validator {
                let payload = envelope.payload.clone().unwrap_or(Value::Null);
                match validator.validate(descriptor, &payload).await {
                    Ok(validated) => envelope.payload = Some(validated),
                    Err(issues) => {
                        warn!(
                            message_type = %descriptor.message_type,
                            issue_count = issues.0.len(),
                            "outbound payload failed validation; not sent"
                        );
                        return false;
                    }
                }
            }

            let Ok(frame) = envelope.encode() else {
                return false;
            };
            let transport = self
                .shared
                .transport
                .lock()
                .expect("transport lock")
                .clone();
            match transport {
                Some(transport) => transport.send(&frame).is_ok(),
                None => false,
            }
        } else {
            let Ok(frame) = envelope.encode() else {
                return false;
            };
            self.shared.queue.lock().expect("queue lock").offer(frame)
        }
    }

    async fn await_state(&self, wanted: ClientState) -> Result<(), ClientError> {
        let mut receiver = self.shared.state.subscribe();
        loop {
            let current = *receiver.borrow_and_update();
            if current == wanted {
                return Ok(());
            }
            if current == ClientState::Closed {
                let last_error = self
                    .shared
                    .last_error
                    .lock()
                    .expect("last error lock")
                    .clone();
                return Err(match last_error {
                    Some(detail) => ClientError::Transport(detail),
                    None => ClientError::ConnectionClosed,
                });
            }
            if receiver.changed().await.is_err() {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}

impl ClientShared {
    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    fn take_pending(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.pending
            .lock()
            .expect("pending lock")
            .remove(correlation_id)
    }

    fn reject_all_pending(&self) {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .expect("pending lock")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            let _ = entry.responder.send(Err(ClientError::Cancelled));
        }
    }

    /// Queue flush precedes the state flip so sends racing the open
    /// observe FIFO order behind the flushed backlog.
    fn handle_open(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let backlog = self.queue.lock().expect("queue lock").drain();
        if let Some(transport) = self.transport.lock().expect("transport lock").clone() {
            for frame in backlog {
                if let Err(err) = transport.send(&frame) {
                    debug!(%err, "queued frame dropped during flush");
                }
            }
        }
        self.set_state(ClientState::Open);
    }

    fn handle_frame(&self, raw: &str) {
        let envelope = match Envelope::decode(raw, None) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%err, "dropping undecodable inbound frame");
                return;
            }
        };

        match envelope.kind.as_str() {
            RPC_PROGRESS_TYPE => {
                if let Some(correlation_id) = envelope.correlation_id() {
                    let on_progress = {
                        let pending = self.pending.lock().expect("pending lock");
                        pending
                            .get(correlation_id)
                            .and_then(|entry| entry.on_progress.clone())
                    };
                    if let Some(on_progress) = on_progress {
                        on_progress(envelope.payload.clone().unwrap_or(Value::Null));
                    }
                }
                return;
            }
            RPC_ERROR_TYPE => {
                if let Some(correlation_id) = envelope.correlation_id() {
                    if let Some(entry) = self.take_pending(correlation_id) {
                        let body = envelope
                            .payload
                            .clone()
                            .and_then(|payload| serde_json::from_value::<ErrorBody>(payload).ok())
                            .unwrap_or_else(|| {
                                ErrorBody::bare(ErrorCode::Internal, "malformed error payload")
                            });
                        let _ = entry.responder.send(Err(ClientError::Rpc(body)));
                    }
                }
                return;
            }
            HEARTBEAT_ACK_TYPE => return,
            _ => {}
        }

        if let Some(correlation_id) = envelope.correlation_id().map(str::to_string) {
            let mut pending = self.pending.lock().expect("pending lock");
            let is_reply = pending
                .get(&correlation_id)
                .is_some_and(|entry| entry.expected_type == envelope.kind);
            if is_reply {
                if let Some(entry) = pending.remove(&correlation_id) {
                    drop(pending);
                    let payload = envelope.payload.clone().unwrap_or(Value::Null);
                    let _ = entry.responder.send(Ok(payload));
                }
                return;
            }
            // Late or mismatched replies fall through and are dropped
            // below unless an event handler claims the type.
        }

        let handlers = self
            .handlers
            .lock()
            .expect("handlers lock")
            .get(&envelope.kind)
            .cloned();
        match handlers {
            Some(list) if !list.is_empty() => {
                for handler in list {
                    handler(&envelope);
                }
            }
            _ => debug!(kind = %envelope.kind, "no handler for inbound frame"),
        }
    }

    fn handle_close(self: &Arc<Self>, code: Option<u16>, reason: Option<&str>) {
        debug!(code, reason, "transport closed");
        *self.transport.lock().expect("transport lock") = None;

        if self.user_closing.load(Ordering::SeqCst) {
            self.set_state(ClientState::Closed);
            return;
        }

        let reconnect = self.config.reconnect;
        if !reconnect.enabled {
            self.set_state(ClientState::Closed);
            self.reject_all_pending();
            return;
        }

        self.set_state(ClientState::Connecting);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            reconnect_loop(shared).await;
        });
    }
}

fn spawn_driver(shared: Arc<ClientShared>, mut events: TransportEvents) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Open => shared.handle_open(),
                TransportEvent::Message(frame) => shared.handle_frame(&frame),
                TransportEvent::Error(detail) => {
                    warn!(detail, "transport error");
                    *shared.last_error.lock().expect("last error lock") = Some(detail);
                }
                TransportEvent::Close { code, reason } => {
                    shared.handle_close(code, reason.as_deref());
                    return;
                }
            }
        }
        // Event stream ended without a close frame; treat it as one.
        shared.handle_close(None, None);
    });
}

async fn reconnect_loop(shared: Arc<ClientShared>) {
    let reconnect = shared.config.reconnect;
    loop {
        let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > reconnect.max_attempts {
            debug!(attempts = reconnect.max_attempts, "reconnect attempts exhausted");
            shared.set_state(ClientState::Closed);
            shared.reject_all_pending();
            return;
        }

        tokio::time::sleep(backoff_delay(attempt, &reconnect)).await;
        if shared.user_closing.load(Ordering::SeqCst) {
            shared.set_state(ClientState::Closed);
            return;
        }

        match shared.factory.connect(&shared.config.url).await {
            Ok((transport, events)) => {
                *shared.transport.lock().expect("transport lock") = Some(transport);
                spawn_driver(shared, events);
                return;
            }
            Err(err) => {
                debug!(attempt, %err, "reconnect attempt failed");
                *shared.last_error.lock().expect("last error lock") = Some(err.to_string());
            }
        }
    }
}

async fn wait_abort(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

/// Exponential backoff doubled per attempt, clamped at the max, then
/// scaled uniformly within `1 ± jitter`.
pub(crate) fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exponential = config.base_backoff_ms.saturating_mul(1u64 << shift);
    let capped = exponential.min(config.max_backoff_ms) as f64;

    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((capped * factor).round().max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_clamps_and_jitters_within_bounds() {
        let config = ReconnectConfig {
            enabled: true,
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: 0.5,
        };

        for _ in 0..200 {
            let first = backoff_delay(1, &config).as_millis() as f64;
            assert!((50.0..=150.0).contains(&first), "attempt 1: {first}");

            let third = backoff_delay(3, &config).as_millis() as f64;
            assert!((200.0..=600.0).contains(&third), "attempt 3: {third}");

            // Attempt 8 would be 12800ms unclamped; the cap holds.
            let late = backoff_delay(8, &config).as_millis() as f64;
            assert!((500.0..=1_500.0).contains(&late), "attempt 8: {late}");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let config = ReconnectConfig {
            enabled: true,
            max_attempts: 3,
            base_backoff_ms: 300,
            max_backoff_ms: 10_000,
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(300));
        assert_eq!(backoff_delay(2, &config), Duration::from_millis(600));
        assert_eq!(backoff_delay(3, &config), Duration::from_millis(1_200));
    }
}
