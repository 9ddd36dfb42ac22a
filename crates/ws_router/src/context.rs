use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use ws_proto::{
    meta, Envelope, ErrorCode, MessageDescriptor, WsError, ERROR_TYPE, RPC_ERROR_TYPE,
    RPC_PROGRESS_TYPE,
};

use crate::{
    clock::Clock,
    connection::{ClientId, Connection},
    lifecycle::LifecycleManager,
    pubsub::{PubSubCapability, PublishOptions, PublishResult},
    rpc::RpcManager,
    socket::{ServerSocket, SocketError},
    validate::{ValidationHook, Validator},
};

/// Thin engine facade handed to every context.
///
/// Exposes only what contexts need (clock, error sink, RPC state,
/// validator, pub/sub); it never references the router itself, so
/// contexts cannot form reference cycles with the engine.
pub(crate) struct EngineShared {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) lifecycle: Arc<LifecycleManager>,
    pub(crate) rpc: Arc<RpcManager>,
    pub(crate) validator: Option<Arc<dyn Validator>>,
    pub(crate) pubsub: Option<Arc<PubSubCapability>>,
    pub(crate) validate_outgoing: bool,
    pub(crate) on_validation_error: Option<ValidationHook>,
}

pub(crate) struct RpcBinding {
    pub(crate) correlation_id: String,
    pub(crate) response: MessageDescriptor,
}

/// Per-message context handed to middleware and handlers.
///
/// Carries the connection identity, the shared per-connection data
/// record, the (possibly validator-enriched) payload, and the outbound
/// surface: `send` for unicast events, `reply`/`progress` on RPC
/// contexts, `error` for the unified error emitter, and `publish` when
/// pub/sub is installed.
pub struct MessageContext {
    client_id: ClientId,
    message_type: String,
    meta: Map<String, Value>,
    payload: Mutex<Option<Value>>,
    connection: Arc<Connection>,
    engine: Arc<EngineShared>,
    rpc: Option<RpcBinding>,
    extensions: Mutex<HashMap<String, Value>>,
}

impl MessageContext {
    pub(crate) fn new(
        client_id: ClientId,
        envelope: Envelope,
        connection: Arc<Connection>,
        engine: Arc<EngineShared>,
        rpc: Option<RpcBinding>,
    ) -> Self {
        let Envelope {
            kind,
            meta,
            payload,
        } = envelope;
        Self {
            client_id,
            message_type: kind,
            meta,
            payload: Mutex::new(payload),
            connection,
            engine,
            rpc,
            extensions: Mutex::new(HashMap::new()),
        }
    }

    /// Server-assigned connection identity.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Routing key of the inbound message.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The transport handle for this connection.
    pub fn socket(&self) -> Arc<dyn ServerSocket> {
        Arc::clone(&self.connection.socket)
    }

    /// Normalized inbound meta (server-reserved keys already stripped).
    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    /// The message payload. After inbound validation this is the
    /// validator's (possibly coerced) output.
    pub fn payload(&self) -> Option<Value> {
        self.payload.lock().expect("payload lock").clone()
    }

    pub(crate) fn set_payload(&self, payload: Option<Value>) {
        *self.payload.lock().expect("payload lock") = payload;
    }

    /// Correlation id when this message is an RPC request.
    pub fn correlation_id(&self) -> Option<&str> {
        self.rpc.as_ref().map(|binding| binding.correlation_id.as_str())
    }

    pub fn is_rpc(&self) -> bool {
        self.rpc.is_some()
    }

    /// Reads one key of the per-connection data record.
    pub fn data_value(&self, key: &str) -> Option<Value> {
        self.connection.data_value(key)
    }

    /// Sets one key of the per-connection data record.
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.connection.set_data(key, value);
    }

    /// Shallow-merges into the per-connection data record; overlapping
    /// keys take the incoming value.
    pub fn assign_data(&self, partial: Map<String, Value>) {
        self.connection.assign_data(partial);
    }

    /// Opaque per-message plugin storage, keyed by string namespace.
    pub fn extension(&self, namespace: &str) -> Option<Value> {
        self.extensions
            .lock()
            .expect("extensions lock")
            .get(namespace)
            .cloned()
    }

    pub fn set_extension(&self, namespace: impl Into<String>, value: Value) {
        self.extensions
            .lock()
            .expect("extensions lock")
            .insert(namespace.into(), value);
    }

    /// Sends a unicast event on this connection.
    ///
    /// The outbound envelope is timestamped and, when a validator is
    /// installed and outbound validation is on, checked against the
    /// descriptor first; a failed check aborts transmission, surfaces
    /// the failure to the error sink, and returns it.
    pub async fn send(
        &self,
        descriptor: &MessageDescriptor,
        payload: Value,
    ) -> Result<(), WsError> {
        let payload = self.check_outgoing(descriptor, payload).await?;
        let mut envelope = Envelope::new(descriptor.message_type.clone()).with_payload(payload);
        envelope.stamp_timestamp(self.engine.clock.now_millis());
        self.deliver(&envelope)
    }

    /// Sends the terminal RPC response.
    ///
    /// Shares a one-shot flag with `error`: whichever reaches the flag
    /// first wins, and later calls are suppressed without touching the
    /// wire.
    pub async fn reply(&self, payload: Value) -> Result<(), WsError> {
        let binding = self.require_rpc()?;
        let response = binding.response.clone();
        let payload = self.check_outgoing(&response, payload).await?;

        if !self
            .engine
            .rpc
            .on_terminal(&self.client_id, &binding.correlation_id)
        {
            debug!(
                client_id = %self.client_id,
                correlation_id = %binding.correlation_id,
                "terminal already sent; reply suppressed"
            );
            return Ok(());
        }

        let mut envelope = Envelope::new(response.message_type.clone())
            .with_meta(meta::CORRELATION_ID, Value::from(binding.correlation_id.clone()))
            .with_payload(payload);
        envelope.stamp_timestamp(self.engine.clock.now_millis());
        self.deliver(&envelope)
    }

    /// Streams one progress frame for an in-flight RPC.
    ///
    /// Progress after the terminal frame (or after cancellation) is
    /// suppressed. Progress payloads are intentionally not validated:
    /// they may be partial shapes of the response.
    pub async fn progress(&self, payload: Value) -> Result<(), WsError> {
        let binding = self.require_rpc()?;

        if !self
            .engine
            .rpc
            .on_progress(&self.client_id, &binding.correlation_id)
        {
            debug!(
                client_id = %self.client_id,
                correlation_id = %binding.correlation_id,
                "rpc no longer active; progress suppressed"
            );
            return Ok(());
        }

        let mut envelope = Envelope::new(RPC_PROGRESS_TYPE)
            .with_meta(meta::CORRELATION_ID, Value::from(binding.correlation_id.clone()))
            .with_payload(payload);
        envelope.stamp_timestamp(self.engine.clock.now_millis());
        self.deliver(&envelope)
    }

    /// Unified error emitter; fire-and-forget.
    ///
    /// On an RPC context the wire type is `RPC_ERROR` and the one-shot
    /// flag is shared with `reply`; otherwise the type is `ERROR` and
    /// repeated calls are permitted. The client-safe payload derives
    /// from the code table; the cause chain never leaves the process.
    /// After dispatch the structured error fans out to the lifecycle
    /// sink.
    pub fn error(&self, error: WsError) {
        self.error_with_meta(error, Map::new());
    }

    /// Like [`MessageContext::error`], with extra envelope meta.
    /// Reserved keys (`type`, `correlationId`) in the caller meta are
    /// stripped.
    pub fn error_with_meta(&self, error: WsError, extra_meta: Map<String, Value>) {
        let mut error = error;
        let wire_type = match &self.rpc {
            Some(binding) => {
                error.correlation_id = Some(binding.correlation_id.clone());
                if !self
                    .engine
                    .rpc
                    .on_terminal(&self.client_id, &binding.correlation_id)
                {
                    debug!(
                        client_id = %self.client_id,
                        correlation_id = %binding.correlation_id,
                        "terminal already sent; error suppressed"
                    );
                    return;
                }
                RPC_ERROR_TYPE
            }
            None => ERROR_TYPE,
        };

        self.emit_error_unchecked(wire_type, error, extra_meta);
    }

    /// Emits an error envelope without consulting the RPC one-shot.
    ///
    /// Used by the engine for failures that precede request admission
    /// (so no one-shot state exists yet).
    pub(crate) fn emit_error_unchecked(
        &self,
        wire_type: &str,
        error: WsError,
        mut extra_meta: Map<String, Value>,
    ) {
        extra_meta.remove("type");
        extra_meta.remove(meta::CORRELATION_ID);

        let mut envelope = Envelope::new(wire_type);
        envelope.meta = extra_meta;
        if let Some(correlation_id) = &error.correlation_id {
            envelope.meta.insert(
                meta::CORRELATION_ID.to_string(),
                Value::from(correlation_id.clone()),
            );
        }

        match serde_json::to_value(error.to_body()) {
            Ok(body) => envelope.payload = Some(body),
            Err(primary) => {
                let bare = ws_proto::ErrorBody::bare(error.code.clone(), error.message.clone());
                match serde_json::to_value(bare) {
                    Ok(body) => envelope.payload = Some(body),
                    Err(fallback) => {
                        warn!(
                            %primary,
                            %fallback,
                            "failed to serialize error payload; dropping envelope"
                        );
                        self.engine.lifecycle.handle_error(&error, Some(self));
                        return;
                    }
                }
            }
        }

        if let Err(send_error) = self.deliver(&envelope) {
            debug!(%send_error, "error envelope not delivered");
        }
        self.engine.lifecycle.handle_error(&error, Some(self));
    }

    /// Broadcasts to a topic's subscribers. Returns a result object and
    /// never fails the calling handler.
    pub async fn publish(
        &self,
        topic: &str,
        descriptor: &MessageDescriptor,
        payload: Value,
        options: PublishOptions,
    ) -> PublishResult {
        match &self.engine.pubsub {
            Some(pubsub) => {
                pubsub
                    .publish_from(topic, descriptor, payload, options, Some(&self.connection))
                    .await
            }
            None => PublishResult::not_installed(),
        }
    }

    /// Topic membership operations for this connection.
    pub fn topics(&self) -> TopicsView<'_> {
        TopicsView { ctx: self }
    }

    /// Subscribes to cancellation of this RPC (peer abort, disconnect,
    /// or idle sweep), for releasing held resources. Returns `None` on
    /// non-RPC contexts.
    pub fn on_cancel(
        &self,
        callback: crate::rpc::CancelCallback,
    ) -> Option<crate::rpc::CancelRegistration> {
        let binding = self.rpc.as_ref()?;
        Some(
            self.engine
                .rpc
                .on_cancel(&self.client_id, &binding.correlation_id, callback),
        )
    }

    fn require_rpc(&self) -> Result<&RpcBinding, WsError> {
        self.rpc.as_ref().ok_or_else(|| {
            WsError::with_message(
                ErrorCode::FailedPrecondition,
                format!("`{}` is not an rpc message", self.message_type),
            )
        })
    }

    async fn check_outgoing(
        &self,
        descriptor: &MessageDescriptor,
        payload: Value,
    ) -> Result<Value, WsError> {
        let Some(validator) = &self.engine.validator else {
            return Ok(payload);
        };
        if !self.engine.validate_outgoing {
            return Ok(payload);
        }

        match validator.validate(descriptor, &payload).await {
            Ok(validated) => Ok(validated),
            Err(issues) => {
                let error = WsError::with_message(
                    ErrorCode::InvalidArgument,
                    format!(
                        "outgoing `{}` payload failed validation",
                        descriptor.message_type
                    ),
                )
                .with_details(issues.to_details());
                self.engine.lifecycle.handle_error(&error, Some(self));
                Err(error)
            }
        }
    }

    fn deliver(&self, envelope: &Envelope) -> Result<(), WsError> {
        let frame = envelope
            .encode()
            .map_err(|err| WsError::with_message(ErrorCode::Internal, err.to_string()))?;
        match self.connection.socket.send(&frame) {
            Ok(()) => Ok(()),
            // Late sends against a closed socket are harmless no-ops.
            Err(SocketError::NotOpen) => {
                debug!(client_id = %self.client_id, "send skipped: socket not open");
                Ok(())
            }
            Err(SocketError::Transport(message)) => {
                Err(WsError::with_message(ErrorCode::Unavailable, message))
            }
        }
    }
}

/// Topic operations bound to one connection.
pub struct TopicsView<'a> {
    ctx: &'a MessageContext,
}

impl TopicsView<'_> {
    pub async fn subscribe(&self, topic: &str) -> Result<(), crate::pubsub::SubscribeError> {
        let pubsub = self.require_pubsub()?;
        pubsub.subscribe(self.ctx.client_id(), topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), crate::pubsub::SubscribeError> {
        let pubsub = self.require_pubsub()?;
        pubsub.unsubscribe(self.ctx.client_id(), topic).await
    }

    pub async fn list(&self) -> Vec<String> {
        match &self.ctx.engine.pubsub {
            Some(pubsub) => pubsub.topics_of(self.ctx.client_id()).await,
            None => Vec::new(),
        }
    }

    pub async fn has(&self, topic: &str) -> bool {
        match &self.ctx.engine.pubsub {
            Some(pubsub) => pubsub.is_subscribed(self.ctx.client_id(), topic).await,
            None => false,
        }
    }

    fn require_pubsub(&self) -> Result<&Arc<PubSubCapability>, crate::pubsub::SubscribeError> {
        self.ctx
            .engine
            .pubsub
            .as_ref()
            .ok_or(crate::pubsub::SubscribeError::AdapterError(
                "pub/sub capability not installed".to_string(),
            ))
    }
}
