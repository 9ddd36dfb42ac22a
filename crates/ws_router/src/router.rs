use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use ws_proto::{
    is_reserved_type, Envelope, ErrorCode, MessageDescriptor, MessageKind, WsError,
    HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE, RPC_ERROR_TYPE,
};

use crate::{
    clock::{Clock, SystemClock},
    config::RouterConfig,
    connection::{ClientId, Connection, ConnectionRegistry},
    context::{EngineShared, MessageContext, RpcBinding},
    lifecycle::{CloseHandler, ErrorHandler, LifecycleManager, OpenHandler},
    limits::LimitsManager,
    middleware::{run_pipeline, BoxFuture, MessageHandler, Middleware},
    pubsub::{PubSubBroker, PubSubCapability, PublishOptions, PublishResult, SubscribeAcl},
    routes::RouteTable,
    rpc::RpcManager,
    socket::ServerSocket,
    validate::{ValidationHook, Validator},
};

/// Builder for a [`Router`].
///
/// Configure routes, capabilities, and hooks here, before the first
/// connection is accepted; the route table is frozen at `build`.
pub struct RouterBuilder {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    routes: RouteTable,
    global_middlewares: Vec<Arc<dyn Middleware>>,
    validator: Option<Arc<dyn Validator>>,
    broker: Option<Arc<dyn PubSubBroker>>,
    subscribe_acl: Option<SubscribeAcl>,
    on_validation_error: Option<ValidationHook>,
}

impl RouterBuilder {
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the time source; tests install a manual clock here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Installs the route table.
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Appends one global middleware; global middleware runs before
    /// per-route middleware, in registration order.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.global_middlewares.push(middleware);
        self
    }

    /// Installs a schema validator, enabling inbound payload validation
    /// and (per config) outbound validation.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Observes inbound validation failures.
    pub fn on_validation_error(mut self, hook: ValidationHook) -> Self {
        self.on_validation_error = Some(hook);
        self
    }

    /// Installs the pub/sub capability backed by the given broker.
    pub fn pubsub(mut self, broker: Arc<dyn PubSubBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Gates topic subscriptions; `false` surfaces an ACL failure to
    /// the subscriber.
    pub fn subscribe_acl(mut self, acl: SubscribeAcl) -> Self {
        self.subscribe_acl = Some(acl);
        self
    }

    pub fn build(self) -> Router {
        let clock = self.clock;
        let connections = Arc::new(ConnectionRegistry::default());
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&clock)));
        let limits = Arc::new(LimitsManager::new(self.config.limits));
        let rpc = RpcManager::new(self.config.rpc, Arc::clone(&clock));

        let pubsub = self.broker.map(|broker| {
            Arc::new(PubSubCapability::new(
                broker,
                self.subscribe_acl,
                Arc::clone(&connections),
                Arc::clone(&clock),
                self.validator.clone(),
                self.config.validate_outgoing,
            ))
        });

        let engine = Arc::new(EngineShared {
            clock,
            lifecycle: Arc::clone(&lifecycle),
            rpc: Arc::clone(&rpc),
            validator: self.validator,
            pubsub,
            validate_outgoing: self.config.validate_outgoing,
            on_validation_error: self.on_validation_error,
        });

        Router {
            config: self.config,
            routes: Arc::new(self.routes),
            global_middlewares: self.global_middlewares.into(),
            connections,
            limits,
            lifecycle,
            rpc,
            engine,
        }
    }
}

/// The server-side message engine.
///
/// Adapters feed it through three entry points: [`Router::handle_open`]
/// when a connection is accepted, [`Router::handle_message`] per inbound
/// frame, and [`Router::handle_close`] when the socket goes away.
/// Dispatch never propagates failures to the adapter; every error is
/// routed to the lifecycle sink, and a malformed frame never closes the
/// socket.
pub struct Router {
    config: RouterConfig,
    routes: Arc<RouteTable>,
    global_middlewares: Arc<[Arc<dyn Middleware>]>,
    connections: Arc<ConnectionRegistry>,
    limits: Arc<LimitsManager>,
    lifecycle: Arc<LifecycleManager>,
    rpc: Arc<RpcManager>,
    engine: Arc<EngineShared>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            config: RouterConfig::default(),
            clock: Arc::new(SystemClock),
            routes: RouteTable::new(),
            global_middlewares: Vec::new(),
            validator: None,
            broker: None,
            subscribe_acl: None,
            on_validation_error: None,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Arms background work (the RPC idle sweep). Requires a running
    /// tokio runtime.
    pub fn start(&self) {
        self.rpc.start();
    }

    pub fn stop(&self) {
        self.rpc.stop();
    }

    /// Registers an error-sink observer.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.lifecycle.on_error(handler);
    }

    /// Registers a router-level open hook; capability hooks run first.
    pub fn on_open(&self, handler: OpenHandler) {
        self.lifecycle.on_open(handler);
    }

    /// Registers a router-level close hook; capability hooks run first.
    pub fn on_close(&self, handler: CloseHandler) {
        self.lifecycle.on_close(handler);
    }

    /// Last-activity timestamp for a connection, for external staleness
    /// monitors.
    pub fn last_activity(&self, client_id: &str) -> Option<u64> {
        self.lifecycle.last_activity(client_id)
    }

    /// The RPC lifecycle manager.
    pub fn rpc(&self) -> &Arc<RpcManager> {
        &self.rpc
    }

    /// Accepts one connection: assigns its client id, registers its
    /// state, stamps activity, and runs open hooks. The returned id is
    /// what the adapter passes to `handle_message` / `handle_close`.
    pub async fn handle_open(&self, socket: Arc<dyn ServerSocket>) -> ClientId {
        let client_id = Uuid::new_v4().to_string();
        let connection = Arc::new(Connection::new(Arc::clone(&socket)));
        self.connections.insert(client_id.clone(), connection);

        if let Some(pubsub) = &self.engine.pubsub {
            pubsub.broker().attach(&client_id, socket).await;
        }

        self.lifecycle.mark_activity(&client_id);
        self.lifecycle.run_open(&client_id);
        debug!(client_id, "connection open");
        client_id
    }

    /// Tears down one connection: cancels its live RPCs, drops its
    /// pub/sub memberships and data record, runs close hooks.
    pub async fn handle_close(&self, client_id: &str, code: Option<u16>, reason: Option<&str>) {
        self.rpc.on_disconnect(client_id);

        if let Some(pubsub) = &self.engine.pubsub {
            pubsub.broker().detach(client_id).await;
        }

        self.connections.remove(client_id);
        self.lifecycle.run_close(client_id, code, reason);
        self.lifecycle.drop_connection(client_id);
        debug!(client_id, code, "connection closed");
    }

    /// Dispatches one inbound frame.
    ///
    /// Parse, guard, route, context, limits, middleware, handler; any
    /// failure funnels to the lifecycle sink (with context once one
    /// exists) and the call returns normally.
    pub async fn handle_message(&self, client_id: &str, raw: &[u8]) {
        let Some(connection) = self.connections.get(client_id) else {
            self.lifecycle.handle_error(
                &WsError::with_message(
                    ErrorCode::FailedPrecondition,
                    format!("message for unknown connection `{client_id}`"),
                ),
                None,
            );
            return;
        };

        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(_) => {
                self.lifecycle.handle_error(
                    &WsError::with_message(ErrorCode::InvalidArgument, "frame is not valid UTF-8"),
                    None,
                );
                return;
            }
        };

        let envelope = match Envelope::decode(text, self.limits.max_payload_bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.lifecycle.handle_error(
                    &WsError::with_message(ErrorCode::InvalidArgument, err.to_string()),
                    None,
                );
                return;
            }
        };

        if envelope.kind == HEARTBEAT_TYPE {
            self.lifecycle.mark_activity(client_id);
            if let Ok(frame) = Envelope::new(HEARTBEAT_ACK_TYPE).encode() {
                if let Err(err) = connection.socket.send(&frame) {
                    debug!(client_id, %err, "heartbeat ack not delivered");
                }
            }
            return;
        }

        if is_reserved_type(&envelope.kind) {
            self.lifecycle.handle_error(
                &WsError::with_message(
                    ErrorCode::InvalidArgument,
                    format!("`{}` is a reserved message type", envelope.kind),
                ),
                None,
            );
            return;
        }

        let Some(route) = self.routes.get(&envelope.kind) else {
            self.lifecycle.handle_error(
                &WsError::with_message(
                    ErrorCode::NotFound,
                    format!("no handler for type `{}`", envelope.kind),
                ),
                None,
            );
            return;
        };
        let route = route.clone();

        // RPC requests need a correlation id and an admission slot
        // before a correlated context exists.
        let rpc_binding = match route.schema.kind {
            MessageKind::Event => None,
            MessageKind::Rpc => {
                let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
                    let ctx = self.build_context(client_id, envelope, connection, None);
                    ctx.error(WsError::with_message(
                        ErrorCode::InvalidArgument,
                        format!("rpc `{}` requires meta.correlationId", ctx.message_type()),
                    ));
                    return;
                };

                let response = route
                    .schema
                    .response
                    .as_deref()
                    .cloned()
                    .unwrap_or_else(|| MessageDescriptor::event(envelope.kind.clone()));

                if let Err(err) = self.rpc.on_request(client_id, &correlation_id) {
                    let ctx = self.build_context(client_id, envelope, connection, None);
                    ctx.emit_error_unchecked(
                        RPC_ERROR_TYPE,
                        err.with_correlation_id(correlation_id),
                        serde_json::Map::new(),
                    );
                    return;
                }

                Some(RpcBinding {
                    correlation_id,
                    response,
                })
            }
        };

        let ctx = self.build_context(client_id, envelope, connection, rpc_binding);

        let _slot = match LimitsManager::begin(&self.limits) {
            Ok(slot) => slot,
            Err(err) => {
                ctx.error(err);
                return;
            }
        };

        self.lifecycle.mark_activity(client_id);

        let mut stages: Vec<Arc<dyn Middleware>> = Vec::with_capacity(
            self.global_middlewares.len() + route.middlewares.len(),
        );
        stages.extend(self.global_middlewares.iter().cloned());
        stages.extend(route.middlewares.iter().cloned());

        let terminal: Arc<dyn MessageHandler> = Arc::new(ValidatingTerminal {
            schema: route.schema.clone(),
            handler: Arc::clone(&route.handler),
            engine: Arc::clone(&self.engine),
        });

        if let Err(err) = run_pipeline(stages.into(), terminal, Arc::clone(&ctx)).await {
            self.lifecycle.handle_error(&err, Some(&ctx));
        }
        // The admission slot drops here, releasing the in-flight count
        // exactly once.
    }

    /// Broadcasts to a topic.
    ///
    /// `from_client` names the connection whose data record supplies the
    /// origin stamp (see [`PublishOptions::origin`]); pass `None` for
    /// server-originated broadcasts.
    pub async fn publish(
        &self,
        from_client: Option<&str>,
        topic: &str,
        descriptor: &MessageDescriptor,
        payload: Value,
        options: PublishOptions,
    ) -> PublishResult {
        let Some(pubsub) = &self.engine.pubsub else {
            return PublishResult::not_installed();
        };
        let origin_connection = from_client.and_then(|client_id| self.connections.get(client_id));
        pubsub
            .publish_from(topic, descriptor, payload, options, origin_connection.as_ref())
            .await
    }

    /// Subscribes a connection to a topic. Idempotent on membership.
    pub async fn subscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<(), crate::pubsub::SubscribeError> {
        match &self.engine.pubsub {
            Some(pubsub) => pubsub.subscribe(client_id, topic).await,
            None => Err(crate::pubsub::SubscribeError::AdapterError(
                "pub/sub capability not installed".to_string(),
            )),
        }
    }

    /// Removes a topic membership; a no-op when absent.
    pub async fn unsubscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<(), crate::pubsub::SubscribeError> {
        match &self.engine.pubsub {
            Some(pubsub) => pubsub.unsubscribe(client_id, topic).await,
            None => Err(crate::pubsub::SubscribeError::AdapterError(
                "pub/sub capability not installed".to_string(),
            )),
        }
    }

    /// Topics a connection is subscribed to.
    pub async fn topics_of(&self, client_id: &str) -> Vec<String> {
        match &self.engine.pubsub {
            Some(pubsub) => pubsub.topics_of(client_id).await,
            None => Vec::new(),
        }
    }

    fn build_context(
        &self,
        client_id: &str,
        envelope: Envelope,
        connection: Arc<Connection>,
        rpc: Option<RpcBinding>,
    ) -> Arc<MessageContext> {
        Arc::new(MessageContext::new(
            client_id.to_string(),
            envelope,
            connection,
            Arc::clone(&self.engine),
            rpc,
        ))
    }
}

/// Innermost pipeline stage: inbound validation, then the handler.
struct ValidatingTerminal {
    schema: MessageDescriptor,
    handler: Arc<dyn MessageHandler>,
    engine: Arc<EngineShared>,
}

impl MessageHandler for ValidatingTerminal {
    fn call(&self, ctx: Arc<MessageContext>) -> BoxFuture<Result<(), WsError>> {
        let schema = self.schema.clone();
        let handler = Arc::clone(&self.handler);
        let engine = Arc::clone(&self.engine);

        Box::pin(async move {
            if let Some(validator) = &engine.validator {
                let payload = ctx.payload().unwrap_or(Value::Null);
                match validator.validate(&schema, &payload).await {
                    Ok(validated) => ctx.set_payload(Some(validated)),
                    Err(issues) => {
                        if let Some(hook) = &engine.on_validation_error {
                            hook(&ctx, &issues);
                        }
                        warn!(
                            message_type = %ctx.message_type(),
                            issue_count = issues.0.len(),
                            "inbound payload failed validation"
                        );
                        ctx.error(
                            WsError::with_message(
                                ErrorCode::InvalidArgument,
                                format!("`{}` payload failed validation", ctx.message_type()),
                            )
                            .with_details(issues.to_details()),
                        );
                        return Ok(());
                    }
                }
            }

            handler.call(ctx).await
        })
    }
}
