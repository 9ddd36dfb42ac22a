use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use ws_proto::{is_reserved_type, meta, Envelope, MessageDescriptor};

use crate::{
    clock::Clock,
    connection::{ClientId, Connection, ConnectionRegistry},
    socket::{ReadyState, ServerSocket},
    validate::{ValidationIssues, Validator},
};

/// Failures surfaced by topic membership operations.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("subscription to `{0}` denied")]
    AclSubscribe(String),
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("topic limit exceeded ({0} topics)")]
    TopicLimitExceeded(usize),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("broker failure: {0}")]
    AdapterError(String),
}

/// Failure carried inside a [`PublishResult`].
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("outgoing payload failed validation")]
    ValidationFailed(ValidationIssues),
    #[error("broker failure: {0}")]
    AdapterError(String),
    #[error("pub/sub capability not installed")]
    NotInstalled,
}

/// Outcome of a publish. Publishing never throws; failures ride here.
#[derive(Debug)]
pub struct PublishResult {
    pub ok: bool,
    /// Subscribers the adapter reached, when it can report the count.
    pub matched: Option<usize>,
    pub error: Option<PublishError>,
}

impl PublishResult {
    fn delivered(matched: Option<usize>) -> Self {
        Self {
            ok: true,
            matched,
            error: None,
        }
    }

    fn failed(error: PublishError) -> Self {
        Self {
            ok: false,
            matched: None,
            error: Some(error),
        }
    }

    pub(crate) fn not_installed() -> Self {
        Self::failed(PublishError::NotInstalled)
    }
}

/// Broadcast options.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Connection-data key whose value identifies the sender. The
    /// engine never stamps `clientId` on its own; the host opts in by
    /// naming a data key here.
    pub origin: Option<String>,
    /// Meta key the origin value is injected under; defaults to the
    /// origin data key's own name.
    pub key: Option<String>,
    /// Connection to exclude from delivery (typically the sender).
    pub exclude_client: Option<ClientId>,
    /// Extra meta entries for the broadcast envelope.
    pub meta: Map<String, Value>,
    /// Explicit timestamp; when absent the clock stamps one.
    pub timestamp: Option<u64>,
}

/// Broker seam: in-memory or distributed fan-out.
///
/// Membership is set-semantics: double subscribe and absent unsubscribe
/// are no-ops. `attach`/`detach` bind a connection's outbound sender to
/// the broker for delivery; `detach` also drops its memberships.
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    async fn attach(&self, client_id: &str, socket: Arc<dyn ServerSocket>);
    async fn detach(&self, client_id: &str);
    async fn subscribe(&self, client_id: &str, topic: &str) -> Result<(), SubscribeError>;
    async fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<(), SubscribeError>;
    /// Delivers one encoded frame to the topic's subscribers, minus the
    /// excluded connection. Returns the matched count when reportable.
    async fn publish(
        &self,
        topic: &str,
        frame: &str,
        exclude: Option<&str>,
    ) -> Result<Option<usize>, String>;
    async fn topics_of(&self, client_id: &str) -> Vec<String>;
    async fn is_subscribed(&self, client_id: &str, topic: &str) -> bool;
}

#[derive(Default)]
struct MemoryBrokerState {
    topics: BTreeMap<String, BTreeSet<ClientId>>,
    senders: HashMap<ClientId, Arc<dyn ServerSocket>>,
}

/// Single-process broker delivering directly to attached sockets.
#[derive(Default)]
pub struct MemoryBroker {
    /// Per-connection topic cap; `None` is unlimited.
    max_topics_per_client: Option<usize>,
    state: Mutex<MemoryBrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic_limit(max_topics_per_client: usize) -> Self {
        Self {
            max_topics_per_client: Some(max_topics_per_client),
            state: Mutex::new(MemoryBrokerState::default()),
        }
    }
}

#[async_trait]
impl PubSubBroker for MemoryBroker {
    async fn attach(&self, client_id: &str, socket: Arc<dyn ServerSocket>) {
        self.state
            .lock()
            .expect("broker lock")
            .senders
            .insert(client_id.to_string(), socket);
    }

    async fn detach(&self, client_id: &str) {
        let mut state = self.state.lock().expect("broker lock");
        state.senders.remove(client_id);
        for members in state.topics.values_mut() {
            members.remove(client_id);
        }
        state.topics.retain(|_, members| !members.is_empty());
    }

    async fn subscribe(&self, client_id: &str, topic: &str) -> Result<(), SubscribeError> {
        let mut state = self.state.lock().expect("broker lock");

        if let Some(cap) = self.max_topics_per_client {
            let current = state
                .topics
                .values()
                .filter(|members| members.contains(client_id))
                .count();
            let already_member = state
                .topics
                .get(topic)
                .is_some_and(|members| members.contains(client_id));
            if !already_member && current >= cap {
                return Err(SubscribeError::TopicLimitExceeded(cap));
            }
        }

        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<(), SubscribeError> {
        let mut state = self.state.lock().expect("broker lock");
        if let Some(members) = state.topics.get_mut(topic) {
            members.remove(client_id);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        frame: &str,
        exclude: Option<&str>,
    ) -> Result<Option<usize>, String> {
        let targets: Vec<Arc<dyn ServerSocket>> = {
            let state = self.state.lock().expect("broker lock");
            let Some(members) = state.topics.get(topic) else {
                return Ok(Some(0));
            };
            members
                .iter()
                .filter(|member| exclude != Some(member.as_str()))
                .filter_map(|member| state.senders.get(member).cloned())
                .collect()
        };

        let mut matched = 0;
        for socket in targets {
            if socket.send(frame).is_ok() {
                matched += 1;
            }
        }
        Ok(Some(matched))
    }

    async fn topics_of(&self, client_id: &str) -> Vec<String> {
        let state = self.state.lock().expect("broker lock");
        state
            .topics
            .iter()
            .filter(|(_, members)| members.contains(client_id))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    async fn is_subscribed(&self, client_id: &str, topic: &str) -> bool {
        let state = self.state.lock().expect("broker lock");
        state
            .topics
            .get(topic)
            .is_some_and(|members| members.contains(client_id))
    }
}

/// Hook deciding whether a connection may subscribe to a topic.
pub type SubscribeAcl = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Topic subscribe/unsubscribe and authorized broadcast.
pub(crate) struct PubSubCapability {
    broker: Arc<dyn PubSubBroker>,
    authorize: Option<SubscribeAcl>,
    connections: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    validator: Option<Arc<dyn Validator>>,
    validate_outgoing: bool,
}

impl PubSubCapability {
    pub(crate) fn new(
        broker: Arc<dyn PubSubBroker>,
        authorize: Option<SubscribeAcl>,
        connections: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        validator: Option<Arc<dyn Validator>>,
        validate_outgoing: bool,
    ) -> Self {
        Self {
            broker,
            authorize,
            connections,
            clock,
            validator,
            validate_outgoing,
        }
    }

    pub(crate) fn broker(&self) -> &Arc<dyn PubSubBroker> {
        &self.broker
    }

    pub(crate) async fn subscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<(), SubscribeError> {
        if !valid_topic(topic) {
            return Err(SubscribeError::InvalidTopic(topic.to_string()));
        }

        let open = self
            .connections
            .get(client_id)
            .map(|connection| connection.socket.ready_state() == ReadyState::Open)
            .unwrap_or(false);
        if !open {
            return Err(SubscribeError::ConnectionClosed);
        }

        if let Some(authorize) = &self.authorize {
            if !authorize(client_id, topic) {
                return Err(SubscribeError::AclSubscribe(topic.to_string()));
            }
        }

        self.broker.subscribe(client_id, topic).await
    }

    pub(crate) async fn unsubscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<(), SubscribeError> {
        if !valid_topic(topic) {
            return Err(SubscribeError::InvalidTopic(topic.to_string()));
        }
        self.broker.unsubscribe(client_id, topic).await
    }

    pub(crate) async fn topics_of(&self, client_id: &str) -> Vec<String> {
        self.broker.topics_of(client_id).await
    }

    pub(crate) async fn is_subscribed(&self, client_id: &str, topic: &str) -> bool {
        self.broker.is_subscribed(client_id, topic).await
    }

    /// Builds, stamps, optionally validates, and hands the broadcast
    /// envelope to the broker.
    pub(crate) async fn publish_from(
        &self,
        topic: &str,
        descriptor: &MessageDescriptor,
        payload: Value,
        options: PublishOptions,
        origin_connection: Option<&Arc<Connection>>,
    ) -> PublishResult {
        if !valid_topic(topic) {
            return PublishResult::failed(PublishError::InvalidTopic(topic.to_string()));
        }

        let payload = if self.validate_outgoing {
            match &self.validator {
                Some(validator) => match validator.validate(descriptor, &payload).await {
                    Ok(validated) => validated,
                    Err(issues) => {
                        debug!(topic, "publish aborted: payload failed validation");
                        return PublishResult::failed(PublishError::ValidationFailed(issues));
                    }
                },
                None => payload,
            }
        } else {
            payload
        };

        let mut envelope =
            Envelope::new(descriptor.message_type.clone()).with_payload(payload);
        envelope.meta = options.meta;
        // Broadcasts never carry a correlation id, and identity meta is
        // opt-in via `origin`.
        envelope.meta.remove(meta::CORRELATION_ID);
        envelope.strip_server_reserved();

        if let (Some(origin_key), Some(connection)) = (&options.origin, origin_connection) {
            if let Some(identity) = connection.data_value(origin_key) {
                let meta_key = options.key.clone().unwrap_or_else(|| origin_key.clone());
                envelope.meta.insert(meta_key, identity);
            }
        }

        let timestamp = options.timestamp.unwrap_or_else(|| self.clock.now_millis());
        envelope.stamp_timestamp(timestamp);

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                return PublishResult::failed(PublishError::AdapterError(err.to_string()));
            }
        };

        match self
            .broker
            .publish(topic, &frame, options.exclude_client.as_deref())
            .await
        {
            Ok(matched) => PublishResult::delivered(matched),
            Err(detail) => PublishResult::failed(PublishError::AdapterError(detail)),
        }
    }
}

fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !is_reserved_type(topic)
}
