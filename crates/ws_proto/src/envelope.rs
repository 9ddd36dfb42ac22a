use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Well-known meta keys recognized on the wire.
pub mod meta {
    /// Links a request to its response and progress frames. Required on
    /// RPC pairs.
    pub const CORRELATION_ID: &str = "correlationId";
    /// Send time in integer milliseconds, auto-stamped on publish.
    pub const TIMESTAMP: &str = "timestamp";
    /// Per-call RPC deadline override in milliseconds.
    pub const TIMEOUT_MS: &str = "timeoutMs";
    /// Server-authoritative connection identity. Reserved: inbound
    /// claims are stripped.
    pub const CLIENT_ID: &str = "clientId";
    /// Server-stamped receive time. Reserved: inbound claims are
    /// stripped.
    pub const RECEIVED_AT: &str = "receivedAt";

    /// Meta keys the server controls; any inbound value is discarded
    /// before the message reaches validation or handlers.
    pub const SERVER_RESERVED: [&str; 2] = [CLIENT_ID, RECEIVED_AT];
}

/// Errors produced while decoding an inbound frame into an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame exceeds byte cap (observed_bytes={observed_bytes}, max_bytes={max_bytes})")]
    Oversize {
        observed_bytes: usize,
        max_bytes: usize,
    },
    #[error("frame is not a valid message envelope: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("message type must be a non-empty string")]
    EmptyType,
}

/// The JSON frame exchanged on the wire: `{type, meta, payload?}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Routing key for the message.
    #[serde(rename = "type")]
    pub kind: String,
    /// Open string-keyed metadata. See [`meta`] for recognized keys.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    /// Message body, shaped per message type. Absent when the type
    /// carries no payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Creates an envelope with empty meta and no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            meta: Map::new(),
            payload: None,
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets a meta entry, replacing any existing value.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Decodes one inbound frame, enforcing an optional byte cap before
    /// the JSON parser runs.
    ///
    /// A frame exactly at the cap is accepted; one byte over is
    /// rejected. The returned envelope has already had server-reserved
    /// meta keys stripped.
    pub fn decode(raw: &str, max_bytes: Option<usize>) -> Result<Self, EnvelopeError> {
        if let Some(max) = max_bytes {
            let observed = raw.len();
            if observed > max {
                return Err(EnvelopeError::Oversize {
                    observed_bytes: observed,
                    max_bytes: max,
                });
            }
        }

        let mut envelope: Envelope = serde_json::from_str(raw)?;
        if envelope.kind.is_empty() {
            return Err(EnvelopeError::EmptyType);
        }
        envelope.strip_server_reserved();
        Ok(envelope)
    }

    /// Serializes the envelope to its wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Removes meta keys only the server may set.
    pub fn strip_server_reserved(&mut self) {
        for key in meta::SERVER_RESERVED {
            self.meta.remove(key);
        }
    }

    /// The correlation id, when present and a string.
    pub fn correlation_id(&self) -> Option<&str> {
        self.meta.get(meta::CORRELATION_ID).and_then(Value::as_str)
    }

    /// The per-call timeout override, when present.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.meta.get(meta::TIMEOUT_MS).and_then(Value::as_u64)
    }

    /// Stamps `meta.timestamp` unless the caller already set one.
    pub fn stamp_timestamp(&mut self, now_millis: u64) {
        self.meta
            .entry(meta::TIMESTAMP.to_string())
            .or_insert_with(|| Value::from(now_millis));
    }
}
