//! Reserved message types and prefixes owned by the framework.

/// Client-to-server heartbeat probe.
pub const HEARTBEAT_TYPE: &str = "__heartbeat";

/// Server-to-client heartbeat acknowledgement.
pub const HEARTBEAT_ACK_TYPE: &str = "__heartbeat_ack";

/// Wire type for fire-and-forget error envelopes.
pub const ERROR_TYPE: &str = "ERROR";

/// Wire type for correlated, one-shot RPC error envelopes.
pub const RPC_ERROR_TYPE: &str = "RPC_ERROR";

/// Wire type for streamed RPC progress frames; always precedes the
/// terminal response on the wire.
pub const RPC_PROGRESS_TYPE: &str = "RPC_PROGRESS";

/// Internal lifecycle event fired when a connection opens. Never
/// delivered to user handlers.
pub const WS_OPEN_EVENT: &str = "$ws:open";

/// Internal lifecycle event fired when a connection closes. Never
/// delivered to user handlers.
pub const WS_CLOSE_EVENT: &str = "$ws:close";

/// Type prefixes user code may not register and user handlers never see.
pub const RESERVED_PREFIXES: [&str; 2] = ["__", "$"];

/// Returns `true` when `message_type` starts with a reserved prefix.
pub fn is_reserved_type(message_type: &str) -> bool {
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| message_type.starts_with(prefix))
}
