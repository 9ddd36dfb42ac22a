#![forbid(unsafe_code)]
//! Transport-agnostic WebSocket message-routing engine.
//!
//! The engine turns one inbound frame into an invocation of a
//! registered handler: parse, guard, route lookup, per-message context,
//! backpressure, middleware, handler, with every failure funneled to a
//! single observable error sink. Around that pipeline it manages the
//! RPC request lifecycle (one-shot terminal replies, streamed progress,
//! cancellation, idle reaping), topic pub/sub with authorized
//! broadcast, token-bucket rate limiting, and heartbeat/activity
//! tracking.
//!
//! Platform WebSockets stay behind the [`ServerSocket`] trait; schema
//! libraries behind [`Validator`]; brokers behind [`PubSubBroker`]. The
//! engine owns none of them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use ws_proto::MessageDescriptor;
//! use ws_router::{handler_fn, RouteEntry, RouteTable, Router};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut routes = RouteTable::new();
//! routes.register(RouteEntry::new(
//!     MessageDescriptor::event("ECHO"),
//!     handler_fn(|ctx| async move {
//!         let text = ctx.payload().unwrap_or_default();
//!         ctx.send(&MessageDescriptor::event("ECHO_OK"), json!({ "text": text }))
//!             .await
//!     }),
//! ))?;
//!
//! let router = Router::builder().routes(routes).build();
//! // Adapter wiring: router.handle_open(ws).await, then
//! // router.handle_message(&client_id, frame).await per frame.
//! # Ok(()) }
//! ```

mod clock;
mod config;
mod connection;
mod context;
mod lifecycle;
mod limits;
mod middleware;
mod pubsub;
mod ratelimit;
mod router;
mod routes;
mod rpc;
mod socket;
pub mod testing;
mod validate;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, HeartbeatConfig, RouterConfig};
pub use connection::ClientId;
pub use context::{MessageContext, TopicsView};
pub use lifecycle::{CloseHandler, ErrorHandler, LifecycleManager, OpenHandler};
pub use limits::LimitsConfig;
pub use middleware::{handler_fn, middleware_fn, BoxFuture, MessageHandler, Middleware, Next};
pub use pubsub::{
    MemoryBroker, PubSubBroker, PublishError, PublishOptions, PublishResult, SubscribeAcl,
    SubscribeError,
};
pub use ratelimit::{
    rate_limit_middleware, RateLimitDecision, RateLimitPolicy, RateLimiter, TokenBucketLimiter,
};
pub use router::{Router, RouterBuilder};
pub use routes::{ConflictPolicy, RegistryError, RouteEntry, RouteTable};
pub use rpc::{CancelCallback, CancelRegistration, RpcConfig, RpcManager};
pub use socket::{ReadyState, ServerSocket, SocketError};
pub use validate::{
    AcceptAllValidator, ValidationHook, ValidationIssue, ValidationIssues, Validator,
};

#[cfg(test)]
mod tests;
