#![forbid(unsafe_code)]
//! Caller-side state machine for the socket router.
//!
//! [`WsClient`] owns the connection lifecycle (`Idle → Connecting →
//! Open → Closing → Closed`, with reconnect re-entering `Connecting`),
//! a bounded send queue flushed FIFO on open, and the pending-request
//! map that pairs responses to requests by correlation id with
//! deadlines and abort support. Transports are injected through
//! [`ClientTransportFactory`]; [`testing::FakeTransportFactory`]
//! provides the in-process double used by the test suite.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use ws_client::{testing::FakeTransportFactory, RequestOptions, WsClient};
//! use ws_proto::MessageDescriptor;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(FakeTransportFactory::new());
//! let client = WsClient::builder("wss://example.test/ws", factory).build();
//! client.connect().await?;
//!
//! let get_user = MessageDescriptor::rpc("GET_USER", MessageDescriptor::event("USER"));
//! let user = client
//!     .request(
//!         &get_user,
//!         json!({"id": "u1"}),
//!         get_user.response.as_deref().unwrap(),
//!         RequestOptions::default(),
//!     )
//!     .await?;
//! println!("{user}");
//! # Ok(()) }
//! ```

mod abort;
mod client;
mod config;
mod error;
mod queue;
pub mod testing;
mod transport;

pub use abort::{AbortController, AbortSignal};
pub use client::{
    ClientState, EventHandler, ProgressHandler, RequestOptions, WsClient, WsClientBuilder,
};
pub use config::{ClientConfig, QueuePolicy, ReconnectConfig};
pub use error::ClientError;
pub use transport::{
    ClientTransport, ClientTransportFactory, TransportEvent, TransportEvents, TransportState,
};
