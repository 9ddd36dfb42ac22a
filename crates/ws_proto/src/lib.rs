#![forbid(unsafe_code)]
//! Shared protocol types for the socket router.
//!
//! This crate is transport- and validator-neutral. It provides:
//! - The JSON wire [`Envelope`] (`{type, meta, payload?}`) with
//!   server-reserved meta handling.
//! - [`MessageDescriptor`], the in-process contract schema builders
//!   produce and the router consumes.
//! - The error-code taxonomy ([`ErrorCode`]) with retry metadata, the
//!   in-process [`WsError`] object, and the client-safe [`ErrorBody`]
//!   wire payload.
//!
//! Both the server engine and the client state machine depend on these
//! shapes; nothing here performs I/O.

mod code;
mod descriptor;
mod envelope;
mod error;
mod reserved;
mod validate;

pub use code::{ErrorCode, RetryClass};
pub use descriptor::{DescriptorError, MessageDescriptor, MessageKind};
pub use envelope::{meta, Envelope, EnvelopeError};
pub use error::{ErrorBody, RetryAfter, WsError};
pub use reserved::{
    is_reserved_type, ERROR_TYPE, HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE, RESERVED_PREFIXES,
    RPC_ERROR_TYPE, RPC_PROGRESS_TYPE, WS_CLOSE_EVENT, WS_OPEN_EVENT,
};
pub use validate::{AcceptAllValidator, ValidationIssue, ValidationIssues, Validator};
