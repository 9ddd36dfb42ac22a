use std::sync::Arc;

pub use ws_proto::{AcceptAllValidator, ValidationIssue, ValidationIssues, Validator};

use crate::context::MessageContext;

/// Hook observing inbound validation failures before the error envelope
/// is emitted.
pub type ValidationHook = Arc<dyn Fn(&MessageContext, &ValidationIssues) + Send + Sync>;
