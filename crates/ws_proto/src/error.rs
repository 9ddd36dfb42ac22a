use std::{error, fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::code::ErrorCode;

/// `retryAfterMs` as it appears on the wire.
///
/// `Never` serializes as JSON `null` and means "impossible under the
/// current policy, do not retry"; `After(n)` suggests retrying after
/// `n` milliseconds. Absence of the field means no guidance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RetryAfter {
    After(u64),
    Never,
}

/// Client-safe error payload carried under the `ERROR` / `RPC_ERROR`
/// envelope types. Never includes the cause chain or a correlation id;
/// correlation travels in envelope meta.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(
        rename = "retryAfterMs",
        default,
        deserialize_with = "deserialize_retry_after",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_after_ms: Option<RetryAfter>,
}

/// An absent field is "no guidance" (`None`); an explicit `null` is
/// "do not retry" (`Some(Never)`). The outer `Option` would otherwise
/// swallow the null.
fn deserialize_retry_after<'de, D>(deserializer: D) -> Result<Option<RetryAfter>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u64>::deserialize(deserializer)?;
    Ok(Some(match value {
        Some(ms) => RetryAfter::After(ms),
        None => RetryAfter::Never,
    }))
}

impl ErrorBody {
    /// Minimal fallback body used when serializing the full payload
    /// fails.
    pub fn bare(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

/// Structured in-process error.
///
/// This is what handlers raise and what the lifecycle sink observes. The
/// `cause` chain stays in-process; [`WsError::to_body`] derives the
/// client-safe wire payload, applying the code table's defaults and
/// presence rules.
#[derive(Clone, Debug)]
pub struct WsError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Map<String, Value>>,
    /// Chained prior error, never transmitted.
    pub cause: Option<Arc<WsError>>,
    /// Explicit override of the code's default retryability.
    pub retryable: Option<bool>,
    /// Explicit override of the retry-after hint.
    pub retry_after_ms: Option<RetryAfter>,
    /// Correlation id for RPC errors; placed in envelope meta, never in
    /// the payload.
    pub correlation_id: Option<String>,
}

impl WsError {
    /// Creates an error with the code's default message.
    pub fn new(code: ErrorCode) -> Self {
        let message = code
            .default_message()
            .map(str::to_string)
            .unwrap_or_else(|| code.as_str().to_string());
        Self::with_message(code, message)
    }

    /// Creates an error with an explicit message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cause: None,
            retryable: None,
            retry_after_ms: None,
            correlation_id: None,
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_retry_after(mut self, retry_after: RetryAfter) -> Self {
        self.retry_after_ms = Some(retry_after);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_cause(mut self, cause: WsError) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Re-labels the error under a new code, keeping the current error
    /// reachable through `cause`.
    ///
    /// `retag(retag(e, X), Y)` yields code `Y` with both intermediate
    /// errors on the chain. Overrides and correlation id carry forward;
    /// the message resets to the new code's default.
    pub fn retag(self, code: ErrorCode) -> Self {
        let mut retagged = WsError::new(code);
        retagged.retryable = self.retryable;
        retagged.retry_after_ms = self.retry_after_ms;
        retagged.correlation_id = self.correlation_id.clone();
        retagged.cause = Some(Arc::new(self));
        retagged
    }

    /// Derives the client-safe wire payload.
    ///
    /// Defaults come from the code table; explicit overrides win where
    /// the table allows the field at all. `retryAfterMs` is stripped for
    /// terminal codes and CANCELLED even when explicitly set; transient
    /// codes fall back to the suggested backoff when no override is
    /// given.
    pub fn to_body(&self) -> ErrorBody {
        let retryable = self.retryable.or_else(|| self.code.default_retryable());
        let retry_after_ms = if self.code.retry_after_allowed() {
            self.retry_after_ms
                .or_else(|| self.code.suggest_backoff_ms().map(RetryAfter::After))
        } else {
            None
        };

        ErrorBody {
            code: self.code.clone(),
            message: self.message.clone(),
            details: self.details.clone(),
            retryable,
            retry_after_ms,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl error::Error for WsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn error::Error + 'static))
    }
}

impl From<ErrorCode> for WsError {
    fn from(code: ErrorCode) -> Self {
        WsError::new(code)
    }
}
