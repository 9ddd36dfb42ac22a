use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Retry behavior class of an error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Retrying the same call cannot succeed; `retryAfterMs` is
    /// forbidden on the wire.
    Terminal,
    /// Retrying after a short backoff may succeed.
    Transient,
    /// The call was cancelled; terminal, never carries `retryAfterMs`.
    Cancelled,
    /// Unclassified server fault; a retry may succeed after a larger
    /// backoff.
    Internal,
    /// Caller-defined code; assumed non-retryable unless overridden.
    Custom,
}

/// Error code taxonomy: thirteen standard members aligned to the common
/// RPC code set, plus an open space of caller-defined strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    AlreadyExists,
    Unimplemented,
    Cancelled,
    DeadlineExceeded,
    ResourceExhausted,
    Unavailable,
    Aborted,
    Internal,
    /// Any other code string chosen by the application.
    Custom(String),
}

impl ErrorCode {
    /// The wire spelling of the code.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Custom(code) => code,
        }
    }

    /// Parses a wire code, mapping unknown spellings to [`ErrorCode::Custom`].
    pub fn parse(code: &str) -> Self {
        match code {
            "UNAUTHENTICATED" => ErrorCode::Unauthenticated,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "INVALID_ARGUMENT" => ErrorCode::InvalidArgument,
            "FAILED_PRECONDITION" => ErrorCode::FailedPrecondition,
            "NOT_FOUND" => ErrorCode::NotFound,
            "ALREADY_EXISTS" => ErrorCode::AlreadyExists,
            "UNIMPLEMENTED" => ErrorCode::Unimplemented,
            "CANCELLED" => ErrorCode::Cancelled,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            "RESOURCE_EXHAUSTED" => ErrorCode::ResourceExhausted,
            "UNAVAILABLE" => ErrorCode::Unavailable,
            "ABORTED" => ErrorCode::Aborted,
            "INTERNAL" => ErrorCode::Internal,
            other => ErrorCode::Custom(other.to_string()),
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            ErrorCode::Unauthenticated
            | ErrorCode::PermissionDenied
            | ErrorCode::InvalidArgument
            | ErrorCode::FailedPrecondition
            | ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::Unimplemented => RetryClass::Terminal,
            ErrorCode::DeadlineExceeded
            | ErrorCode::ResourceExhausted
            | ErrorCode::Unavailable
            | ErrorCode::Aborted => RetryClass::Transient,
            ErrorCode::Cancelled => RetryClass::Cancelled,
            ErrorCode::Internal => RetryClass::Internal,
            ErrorCode::Custom(_) => RetryClass::Custom,
        }
    }

    /// Default `retryable` value inherited when the caller does not
    /// override it. `None` means the field is omitted on the wire.
    pub fn default_retryable(&self) -> Option<bool> {
        match self.retry_class() {
            RetryClass::Transient => Some(true),
            RetryClass::Terminal | RetryClass::Cancelled => Some(false),
            RetryClass::Internal | RetryClass::Custom => None,
        }
    }

    /// Suggested backoff hint for codes worth retrying.
    pub fn suggest_backoff_ms(&self) -> Option<u64> {
        match self {
            ErrorCode::DeadlineExceeded | ErrorCode::ResourceExhausted => Some(100),
            ErrorCode::Unavailable | ErrorCode::Aborted => Some(50),
            ErrorCode::Internal => Some(250),
            _ => None,
        }
    }

    /// Whether `retryAfterMs` may appear on the wire for this code.
    ///
    /// Forbidden for the seven terminal codes and for CANCELLED;
    /// optional for transient codes, INTERNAL, and custom codes.
    pub fn retry_after_allowed(&self) -> bool {
        !matches!(
            self.retry_class(),
            RetryClass::Terminal | RetryClass::Cancelled
        )
    }

    /// Default human-readable message for standard codes.
    pub fn default_message(&self) -> Option<&'static str> {
        match self {
            ErrorCode::Unauthenticated => Some("authentication required"),
            ErrorCode::PermissionDenied => Some("permission denied"),
            ErrorCode::InvalidArgument => Some("invalid argument"),
            ErrorCode::FailedPrecondition => Some("failed precondition"),
            ErrorCode::NotFound => Some("not found"),
            ErrorCode::AlreadyExists => Some("already exists"),
            ErrorCode::Unimplemented => Some("not implemented"),
            ErrorCode::Cancelled => Some("request cancelled"),
            ErrorCode::DeadlineExceeded => Some("deadline exceeded"),
            ErrorCode::ResourceExhausted => Some("resource exhausted"),
            ErrorCode::Unavailable => Some("service unavailable"),
            ErrorCode::Aborted => Some("operation aborted"),
            ErrorCode::Internal => Some("internal error"),
            ErrorCode::Custom(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        ErrorCode::parse(code)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CodeVisitor;

        impl de::Visitor<'_> for CodeVisitor {
            type Value = ErrorCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an error code string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ErrorCode, E> {
                Ok(ErrorCode::parse(value))
            }
        }

        deserializer.deserialize_str(CodeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERMINAL: [ErrorCode; 7] = [
        ErrorCode::Unauthenticated,
        ErrorCode::PermissionDenied,
        ErrorCode::InvalidArgument,
        ErrorCode::FailedPrecondition,
        ErrorCode::NotFound,
        ErrorCode::AlreadyExists,
        ErrorCode::Unimplemented,
    ];

    const TRANSIENT: [ErrorCode; 4] = [
        ErrorCode::DeadlineExceeded,
        ErrorCode::ResourceExhausted,
        ErrorCode::Unavailable,
        ErrorCode::Aborted,
    ];

    #[test]
    fn terminal_codes_forbid_retry_after() {
        for code in TERMINAL {
            assert!(!code.retry_after_allowed(), "{code}");
            assert_eq!(code.default_retryable(), Some(false), "{code}");
            assert_eq!(code.suggest_backoff_ms(), None, "{code}");
        }
    }

    #[test]
    fn transient_codes_are_retryable_with_backoff_hints() {
        for code in TRANSIENT {
            assert!(code.retry_after_allowed(), "{code}");
            assert_eq!(code.default_retryable(), Some(true), "{code}");
            let backoff = code.suggest_backoff_ms().unwrap();
            assert!((50..=100).contains(&backoff), "{code}: {backoff}");
        }
    }

    #[test]
    fn cancelled_is_terminal_and_internal_is_maybe() {
        assert!(!ErrorCode::Cancelled.retry_after_allowed());
        assert_eq!(ErrorCode::Cancelled.default_retryable(), Some(false));

        assert!(ErrorCode::Internal.retry_after_allowed());
        assert_eq!(ErrorCode::Internal.default_retryable(), None);
        assert!(ErrorCode::Internal.suggest_backoff_ms().unwrap() > 100);
    }

    #[test]
    fn custom_codes_round_trip_and_default_non_retryable() {
        let code = ErrorCode::parse("QUOTA_SOFT_CAP");
        assert_eq!(code, ErrorCode::Custom("QUOTA_SOFT_CAP".into()));
        assert_eq!(code.default_retryable(), None);
        assert!(code.retry_after_allowed());

        let wire = serde_json::to_string(&code).unwrap();
        assert_eq!(wire, r#""QUOTA_SOFT_CAP""#);
        let back: ErrorCode = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn standard_codes_serialize_as_screaming_snake() {
        let wire = serde_json::to_string(&ErrorCode::DeadlineExceeded).unwrap();
        assert_eq!(wire, r#""DEADLINE_EXCEEDED""#);
        let back: ErrorCode = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, ErrorCode::DeadlineExceeded);
    }
}
