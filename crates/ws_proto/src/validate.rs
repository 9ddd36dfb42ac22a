use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::descriptor::MessageDescriptor;

/// One problem found while validating a payload against a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path into the payload (`"user.name"`), empty at the root.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// All problems from one validation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationIssues(pub Vec<ValidationIssue>);

impl ValidationIssues {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![ValidationIssue::new(path, message)])
    }

    /// Client-safe details map for error payloads.
    pub fn to_details(&self) -> Map<String, Value> {
        let issues: Vec<Value> = self
            .0
            .iter()
            .map(|issue| {
                let mut entry = Map::new();
                entry.insert("path".to_string(), Value::from(issue.path.clone()));
                entry.insert("message".to_string(), Value::from(issue.message.clone()));
                Value::Object(entry)
            })
            .collect();
        let mut details = Map::new();
        details.insert("issues".to_string(), Value::from(issues));
        details
    }
}

/// Schema-library seam shared by the server engine and the client.
///
/// Consumers see only this hook and the [`MessageDescriptor`]; schema
/// internals stay in the adapter. Implementations may return a
/// transformed value (coercions, defaults) which replaces the payload.
/// Synchronous adapters simply return immediately.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        descriptor: &MessageDescriptor,
        value: &Value,
    ) -> Result<Value, ValidationIssues>;
}

/// Pass-through validator: accepts every payload unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl Validator for AcceptAllValidator {
    async fn validate(
        &self,
        _descriptor: &MessageDescriptor,
        value: &Value,
    ) -> Result<Value, ValidationIssues> {
        Ok(value.clone())
    }
}
