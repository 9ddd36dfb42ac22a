use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reserved::is_reserved_type;

/// Whether a message expects a correlated response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget; no response descriptor.
    Event,
    /// Request expecting a matching response or error.
    Rpc,
}

/// Structural problems detected when a descriptor is validated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("message type must not be empty")]
    EmptyType,
    #[error("message type `{0}` uses a reserved prefix")]
    ReservedType(String),
    #[error("rpc descriptor `{0}` is missing a response descriptor")]
    MissingResponse(String),
    #[error("event descriptor `{0}` must not carry a response descriptor")]
    UnexpectedResponse(String),
    #[error("response descriptor for `{rpc}` is invalid: {source}")]
    InvalidResponse {
        rpc: String,
        #[source]
        source: Box<DescriptorError>,
    },
}

/// Validator-neutral description of one message type.
///
/// Schema builders produce descriptors; the router consumes them without
/// ever introspecting adapter-specific schema internals. The structural
/// invariant is enforced at registration: RPC descriptors carry a nested
/// response descriptor, event descriptors never do.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageDescriptor {
    /// Literal routing key, unique within a route table.
    #[serde(rename = "type")]
    pub message_type: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Opaque runtime brand supplied by schema builders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Response shape for RPC descriptors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Box<MessageDescriptor>>,
}

impl MessageDescriptor {
    /// Builds an event descriptor.
    pub fn event(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            kind: MessageKind::Event,
            version: None,
            brand: None,
            response: None,
        }
    }

    /// Builds an RPC descriptor with its response shape.
    pub fn rpc(message_type: impl Into<String>, response: MessageDescriptor) -> Self {
        Self {
            message_type: message_type.into(),
            kind: MessageKind::Rpc,
            version: None,
            brand: None,
            response: Some(Box::new(response)),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    /// Checks the structural invariants.
    ///
    /// A response descriptor must itself be a valid event descriptor: it
    /// carries no nested response of its own.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.message_type.is_empty() {
            return Err(DescriptorError::EmptyType);
        }

        match (self.kind, &self.response) {
            (MessageKind::Rpc, None) => {
                Err(DescriptorError::MissingResponse(self.message_type.clone()))
            }
            (MessageKind::Event, Some(_)) => Err(DescriptorError::UnexpectedResponse(
                self.message_type.clone(),
            )),
            (MessageKind::Rpc, Some(response)) => {
                response
                    .validate()
                    .map_err(|source| DescriptorError::InvalidResponse {
                        rpc: self.message_type.clone(),
                        source: Box::new(source),
                    })
            }
            (MessageKind::Event, None) => Ok(()),
        }
    }

    /// Validates for user registration, additionally rejecting reserved
    /// type prefixes the framework owns.
    pub fn validate_for_registration(&self) -> Result<(), DescriptorError> {
        if is_reserved_type(&self.message_type) {
            return Err(DescriptorError::ReservedType(self.message_type.clone()));
        }
        self.validate()
    }

    /// Returns a copy whose observable type is `prefix + type`. Response
    /// descriptors are left untouched.
    pub fn with_type_prefix(&self, prefix: &str) -> Self {
        let mut prefixed = self.clone();
        prefixed.message_type = format!("{prefix}{}", self.message_type);
        prefixed
    }
}
