use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use ws_proto::{DescriptorError, MessageDescriptor};

use crate::middleware::{MessageHandler, Middleware};

/// How `merge` and `mount` resolve a type collision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Refuse the whole operation on the first collision.
    #[default]
    Error,
    /// Keep the target's entry, drop the incoming one.
    Skip,
    /// Replace the target's entry with the incoming one.
    Replace,
}

/// Registration and composition failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("message type `{0}` is already registered")]
    Duplicate(String),
    #[error("merge conflict on message type `{0}`")]
    Conflict(String),
}

/// One registered route: descriptor, per-route middleware in
/// registration order, and the handler.
#[derive(Clone)]
pub struct RouteEntry {
    pub schema: MessageDescriptor,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub handler: Arc<dyn MessageHandler>,
}

impl RouteEntry {
    pub fn new(schema: MessageDescriptor, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            schema,
            middlewares: Vec::new(),
            handler,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }
}

/// Registry of handlers keyed by message type.
///
/// Lookup is independent of insertion order; enumeration (for `merge`
/// and `mount`) is deterministic by type.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one route.
    ///
    /// Fails when the descriptor is structurally invalid (an RPC
    /// descriptor without a valid response, an event descriptor with
    /// one, an empty or reserved type) or the type already exists.
    pub fn register(&mut self, entry: RouteEntry) -> Result<(), RegistryError> {
        entry.schema.validate_for_registration()?;

        let message_type = entry.schema.message_type.clone();
        if self.routes.contains_key(&message_type) {
            return Err(RegistryError::Duplicate(message_type));
        }
        self.routes.insert(message_type, entry);
        Ok(())
    }

    pub fn get(&self, message_type: &str) -> Option<&RouteEntry> {
        self.routes.get(message_type)
    }

    pub fn has(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Registered descriptors in type order.
    pub fn list(&self) -> Vec<&MessageDescriptor> {
        self.routes.values().map(|entry| &entry.schema).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Folds another table into this one.
    ///
    /// Entries are taken in the source's deterministic order and the
    /// conflict policy is applied per entry. Under
    /// [`ConflictPolicy::Error`] the sources are pre-scanned, so a
    /// refused merge leaves the target exactly as it was.
    pub fn merge(&mut self, other: RouteTable, policy: ConflictPolicy) -> Result<(), RegistryError> {
        if policy == ConflictPolicy::Error {
            if let Some(collision) = other
                .routes
                .keys()
                .find(|message_type| self.routes.contains_key(*message_type))
            {
                return Err(RegistryError::Conflict(collision.clone()));
            }
        }

        for (message_type, entry) in other.routes {
            match policy {
                ConflictPolicy::Skip if self.routes.contains_key(&message_type) => {}
                _ => {
                    self.routes.insert(message_type, entry);
                }
            }
        }
        Ok(())
    }

    /// Mounts another table under a type prefix.
    ///
    /// Each mounted entry's descriptor is rewritten so its observable
    /// type is `prefix + originalType`; all other descriptor fields are
    /// copied unchanged. Conflicts follow the same staging rule as
    /// [`RouteTable::merge`].
    pub fn mount(
        &mut self,
        prefix: &str,
        other: RouteTable,
        policy: ConflictPolicy,
    ) -> Result<(), RegistryError> {
        let mut prefixed = RouteTable::new();
        for (_, mut entry) in other.routes {
            entry.schema = entry.schema.with_type_prefix(prefix);
            entry.schema.validate_for_registration()?;
            prefixed
                .routes
                .insert(entry.schema.message_type.clone(), entry);
        }
        self.merge(prefixed, policy)
    }
}
