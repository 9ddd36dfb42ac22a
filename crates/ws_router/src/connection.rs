use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::{Map, Value};

use crate::socket::ServerSocket;

/// Opaque connection identity, assigned at accept time and stable for
/// the socket's lifetime.
pub type ClientId = String;

/// Per-connection state owned by the router.
///
/// The data map is shared by every context created for this socket, so
/// capability plugins and handlers observe one mutable record until the
/// close handler drops it.
pub(crate) struct Connection {
    pub(crate) socket: Arc<dyn ServerSocket>,
    data: Mutex<Map<String, Value>>,
}

impl Connection {
    pub(crate) fn new(socket: Arc<dyn ServerSocket>) -> Self {
        Self {
            socket,
            data: Mutex::new(Map::new()),
        }
    }

    pub(crate) fn data_value(&self, key: &str) -> Option<Value> {
        self.data.lock().expect("connection data lock").get(key).cloned()
    }

    pub(crate) fn data_snapshot(&self) -> Map<String, Value> {
        self.data.lock().expect("connection data lock").clone()
    }

    /// Shallow merge; overlapping keys take the incoming value.
    pub(crate) fn assign_data(&self, partial: Map<String, Value>) {
        let mut data = self.data.lock().expect("connection data lock");
        for (key, value) in partial {
            data.insert(key, value);
        }
    }

    pub(crate) fn set_data(&self, key: impl Into<String>, value: Value) {
        self.data
            .lock()
            .expect("connection data lock")
            .insert(key.into(), value);
    }
}

/// Registry of live connections keyed by client id. Entries are created
/// by `handle_open` and dropped by `handle_close`; correctness never
/// relies on garbage collection.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    inner: Mutex<HashMap<ClientId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub(crate) fn insert(&self, client_id: ClientId, connection: Arc<Connection>) {
        self.inner
            .lock()
            .expect("connection registry lock")
            .insert(client_id, connection);
    }

    pub(crate) fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .expect("connection registry lock")
            .get(client_id)
            .cloned()
    }

    pub(crate) fn remove(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .expect("connection registry lock")
            .remove(client_id)
    }
}
