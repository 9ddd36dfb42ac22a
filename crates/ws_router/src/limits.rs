use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use ws_proto::{ErrorCode, RetryAfter, WsError};

/// Engine-wide resource caps.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Inbound frames larger than this are rejected before parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload_bytes: Option<usize>,
    /// Cap on concurrently in-flight dispatches across the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,
}

/// Tracks in-flight dispatches against `max_pending`.
#[derive(Debug)]
pub(crate) struct LimitsManager {
    config: LimitsConfig,
    pending: AtomicUsize,
}

impl LimitsManager {
    pub(crate) fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            pending: AtomicUsize::new(0),
        }
    }

    pub(crate) fn max_payload_bytes(&self) -> Option<usize> {
        self.config.max_payload_bytes
    }

    /// Admits one dispatch, or refuses when the engine is saturated.
    ///
    /// The returned slot releases itself when dropped, so the engine's
    /// finally position is the guard going out of scope: exactly one
    /// release per admission.
    pub(crate) fn begin(this: &Arc<Self>) -> Result<Option<PendingSlot>, WsError> {
        let Some(max) = this.config.max_pending else {
            return Ok(None);
        };

        let previous = this.pending.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            this.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(WsError::with_message(
                ErrorCode::ResourceExhausted,
                format!("engine at capacity ({max} in-flight messages)"),
            )
            .with_retry_after(RetryAfter::After(100)));
        }

        Ok(Some(PendingSlot {
            limits: Arc::clone(this),
        }))
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// RAII admission slot; dropping it releases the in-flight counter.
#[derive(Debug)]
pub(crate) struct PendingSlot {
    limits: Arc<LimitsManager>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.limits.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
