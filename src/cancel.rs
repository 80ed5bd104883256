//! Cancellation registry — abort hooks for outstanding operations.
//!
//! Every in-flight fetch and every top-level `query()` promise registers a
//! one-shot abort callback here. Bulk teardown (store reset, manager stop)
//! drains the registry and invokes every callback with a descriptive
//! failure; individual completion removes just that entry. Aborting an
//! already-settled or unknown operation is a no-op.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::ClientError;
use crate::types::QueryId;

/// Identity of one outstanding cancellable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CancelKey {
    /// A network fetch, keyed by request id.
    Fetch(u64),
    /// A top-level one-shot `query()` promise.
    Query(QueryId),
}

pub(crate) type AbortFn = Box<dyn FnOnce(ClientError) + Send>;

#[derive(Default)]
pub(crate) struct CancelRegistry {
    entries: Mutex<HashMap<CancelKey, AbortFn>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: CancelKey, abort: AbortFn) {
        self.entries.lock().insert(key, abort);
    }

    /// The operation settled on its own; drop its abort hook.
    pub fn complete(&self, key: CancelKey) {
        self.entries.lock().remove(&key);
    }

    /// Abort one operation. No-op if it already settled.
    pub fn abort(&self, key: CancelKey, reason: ClientError) {
        let abort = self.entries.lock().remove(&key);
        if let Some(abort) = abort {
            abort(reason);
        }
    }

    /// Abort every outstanding operation with `reason` and clear the
    /// registry. Callbacks run outside the lock.
    pub fn abort_all(&self, reason: &ClientError) {
        let drained: Vec<AbortFn> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, abort)| abort).collect()
        };
        for abort in drained {
            abort(reason.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
