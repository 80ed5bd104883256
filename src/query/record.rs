//! QueryRecord — per-query mutable state, held in an arena-style registry.
//!
//! # Threading model
//!
//! The registry map and each record have independent `parking_lot` locks.
//! The critical rule is **never invoke a listener while holding either
//! lock**: notification snapshots listeners and the current value under the
//! record lock, releases it, then fires callbacks with panic isolation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ClientError, GraphQlError};
use crate::observable::Subscription;
use crate::types::{
    Diff, Document, ErrorPolicy, FetchPolicy, NetworkStatus, QueryId, QueryResult, Variables,
};

// ============================================================================
// Listeners
// ============================================================================

pub type ResultListener = Arc<dyn Fn(&QueryResult) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ClientError) + Send + Sync>;

pub(crate) struct ListenerEntry {
    pub id: u64,
    pub on_result: ResultListener,
    pub on_error: Option<ErrorListener>,
}

// ============================================================================
// QueryRecord
// ============================================================================

/// State of one active/registered query.
pub(crate) struct QueryRecord {
    pub document: Document,
    pub variables: Variables,
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub network_status: NetworkStatus,
    /// Monotonically increasing per query; results from older request ids
    /// are superseded and never applied.
    pub last_request_id: u64,
    /// Last cache read (or, for `no-cache`, the privately retained result).
    pub diff: Option<Diff>,
    pub last_result: Option<QueryResult>,
    pub listeners: Vec<ListenerEntry>,
    /// Network subscriptions to tear down on stop.
    pub subscriptions: Vec<Subscription>,
    pub graphql_errors: Vec<GraphQlError>,
    pub network_error: Option<ClientError>,
    /// Whether this record backs a watch handle (survives a store reset as
    /// a loading record instead of being stopped).
    pub watched: bool,
}

impl QueryRecord {
    pub fn new(
        document: Document,
        variables: Variables,
        fetch_policy: FetchPolicy,
        error_policy: ErrorPolicy,
        watched: bool,
    ) -> Self {
        Self {
            document,
            variables,
            fetch_policy,
            error_policy,
            network_status: NetworkStatus::Idle,
            last_request_id: 0,
            diff: None,
            last_result: None,
            listeners: Vec::new(),
            subscriptions: Vec::new(),
            graphql_errors: Vec::new(),
            network_error: None,
            watched,
        }
    }

    /// The value a new subscriber (or `current_result`) should see: the
    /// last delivered result, else the cached diff, else an empty value in
    /// the record's current status.
    pub fn current_result(&self) -> QueryResult {
        if let Some(result) = &self.last_result {
            return result.clone();
        }
        let (data, partial) = match &self.diff {
            Some(diff) => (diff.result.clone(), !diff.complete),
            None => (None, false),
        };
        QueryResult {
            data,
            errors: self.graphql_errors.clone(),
            loading: self.network_status.is_in_flight(),
            network_status: self.network_status,
            partial,
        }
    }

    /// The last failure recorded on this query, network-origin first.
    pub fn last_error(&self) -> Option<ClientError> {
        if let Some(err) = &self.network_error {
            return Some(err.clone());
        }
        if !self.graphql_errors.is_empty() {
            return Some(ClientError::GraphQl(self.graphql_errors.clone()));
        }
        None
    }
}

// ============================================================================
// QueryRegistry
// ============================================================================

#[derive(Default)]
pub(crate) struct QueryRegistry {
    records: Mutex<HashMap<QueryId, Arc<Mutex<QueryRecord>>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for `id` lazily, returning the existing one if the
    /// id was already referenced.
    pub fn get_or_create(
        &self,
        id: QueryId,
        init: impl FnOnce() -> QueryRecord,
    ) -> Arc<Mutex<QueryRecord>> {
        let mut records = self.records.lock();
        Arc::clone(
            records
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    pub fn get(&self, id: QueryId) -> Option<Arc<Mutex<QueryRecord>>> {
        self.records.lock().get(&id).cloned()
    }

    /// Delete the record, returning it so callers can tear down its
    /// subscriptions outside the registry lock.
    pub fn remove(&self, id: QueryId) -> Option<Arc<Mutex<QueryRecord>>> {
        self.records.lock().remove(&id)
    }

    pub fn ids(&self) -> Vec<QueryId> {
        self.records.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Snapshot all records, for broadcast-style passes.
    pub fn snapshot(&self) -> Vec<(QueryId, Arc<Mutex<QueryRecord>>)> {
        self.records
            .lock()
            .iter()
            .map(|(id, rec)| (*id, Arc::clone(rec)))
            .collect()
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Deliver `result` to every listener of `record`, recording it as the
/// record's last result. Listener panics are isolated so one misbehaving
/// subscriber cannot break the broadcast.
pub(crate) fn notify_result(record: &Arc<Mutex<QueryRecord>>, result: QueryResult) {
    let listeners: Vec<ResultListener> = {
        let mut rec = record.lock();
        rec.last_result = Some(result.clone());
        rec.listeners
            .iter()
            .map(|l| Arc::clone(&l.on_result))
            .collect()
    };
    for listener in listeners {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener(&result);
        }));
    }
}

/// Deliver `error` to every error listener of `record`.
pub(crate) fn notify_error(record: &Arc<Mutex<QueryRecord>>, error: &ClientError) {
    let listeners: Vec<ErrorListener> = {
        let rec = record.lock();
        rec.listeners
            .iter()
            .filter_map(|l| l.on_error.as_ref().map(Arc::clone))
            .collect()
    };
    for listener in listeners {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener(error);
        }));
    }
}
