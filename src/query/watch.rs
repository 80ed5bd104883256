//! WatchedQuery — the live handle returned by `watch_query`.
//!
//! Registration is inert: creating a handle (and subscribing listeners)
//! starts no network work. `activate()` runs the fetch machine under the
//! handle's *effective* policy, which is where the one-shot
//! cache-and-network dual emission lives: after the first activation the
//! effective policy downgrades to cache-first for the rest of the handle's
//! life.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ClientError, Result, UsageError};
use crate::manager::QueryManager;
use crate::query::fetch::FetchOptions;
use crate::query::record::{ErrorListener, ListenerEntry, ResultListener};
use crate::types::{
    ErrorPolicy, FetchPolicy, NetworkStatus, OperationKind, QueryId, QueryResult, Variables,
};

/// An owned one-shot closure that removes a subscription when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

// ============================================================================
// Options
// ============================================================================

#[derive(Clone)]
pub struct WatchQueryOptions {
    pub document: crate::types::Document,
    pub variables: Variables,
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub return_partial_data: bool,
    pub notify_on_network_status_change: bool,
    pub poll_interval: Option<Duration>,
    pub context: Value,
    /// Per-query override of the manager-wide dedup default.
    pub deduplicate: Option<bool>,
}

impl WatchQueryOptions {
    pub fn new(document: crate::types::Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            fetch_policy: FetchPolicy::default(),
            error_policy: ErrorPolicy::default(),
            return_partial_data: false,
            notify_on_network_status_change: false,
            poll_interval: None,
            context: Value::Null,
            deduplicate: None,
        }
    }
}

// ============================================================================
// WatchedQuery
// ============================================================================

struct WatchState {
    options: WatchQueryOptions,
    /// Policy applied on the next activation; diverges from the requested
    /// policy after cache-and-network's first run.
    effective_policy: FetchPolicy,
}

pub(crate) struct WatchInner {
    manager: Arc<QueryManager>,
    id: QueryId,
    state: Mutex<WatchState>,
}

/// Live handle over one registered query. Cheap to clone; clones share the
/// same query record and effective-policy state.
#[derive(Clone)]
pub struct WatchedQuery {
    inner: Arc<WatchInner>,
}

impl std::fmt::Debug for WatchedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedQuery")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl WatchedQuery {
    pub(crate) fn new(manager: Arc<QueryManager>, id: QueryId, options: WatchQueryOptions) -> Self {
        let effective_policy = options.fetch_policy;
        Self {
            inner: Arc::new(WatchInner {
                manager,
                id,
                state: Mutex::new(WatchState {
                    options,
                    effective_policy,
                }),
            }),
        }
    }

    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    /// Register listeners for result and error emissions. Returns an
    /// [`Unsubscribe`] closure; registering starts no fetch.
    pub fn subscribe(
        &self,
        on_result: ResultListener,
        on_error: Option<ErrorListener>,
    ) -> Unsubscribe {
        let listener_id = self.inner.manager.next_listener_id();
        if let Some(record) = self.inner.manager.queries().get(self.inner.id) {
            record.lock().listeners.push(ListenerEntry {
                id: listener_id,
                on_result,
                on_error,
            });
        }

        let manager = Arc::clone(&self.inner.manager);
        let query_id = self.inner.id;
        Box::new(move || {
            if let Some(record) = manager.queries().get(query_id) {
                record.lock().listeners.retain(|l| l.id != listener_id);
            }
        })
    }

    /// Run the fetch machine under the current effective policy. The first
    /// activation also starts polling when a poll interval was requested.
    pub async fn activate(&self) -> Result<QueryResult> {
        let (options, poll_interval) = {
            let st = self.inner.state.lock();
            (Self::fetch_options(&st.options, st.effective_policy), st.options.poll_interval)
        };

        let result = self
            .inner
            .manager
            .fetch_query(self.inner.id, options, NetworkStatus::Loading)
            .await;

        {
            let mut st = self.inner.state.lock();
            if st.effective_policy == FetchPolicy::CacheAndNetwork {
                st.effective_policy = FetchPolicy::CacheFirst;
            }
        }

        if let Some(interval) = poll_interval {
            self.start_polling(interval);
        }

        result
    }

    /// Issue a fresh network fetch, bypassing the cache for the read.
    pub async fn refetch(&self) -> Result<QueryResult> {
        let options = {
            let st = self.inner.state.lock();
            let policy = if st.options.fetch_policy == FetchPolicy::NoCache {
                FetchPolicy::NoCache
            } else {
                FetchPolicy::NetworkOnly
            };
            Self::fetch_options(&st.options, policy)
        };
        self.inner
            .manager
            .fetch_query(self.inner.id, options, NetworkStatus::Refetch)
            .await
    }

    /// Swap the handle's variables. Unchanged variables are a no-op
    /// (`Ok(None)`); changed ones trigger a fetch under the effective
    /// policy with status `SetVariables`.
    pub async fn set_variables(&self, variables: Variables) -> Result<Option<QueryResult>> {
        let options = {
            let mut st = self.inner.state.lock();
            let merged = crate::types::merge_variables(
                st.options.document.default_variables(),
                &variables,
            );
            if merged == st.options.variables {
                return Ok(None);
            }
            st.options.variables = merged;
            Self::fetch_options(&st.options, st.effective_policy)
        };
        self.inner
            .manager
            .fetch_query(self.inner.id, options, NetworkStatus::SetVariables)
            .await
            .map(Some)
    }

    /// Re-activate an inert (`standby`) handle under a different policy.
    pub async fn set_fetch_policy(&self, policy: FetchPolicy) -> Result<QueryResult> {
        let options = {
            let mut st = self.inner.state.lock();
            st.options.fetch_policy = policy;
            st.effective_policy = policy;
            Self::fetch_options(&st.options, policy)
        };
        let result = self
            .inner
            .manager
            .fetch_query(self.inner.id, options, NetworkStatus::Loading)
            .await;
        {
            let mut st = self.inner.state.lock();
            if st.effective_policy == FetchPolicy::CacheAndNetwork {
                st.effective_policy = FetchPolicy::CacheFirst;
            }
        }
        result
    }

    /// Start periodic network fetches with status `Poll`. A poll interval
    /// of zero is rejected. Replaces any previous poller for this handle.
    pub fn start_polling(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let manager = Arc::clone(&self.inner.manager);
        let query_id = self.inner.id;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                let options = {
                    let st = inner.state.lock();
                    let policy = match st.effective_policy {
                        // Polling is a network concern; cache-only and
                        // standby handles poll as network-only.
                        FetchPolicy::NoCache => FetchPolicy::NoCache,
                        _ => FetchPolicy::NetworkOnly,
                    };
                    Self::fetch_options(&st.options, policy)
                };
                let _ = inner
                    .manager
                    .fetch_query(query_id, options, NetworkStatus::Poll)
                    .await;
            }
        });
        manager.register_poller(query_id, handle);
    }

    pub fn stop_polling(&self) {
        self.inner.manager.stop_polling(self.inner.id);
    }

    /// The last failure recorded for this query, if any.
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner
            .manager
            .queries()
            .get(self.inner.id)
            .and_then(|record| record.lock().last_error())
    }

    /// The record's current value, without touching cache or network.
    pub fn current_result(&self) -> QueryResult {
        match self.inner.manager.queries().get(self.inner.id) {
            Some(record) => record.lock().current_result(),
            None => QueryResult {
                data: None,
                errors: Vec::new(),
                loading: false,
                network_status: NetworkStatus::Idle,
                partial: false,
            },
        }
    }

    /// Tear the query down: unsubscribe network subscriptions, stop
    /// polling, and delete the record.
    pub fn stop(&self) {
        self.inner.manager.stop_query(self.inner.id);
    }

    fn fetch_options(options: &WatchQueryOptions, policy: FetchPolicy) -> FetchOptions {
        FetchOptions {
            document: options.document.clone(),
            variables: options.variables.clone(),
            fetch_policy: policy,
            error_policy: options.error_policy,
            return_partial_data: options.return_partial_data,
            notify_on_network_status_change: options.notify_on_network_status_change,
            context: options.context.clone(),
            deduplicate: options.deduplicate,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

pub(crate) fn validate_watch_options(options: &WatchQueryOptions) -> Result<()> {
    if options.document.body().is_empty() {
        return Err(ClientError::Usage(UsageError::MissingDocument));
    }
    if options.document.kind() != OperationKind::Query {
        return Err(ClientError::Usage(UsageError::WrongDocumentKind {
            expected: "query",
            received: options.document.kind().as_str(),
        }));
    }
    Ok(())
}
