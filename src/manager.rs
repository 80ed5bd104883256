//! QueryManager — the façade composing the transform cache, query registry,
//! dedup layer, fetch machine, mutation executor, and cancellation registry.
//!
//! # Threading model
//!
//! The manager is `Send + Sync` and is handed around as `Arc<QueryManager>`.
//! Registries use `parking_lot` mutexes held only for map access; the
//! critical rule is **never invoke a listener or collaborator callback with
//! a registry or record lock held**.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::cancel::{CancelKey, CancelRegistry};
use crate::error::{ClientError, Result, UsageError};
use crate::link::{InFlightRegistry, Link};
use crate::mutation::MutationStore;
use crate::observable::Observable;
use crate::query::fetch::FetchOptions;
use crate::query::record::{notify_result, QueryRegistry};
use crate::query::watch::{validate_watch_options, WatchQueryOptions, WatchedQuery};
use crate::resolvers::{LocalResolvers, NoopResolvers};
use crate::store::Cache;
use crate::transform::TransformCache;
use crate::types::{
    merge_variables, ErrorPolicy, ExecutionResult, FetchPolicy, MutationId, NetworkStatus,
    OperationKind, QueryId, QueryResult, Variables,
};

// ============================================================================
// Options
// ============================================================================

/// Configuration for [`QueryManager::new`].
pub struct QueryManagerOptions {
    pub cache: Arc<dyn Cache>,
    pub link: Arc<dyn Link>,
    /// Resolver engine; defaults to [`NoopResolvers`] when absent.
    pub resolvers: Option<Arc<dyn LocalResolvers>>,
    /// Manager-wide default for in-flight request deduplication.
    pub deduplicate: bool,
}

impl QueryManagerOptions {
    pub fn new(cache: Arc<dyn Cache>, link: Arc<dyn Link>) -> Self {
        Self {
            cache,
            link,
            resolvers: None,
            deduplicate: true,
        }
    }
}

/// One-shot query options (see [`QueryManager::query`]).
#[derive(Clone)]
pub struct QueryOptions {
    pub document: crate::types::Document,
    pub variables: Variables,
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub context: Value,
    /// Rejected by `query()`; accepted here so misuse fails loudly instead
    /// of being silently impossible to express.
    pub return_partial_data: bool,
    /// Rejected by `query()`.
    pub poll_interval: Option<std::time::Duration>,
    /// Per-request override of the manager-wide dedup default.
    pub deduplicate: Option<bool>,
}

impl QueryOptions {
    pub fn new(document: crate::types::Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            fetch_policy: FetchPolicy::default(),
            error_policy: ErrorPolicy::default(),
            context: Value::Null,
            return_partial_data: false,
            poll_interval: None,
            deduplicate: None,
        }
    }
}

/// GraphQL subscription options (see [`QueryManager::subscribe`]).
#[derive(Clone)]
pub struct SubscriptionOptions {
    pub document: crate::types::Document,
    pub variables: Variables,
    pub context: Value,
}

impl SubscriptionOptions {
    pub fn new(document: crate::types::Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            context: Value::Null,
        }
    }
}

// ============================================================================
// QueryManager
// ============================================================================

pub struct QueryManager {
    cache: Arc<dyn Cache>,
    link: Arc<dyn Link>,
    resolvers: Arc<dyn LocalResolvers>,
    transforms: TransformCache,
    queries: QueryRegistry,
    mutations: MutationStore,
    in_flight: InFlightRegistry,
    cancels: CancelRegistry,
    deduplicate: bool,
    next_query_id: AtomicU64,
    next_mutation_id: AtomicU64,
    next_request_id: AtomicU64,
    next_listener_id: AtomicU64,
    pollers: Mutex<HashMap<QueryId, tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl QueryManager {
    pub fn new(options: QueryManagerOptions) -> Arc<Self> {
        Arc::new(Self {
            cache: options.cache,
            link: options.link,
            resolvers: options
                .resolvers
                .unwrap_or_else(|| Arc::new(NoopResolvers)),
            transforms: TransformCache::new(),
            queries: QueryRegistry::new(),
            mutations: MutationStore::new(),
            in_flight: InFlightRegistry::new(),
            cancels: CancelRegistry::new(),
            deduplicate: options.deduplicate,
            next_query_id: AtomicU64::new(1),
            next_mutation_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
            pollers: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Public API — queries
    // -----------------------------------------------------------------------

    /// Register a watched query and return its live handle. Registration
    /// starts no fetch; the handle's `activate()` does.
    pub fn watch_query(self: &Arc<Self>, options: WatchQueryOptions) -> Result<WatchedQuery> {
        self.ensure_active()?;
        validate_watch_options(&options)?;

        let entry = self
            .transforms
            .transform(&options.document, self.cache(), self.resolvers_ref());

        let mut options = options;
        options.variables = merge_variables(&entry.default_variables, &options.variables);

        let id = QueryId(self.next_query_id.fetch_add(1, Ordering::Relaxed));
        self.queries.get_or_create(id, || {
            crate::query::record::QueryRecord::new(
                entry.document.clone(),
                options.variables.clone(),
                options.fetch_policy,
                options.error_policy,
                true,
            )
        });

        Ok(WatchedQuery::new(Arc::clone(self), id, options))
    }

    /// One-shot query: register, activate once, resolve the first settled
    /// result, and clean up. The returned result does not survive a store
    /// reset; the in-flight promise participates in cancellation.
    pub async fn query(self: &Arc<Self>, options: QueryOptions) -> Result<QueryResult> {
        self.ensure_active()?;
        if options.document.body().is_empty() {
            return Err(UsageError::MissingDocument.into());
        }
        if options.document.kind() != OperationKind::Query {
            return Err(UsageError::WrongDocumentKind {
                expected: "query",
                received: options.document.kind().as_str(),
            }
            .into());
        }
        if options.return_partial_data {
            return Err(UsageError::UnsupportedOption {
                option: "return_partial_data",
                operation: "query()",
            }
            .into());
        }
        if options.poll_interval.is_some() {
            return Err(UsageError::UnsupportedOption {
                option: "poll_interval",
                operation: "query()",
            }
            .into());
        }
        if matches!(
            options.fetch_policy,
            FetchPolicy::CacheAndNetwork | FetchPolicy::Standby
        ) {
            return Err(UsageError::UnsupportedFetchPolicy {
                policy: options.fetch_policy.as_str(),
                operation: "query()",
            }
            .into());
        }

        let entry = self
            .transforms
            .transform(&options.document, self.cache(), self.resolvers_ref());
        let variables = merge_variables(&entry.default_variables, &options.variables);

        let id = QueryId(self.next_query_id.fetch_add(1, Ordering::Relaxed));
        let fetch_options = FetchOptions {
            document: options.document.clone(),
            variables,
            fetch_policy: options.fetch_policy,
            error_policy: options.error_policy,
            return_partial_data: false,
            notify_on_network_status_change: false,
            context: options.context.clone(),
            deduplicate: options.deduplicate,
        };

        // Top-level promise abort hook, alongside the fetch's own.
        let (tx, rx) = oneshot::channel::<ClientError>();
        self.cancels.register(
            CancelKey::Query(id),
            Box::new(move |reason| {
                let _ = tx.send(reason);
            }),
        );

        let fetch = self.fetch_query(id, fetch_options, NetworkStatus::Loading);
        tokio::pin!(fetch);
        let result = tokio::select! {
            r = &mut fetch => r,
            reason = rx => Err(reason.unwrap_or(ClientError::Stopped)),
        };

        self.cancels.complete(CancelKey::Query(id));
        self.stop_query(id);
        result
    }

    /// Start a GraphQL subscription, returning its result stream. The core
    /// does not write subscription data into the cache.
    pub async fn subscribe(
        self: &Arc<Self>,
        options: SubscriptionOptions,
    ) -> Result<Observable<ExecutionResult>> {
        self.ensure_active()?;
        if options.document.kind() != OperationKind::Subscription {
            return Err(UsageError::WrongDocumentKind {
                expected: "subscription",
                received: options.document.kind().as_str(),
            }
            .into());
        }

        let entry = self
            .transforms
            .transform(&options.document, self.cache(), self.resolvers_ref());
        let mut variables = merge_variables(&entry.default_variables, &options.variables);
        if entry.has_client_exports {
            variables = self
                .resolvers
                .add_exported_variables(&entry.document, &variables, &options.context)
                .await?;
        }

        Ok(self.observable_from_link(&entry, options.context, &variables, self.deduplicate))
    }

    // -----------------------------------------------------------------------
    // Public API — lifecycle
    // -----------------------------------------------------------------------

    /// Tear one query down: stop polling, unsubscribe its network
    /// subscriptions, detach cancellation tracking, delete the record.
    pub fn stop_query(&self, id: QueryId) {
        self.stop_polling(id);
        if let Some(record) = self.queries.remove(id) {
            let (subscriptions, last_request_id) = {
                let mut rec = record.lock();
                (std::mem::take(&mut rec.subscriptions), rec.last_request_id)
            };
            for sub in subscriptions {
                sub.unsubscribe();
            }
            self.cancels.complete(CancelKey::Fetch(last_request_id));
        }
        self.cancels.complete(CancelKey::Query(id));
    }

    /// Delete the record without touching its network subscriptions — the
    /// narrow half of [`stop_query`](Self::stop_query), for callers that
    /// already tore the query down.
    pub fn remove_query(&self, id: QueryId) {
        self.queries.remove(id);
        self.cancels.complete(CancelKey::Query(id));
    }

    /// Stop every managed query, then abort every outstanding operation
    /// with a manager-stopped failure. The manager accepts no new work
    /// afterwards.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for id in self.queries.ids() {
            self.stop_query(id);
        }
        self.cancels.abort_all(&ClientError::Stopped);
        let pollers: Vec<_> = self.pollers.lock().drain().collect();
        for (_, handle) in pollers {
            handle.abort();
        }
    }

    /// Abort in-flight work, put watched queries into a loading state, stop
    /// unwatched ones, reset mutation bookkeeping, and clear the cache.
    /// Does not refetch — see [`reset_store`](Self::reset_store).
    pub async fn clear_store(&self) -> Result<()> {
        self.cancels.abort_all(&ClientError::StoreReset);

        for (id, record) in self.queries.snapshot() {
            let watched = {
                let mut rec = record.lock();
                if rec.watched {
                    // Listeners keep their last data; status says a fresh
                    // value is on the way rather than showing an empty read.
                    rec.network_status = NetworkStatus::Loading;
                    rec.network_error = None;
                    rec.graphql_errors.clear();
                    if let Some(result) = &mut rec.last_result {
                        result.loading = true;
                        result.network_status = NetworkStatus::Loading;
                    }
                }
                rec.watched
            };
            if !watched {
                self.stop_query(id);
            }
        }

        self.mutations.reset();
        self.cache.reset().await
    }

    /// `clear_store()` followed by a network refetch of every still-watched
    /// query that is not `cache-only` or `standby`.
    pub async fn reset_store(self: &Arc<Self>) -> Result<Vec<Result<QueryResult>>> {
        self.clear_store().await?;
        Ok(self.refetch_observable_queries(false).await)
    }

    /// Re-issue a network fetch for every watched query, skipping
    /// `cache-only` always and `standby` unless `include_standby`.
    pub async fn refetch_observable_queries(
        self: &Arc<Self>,
        include_standby: bool,
    ) -> Vec<Result<QueryResult>> {
        let mut results = Vec::new();
        for (id, record) in self.queries.snapshot() {
            let options = {
                let rec = record.lock();
                if !rec.watched
                    || rec.fetch_policy == FetchPolicy::CacheOnly
                    || (rec.fetch_policy == FetchPolicy::Standby && !include_standby)
                {
                    continue;
                }
                FetchOptions {
                    document: rec.document.clone(),
                    variables: rec.variables.clone(),
                    fetch_policy: if rec.fetch_policy == FetchPolicy::NoCache {
                        FetchPolicy::NoCache
                    } else {
                        FetchPolicy::NetworkOnly
                    },
                    error_policy: rec.error_policy,
                    return_partial_data: false,
                    notify_on_network_status_change: false,
                    context: Value::Null,
                    deduplicate: None,
                }
            };
            results.push(self.fetch_query(id, options, NetworkStatus::Refetch).await);
        }
        results
    }

    /// Notify every listening record of its current value: a fresh cache
    /// diff for cache-reading policies, the privately retained result for
    /// `no-cache`.
    pub fn broadcast_queries(&self) {
        for (_id, record) in self.queries.snapshot() {
            let snapshot = {
                let rec = record.lock();
                if rec.listeners.is_empty() {
                    continue;
                }
                (
                    rec.document.clone(),
                    rec.variables.clone(),
                    rec.fetch_policy,
                    rec.network_status,
                    rec.graphql_errors.clone(),
                    rec.last_result.clone(),
                )
            };
            let (document, variables, policy, status, graphql_errors, last_result) = snapshot;

            if policy.reads_cache() {
                let diff = match self.cache.diff(&document, &variables, true, true) {
                    Ok(diff) => diff,
                    Err(err) => {
                        tracing::warn!(error = %err, "cache diff failed during broadcast");
                        continue;
                    }
                };
                let result = QueryResult {
                    data: diff.result.clone(),
                    errors: graphql_errors,
                    loading: status.is_in_flight(),
                    network_status: status,
                    partial: !diff.complete,
                };
                record.lock().diff = Some(diff);
                notify_result(&record, result);
            } else if let Some(result) = last_result {
                notify_result(&record, result);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Bookkeeping for one mutation, if it was ever started.
    pub fn mutation_record(&self, id: MutationId) -> Option<crate::mutation::MutationRecord> {
        self.mutations.get(id)
    }

    /// All retained mutation records, in no particular order.
    pub fn mutation_records(&self) -> Vec<(MutationId, crate::mutation::MutationRecord)> {
        self.mutations.snapshot()
    }

    /// Number of registered queries (watched and one-shot).
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Number of retained mutation records.
    pub fn mutation_count(&self) -> usize {
        self.mutations.len()
    }

    /// Number of in-flight deduplicated request keys.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // -----------------------------------------------------------------------
    // Crate-internal accessors
    // -----------------------------------------------------------------------

    pub(crate) fn cache(&self) -> &dyn Cache {
        self.cache.as_ref()
    }

    pub(crate) fn link(&self) -> &dyn Link {
        self.link.as_ref()
    }

    pub(crate) fn resolvers(&self) -> Arc<dyn LocalResolvers> {
        Arc::clone(&self.resolvers)
    }

    pub(crate) fn resolvers_ref(&self) -> &dyn LocalResolvers {
        self.resolvers.as_ref()
    }

    pub(crate) fn transforms(&self) -> &TransformCache {
        &self.transforms
    }

    pub(crate) fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    pub(crate) fn mutations(&self) -> &MutationStore {
        &self.mutations
    }

    pub(crate) fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub(crate) fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    pub(crate) fn deduplicate(&self) -> bool {
        self.deduplicate
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_mutation_id(&self) -> MutationId {
        MutationId(self.next_mutation_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(ClientError::Stopped)
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_poller(&self, id: QueryId, handle: tokio::task::JoinHandle<()>) {
        if let Some(previous) = self.pollers.lock().insert(id, handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_polling(&self, id: QueryId) {
        if let Some(handle) = self.pollers.lock().remove(&id) {
            handle.abort();
        }
    }
}
