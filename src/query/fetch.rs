//! Fetch policy state machine.
//!
//! One logical fetch = one call to [`QueryManager::fetch_query`]: the policy
//! decides the cache-read / network-read mix, intermediate cache values are
//! delivered through the record's listeners, and the returned future settles
//! with the fetch's final result.
//!
//! Race arbitration: every network read is tagged with a request id drawn at
//! activation time. A completing read commits to the record (and writes the
//! cache) only while its id is still the newest issued for that query;
//! superseded results are dropped without effect, whatever their completion
//! order.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::cancel::CancelKey;
use crate::error::{ClientError, Result};
use crate::link::dedup::map_through_resolvers;
use crate::link::Operation;
use crate::manager::QueryManager;
use crate::observable::{Observable, Observer};
use crate::query::record::{notify_error, notify_result, QueryRecord};
use crate::transform::TransformEntry;
use crate::types::{
    variables_key, Diff, Document, ErrorPolicy, ExecutionResult, FetchPolicy, NetworkStatus,
    QueryId, QueryResult, Variables,
};

// ============================================================================
// FetchOptions
// ============================================================================

/// Everything one activation of the state machine needs. Variables are
/// already merged over the document's defaults.
#[derive(Clone)]
pub(crate) struct FetchOptions {
    pub document: Document,
    pub variables: Variables,
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub return_partial_data: bool,
    pub notify_on_network_status_change: bool,
    pub context: Value,
    /// Per-request override of the manager-wide dedup default.
    pub deduplicate: Option<bool>,
}

impl FetchOptions {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            fetch_policy: FetchPolicy::default(),
            error_policy: ErrorPolicy::default(),
            return_partial_data: false,
            notify_on_network_status_change: false,
            context: Value::Null,
            deduplicate: None,
        }
    }
}

// ============================================================================
// Fetch machine
// ============================================================================

impl QueryManager {
    /// Run one logical fetch for `query_id` under `options.fetch_policy`.
    /// `status` is the network status the activation runs under (`Loading`,
    /// `Refetch`, `SetVariables`, or `Poll`).
    pub(crate) async fn fetch_query(
        self: &Arc<Self>,
        query_id: QueryId,
        options: FetchOptions,
        status: NetworkStatus,
    ) -> Result<QueryResult> {
        let entry =
            self.transforms()
                .transform(&options.document, self.cache(), self.resolvers_ref());

        let mut variables = options.variables.clone();
        if entry.has_client_exports {
            variables = self
                .resolvers()
                .add_exported_variables(&entry.document, &variables, &options.context)
                .await?;
        }

        let record = self.queries().get_or_create(query_id, || {
            QueryRecord::new(
                entry.document.clone(),
                variables.clone(),
                options.fetch_policy,
                options.error_policy,
                false,
            )
        });
        {
            let mut rec = record.lock();
            rec.document = entry.document.clone();
            rec.variables = variables.clone();
            rec.fetch_policy = options.fetch_policy;
            rec.error_policy = options.error_policy;
        }

        match options.fetch_policy {
            FetchPolicy::Standby => {
                record.lock().network_status = NetworkStatus::Idle;
                Ok(QueryResult {
                    data: None,
                    errors: Vec::new(),
                    loading: false,
                    network_status: NetworkStatus::Idle,
                    partial: false,
                })
            }

            FetchPolicy::CacheOnly => {
                let diff = self.cache().diff(&entry.document, &variables, true, true)?;
                let result = QueryResult::ready(diff.result.clone(), Vec::new(), !diff.complete);
                {
                    let mut rec = record.lock();
                    rec.network_status = NetworkStatus::Ready;
                    rec.network_error = None;
                    rec.diff = Some(diff);
                }
                notify_result(&record, result.clone());
                Ok(result)
            }

            FetchPolicy::CacheFirst => {
                let diff = self.cache().diff(&entry.document, &variables, true, true)?;
                if diff.complete {
                    let result = QueryResult::ready(diff.result.clone(), Vec::new(), false);
                    {
                        let mut rec = record.lock();
                        rec.network_status = NetworkStatus::Ready;
                        rec.network_error = None;
                        rec.diff = Some(diff);
                    }
                    notify_result(&record, result.clone());
                    return Ok(result);
                }
                if options.return_partial_data || options.notify_on_network_status_change {
                    let partial = QueryResult::loading(diff.result.clone(), status, true);
                    record.lock().diff = Some(diff);
                    notify_result(&record, partial);
                }
                self.fetch_from_network(query_id, &record, &entry, variables, &options, status)
                    .await
            }

            FetchPolicy::CacheAndNetwork => {
                let diff = self.cache().diff(&entry.document, &variables, true, true)?;
                let emit_cache_value = diff.complete
                    || options.return_partial_data
                    || options.notify_on_network_status_change;
                if emit_cache_value && diff.result.is_some() {
                    // Stale value first, status forced to loading; the fresh
                    // network value follows.
                    let stale = QueryResult::loading(diff.result.clone(), status, !diff.complete);
                    record.lock().diff = Some(diff);
                    notify_result(&record, stale);
                }
                self.fetch_from_network(query_id, &record, &entry, variables, &options, status)
                    .await
            }

            FetchPolicy::NetworkOnly | FetchPolicy::NoCache => {
                if options.notify_on_network_status_change {
                    let loading = QueryResult::loading(None, status, false);
                    notify_result(&record, loading);
                }
                self.fetch_from_network(query_id, &record, &entry, variables, &options, status)
                    .await
            }
        }
    }

    /// Issue the network read for one activation and commit its outcome,
    /// subject to the superseded-request check.
    async fn fetch_from_network(
        self: &Arc<Self>,
        query_id: QueryId,
        record: &Arc<Mutex<QueryRecord>>,
        entry: &Arc<TransformEntry>,
        variables: Variables,
        options: &FetchOptions,
        status: NetworkStatus,
    ) -> Result<QueryResult> {
        let request_id = self.next_request_id();
        {
            let mut rec = record.lock();
            rec.network_status = status;
            rec.last_request_id = request_id;
        }

        let deduplicate = options.deduplicate.unwrap_or(self.deduplicate());
        let source =
            self.observable_from_link(entry, options.context.clone(), &variables, deduplicate);

        // Promise-style settlement: first emission (or error) wins.
        let (tx, rx) = oneshot::channel::<Result<ExecutionResult>>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let next_slot = Arc::clone(&slot);
        let err_slot = Arc::clone(&slot);
        let done_slot = Arc::clone(&slot);
        let sub = source.subscribe(
            Observer::new()
                .on_next(move |result: ExecutionResult| {
                    if let Some(tx) = next_slot.lock().take() {
                        let _ = tx.send(Ok(result));
                    }
                })
                .on_error(move |err| {
                    if let Some(tx) = err_slot.lock().take() {
                        let _ = tx.send(Err(err));
                    }
                })
                .on_complete(move || {
                    if let Some(tx) = done_slot.lock().take() {
                        let _ = tx.send(Err(ClientError::network(
                            "link completed without emitting a result",
                        )));
                    }
                }),
        );
        record.lock().subscriptions.push(sub.clone());

        let abort_slot = Arc::clone(&slot);
        let abort_sub = sub.clone();
        self.cancels().register(
            CancelKey::Fetch(request_id),
            Box::new(move |reason| {
                abort_sub.unsubscribe();
                if let Some(tx) = abort_slot.lock().take() {
                    let _ = tx.send(Err(reason));
                }
            }),
        );

        let outcome = rx.await.unwrap_or(Err(ClientError::Stopped));
        self.cancels().complete(CancelKey::Fetch(request_id));
        // One emission settles a query fetch; detach so the dedup entry can
        // wind down, and drop settled subscriptions from the record.
        sub.unsubscribe();
        record.lock().subscriptions.retain(|s| !s.is_closed());

        let is_current = record.lock().last_request_id == request_id;

        let exec = match outcome {
            Err(err) => {
                if is_current {
                    let mut rec = record.lock();
                    rec.network_error = Some(err.clone());
                    rec.network_status = NetworkStatus::Error;
                    drop(rec);
                    notify_error(record, &err);
                } else {
                    tracing::trace!(query_id = %query_id, request_id, "dropping superseded error");
                }
                return Err(err);
            }
            Ok(exec) => exec,
        };

        if exec.has_errors() && options.error_policy == ErrorPolicy::None {
            let err = ClientError::GraphQl(exec.errors.clone());
            if is_current {
                let mut rec = record.lock();
                rec.graphql_errors = exec.errors.clone();
                rec.network_status = NetworkStatus::Error;
                drop(rec);
                notify_error(record, &err);
            } else {
                tracing::trace!(query_id = %query_id, request_id, "dropping superseded error");
            }
            return Err(err);
        }

        let surfaced_errors = match options.error_policy {
            ErrorPolicy::All => exec.errors.clone(),
            _ => Vec::new(),
        };
        let result = QueryResult::ready(exec.data.clone(), surfaced_errors.clone(), false);

        if !is_current {
            // Superseded: the newer request owns the record and the cache.
            tracing::trace!(query_id = %query_id, request_id, "dropping superseded result");
            return Ok(result);
        }

        if options.fetch_policy != FetchPolicy::NoCache {
            if let Some(data) = &exec.data {
                self.cache()
                    .write(data, "ROOT_QUERY", &entry.document, &variables)?;
            }
        }

        {
            let mut rec = record.lock();
            rec.network_status = NetworkStatus::Ready;
            rec.network_error = None;
            rec.graphql_errors = surfaced_errors;
            rec.diff = Some(Diff {
                result: exec.data.clone(),
                complete: true,
                missing: Vec::new(),
            });
            rec.last_result = Some(result.clone());
        }

        // The write may have changed data other queries observe.
        self.broadcast_queries();
        Ok(result)
    }

    /// Build the result stream for one network read. All-local documents
    /// short-circuit to a single empty emission; documents with a client
    /// split are mapped through the resolver engine.
    pub(crate) fn observable_from_link(
        &self,
        entry: &Arc<TransformEntry>,
        context: Value,
        variables: &Variables,
        deduplicate: bool,
    ) -> Observable<ExecutionResult> {
        let base = if let Some(server) = &entry.server_query {
            let operation = Operation {
                query: server.clone(),
                variables: variables.clone(),
                operation_name: server.name().map(str::to_string),
                context: self.resolvers().prepare_context(context.clone()),
            };
            if deduplicate {
                let key = (server.id(), variables_key(variables));
                self.in_flight()
                    .shared(key, self.link().execute(operation))
                    .observable()
            } else {
                self.link().execute(operation)
            }
        } else {
            Observable::of(ExecutionResult::empty())
        };

        let resolve_document = entry.client_query.clone().or_else(|| {
            entry
                .forced_resolvers
                .then(|| entry.document.clone())
        });
        match resolve_document {
            Some(document) => map_through_resolvers(
                base,
                self.resolvers(),
                document,
                context,
                variables.clone(),
            ),
            None => base,
        }
    }
}
