//! Mutation executor — optimistic write, network execution, transactional
//! commit, and post-settlement refetches.
//!
//! The pipeline is strictly sequential: apply the optimistic layer (if
//! any) and broadcast → execute over the link (never deduplicated) →
//! commit the server result, `update_queries` deltas, and the `update`
//! callback as one cache transaction → remove the optimistic layer and
//! broadcast → run refetches. A faulty caller-supplied reducer or update
//! callback is isolated and logged; it cannot corrupt the rest of the
//! transaction.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ClientError, Result, UsageError};
use crate::manager::{QueryManager, QueryOptions};
use crate::observable::Observer;
use crate::query::fetch::FetchOptions;
use crate::store::Cache;
use crate::types::{
    merge_variables, Document, ErrorPolicy, ExecutionResult, FetchPolicy, MutationId,
    NetworkStatus, OperationKind, Variables,
};

// ============================================================================
// Options
// ============================================================================

/// The speculative value applied before the real result is known: either a
/// static response or a function of the mutation variables.
#[derive(Clone)]
pub enum OptimisticResponse {
    Value(Value),
    #[allow(clippy::type_complexity)]
    Compute(Arc<dyn Fn(&Variables) -> Value + Send + Sync>),
}

impl OptimisticResponse {
    fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Compute(f) => f(variables),
        }
    }
}

/// A per-query reducer registered under a query's operation name. Receives
/// the query's current complete cache view, the mutation result, and the
/// query's variables; returns the new query data, or `None` for no change.
pub type MutationQueryReducer =
    Arc<dyn Fn(Option<&Value>, &ExecutionResult, &Variables) -> Option<Value> + Send + Sync>;

/// Generic update callback run inside the commit transaction.
pub type MutationUpdateFn = Arc<dyn Fn(&dyn Cache, &ExecutionResult) + Send + Sync>;

/// What to refetch once the mutation settles.
#[derive(Clone)]
pub enum RefetchTarget {
    /// Every watched query with this operation name.
    Name(String),
    /// An explicit document + variables, run as a fresh one-shot query.
    Query {
        document: Document,
        variables: Variables,
    },
}

pub struct MutationOptions {
    pub document: Document,
    pub variables: Variables,
    pub optimistic_response: Option<OptimisticResponse>,
    /// Name-keyed reducers re-run against each query's current cache view.
    pub update_queries: HashMap<String, MutationQueryReducer>,
    pub update: Option<MutationUpdateFn>,
    pub refetch_queries: Vec<RefetchTarget>,
    /// Await refetches before resolving the mutation.
    pub await_refetch_queries: bool,
    pub error_policy: ErrorPolicy,
    /// Only `Some(FetchPolicy::NoCache)` or `None` (default write-through).
    pub fetch_policy: Option<FetchPolicy>,
    pub context: Value,
}

impl MutationOptions {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            optimistic_response: None,
            update_queries: HashMap::new(),
            update: None,
            refetch_queries: Vec::new(),
            await_refetch_queries: false,
            error_policy: ErrorPolicy::default(),
            fetch_policy: None,
            context: Value::Null,
        }
    }
}

// ============================================================================
// MutationStore
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

/// Bookkeeping for one mutation invocation. Retained for introspection;
/// never actively destroyed outside a store reset.
#[derive(Clone)]
pub struct MutationRecord {
    pub document: Document,
    pub variables: Variables,
    pub outcome: MutationOutcome,
}

#[derive(Default)]
pub(crate) struct MutationStore {
    records: Mutex<HashMap<MutationId, MutationRecord>>,
}

impl MutationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, id: MutationId, document: Document, variables: Variables) {
        self.records.lock().insert(
            id,
            MutationRecord {
                document,
                variables,
                outcome: MutationOutcome::Pending,
            },
        );
    }

    pub fn succeed(&self, id: MutationId) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.outcome = MutationOutcome::Succeeded;
        }
    }

    pub fn fail(&self, id: MutationId, message: String) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.outcome = MutationOutcome::Failed(message);
        }
    }

    pub fn get(&self, id: MutationId) -> Option<MutationRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<(MutationId, MutationRecord)> {
        self.records
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

// ============================================================================
// Executor
// ============================================================================

impl QueryManager {
    /// Run a mutation to settlement and resolve with its (policy-filtered)
    /// result. See the module docs for the pipeline stages.
    pub async fn mutate(self: &Arc<Self>, options: MutationOptions) -> Result<ExecutionResult> {
        self.ensure_active()?;
        if options.document.body().is_empty() {
            return Err(UsageError::MissingDocument.into());
        }
        if options.document.kind() != OperationKind::Mutation {
            return Err(UsageError::WrongDocumentKind {
                expected: "mutation",
                received: options.document.kind().as_str(),
            }
            .into());
        }
        if let Some(policy) = options.fetch_policy {
            if policy != FetchPolicy::NoCache {
                return Err(UsageError::UnsupportedFetchPolicy {
                    policy: policy.as_str(),
                    operation: "mutate()",
                }
                .into());
            }
        }

        let mutation_id = self.next_mutation_id();
        let entry = self
            .transforms()
            .transform(&options.document, self.cache(), self.resolvers_ref());

        let mut variables = merge_variables(&entry.default_variables, &options.variables);
        self.mutations()
            .start(mutation_id, entry.document.clone(), variables.clone());

        if entry.has_client_exports {
            variables = match self
                .resolvers()
                .add_exported_variables(&entry.document, &variables, &options.context)
                .await
            {
                Ok(vars) => vars,
                Err(err) => {
                    self.mutations().fail(mutation_id, err.to_string());
                    return Err(err);
                }
            };
        }

        // Optimistic layer, tagged with the mutation id for precise rollback.
        let optimistic_applied = match &options.optimistic_response {
            Some(optimistic) => {
                let value = optimistic.resolve(&variables);
                let document = entry.document.clone();
                let vars = variables.clone();
                self.cache().record_optimistic_transaction(
                    &mut |cache| {
                        if let Err(err) = cache.write(&value, "ROOT_MUTATION", &document, &vars) {
                            tracing::warn!(mutation_id = %mutation_id, error = %err, "optimistic write failed");
                        }
                    },
                    &mutation_id.to_string(),
                );
                self.broadcast_queries();
                true
            }
            None => false,
        };

        // Same transport path as queries, never deduplicated.
        let source = self.observable_from_link(&entry, options.context.clone(), &variables, false);
        let outcome = await_first_result(source).await;

        let exec = match outcome {
            Ok(exec) => exec,
            Err(err) => {
                return self.settle_failed(mutation_id, optimistic_applied, err);
            }
        };
        if exec.has_errors() && options.error_policy == ErrorPolicy::None {
            let err = ClientError::GraphQl(exec.errors.clone());
            return self.settle_failed(mutation_id, optimistic_applied, err);
        }

        // Commit: server result + reducers + update callback, one transaction.
        if options.fetch_policy != Some(FetchPolicy::NoCache) {
            let reducer_targets = self.collect_reducer_targets(&options.update_queries);
            self.cache().perform_transaction(&mut |cache| {
                if let Some(data) = &exec.data {
                    if let Err(err) = cache.write(data, "ROOT_MUTATION", &entry.document, &variables)
                    {
                        tracing::warn!(mutation_id = %mutation_id, error = %err, "mutation result write failed");
                    }
                }

                for (name, document, vars, reducer) in &reducer_targets {
                    let diff = match cache.diff(document, vars, false, false) {
                        Ok(diff) => diff,
                        Err(err) => {
                            tracing::warn!(query = %name, error = %err, "update_queries read failed");
                            continue;
                        }
                    };
                    if !diff.complete {
                        continue;
                    }
                    match catch_unwind(AssertUnwindSafe(|| {
                        reducer(diff.result.as_ref(), &exec, vars)
                    })) {
                        Ok(Some(new_data)) => {
                            if let Err(err) = cache.write(&new_data, "ROOT_QUERY", document, vars) {
                                tracing::warn!(query = %name, error = %err, "update_queries write failed");
                            }
                        }
                        Ok(None) => {}
                        Err(_) => {
                            tracing::warn!(query = %name, "update_queries reducer panicked; its delta was skipped");
                        }
                    }
                }

                if let Some(update) = &options.update {
                    if catch_unwind(AssertUnwindSafe(|| update(cache, &exec))).is_err() {
                        tracing::warn!(mutation_id = %mutation_id, "mutation update callback panicked");
                    }
                }
            });
        }

        self.mutations().succeed(mutation_id);
        if optimistic_applied {
            self.cache().remove_optimistic(&mutation_id.to_string());
        }
        self.broadcast_queries();

        // Refetches run after settlement, as fresh network reads.
        let refetch = self.run_refetches(options.refetch_queries.clone());
        if options.await_refetch_queries {
            refetch.await;
        } else {
            tokio::spawn(refetch);
        }

        let mut result = exec;
        if options.error_policy == ErrorPolicy::Ignore {
            result.errors.clear();
        }
        Ok(result)
    }

    fn settle_failed(
        &self,
        mutation_id: MutationId,
        optimistic_applied: bool,
        err: ClientError,
    ) -> Result<ExecutionResult> {
        self.mutations().fail(mutation_id, err.to_string());
        if optimistic_applied {
            self.cache().remove_optimistic(&mutation_id.to_string());
        }
        self.broadcast_queries();
        Err(err)
    }

    /// Resolve `update_queries` names against the currently watched queries.
    #[allow(clippy::type_complexity)]
    fn collect_reducer_targets(
        &self,
        update_queries: &HashMap<String, MutationQueryReducer>,
    ) -> Vec<(String, Document, Variables, MutationQueryReducer)> {
        let mut targets = Vec::new();
        for (_, record) in self.queries().snapshot() {
            let rec = record.lock();
            if !rec.watched {
                continue;
            }
            let Some(name) = rec.document.name() else {
                continue;
            };
            if let Some(reducer) = update_queries.get(name) {
                targets.push((
                    name.to_string(),
                    rec.document.clone(),
                    rec.variables.clone(),
                    Arc::clone(reducer),
                ));
            }
        }
        targets
    }

    fn run_refetches(
        self: &Arc<Self>,
        targets: Vec<RefetchTarget>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let manager = Arc::clone(self);
        async move {
            for target in targets {
                match target {
                    RefetchTarget::Name(name) => {
                        let matching: Vec<_> = manager
                            .queries()
                            .snapshot()
                            .into_iter()
                            .filter_map(|(id, record)| {
                                let rec = record.lock();
                                (rec.watched && rec.document.name() == Some(name.as_str())).then(
                                    || {
                                        (
                                            id,
                                            FetchOptions {
                                                document: rec.document.clone(),
                                                variables: rec.variables.clone(),
                                                fetch_policy: FetchPolicy::NetworkOnly,
                                                error_policy: rec.error_policy,
                                                return_partial_data: false,
                                                notify_on_network_status_change: false,
                                                context: Value::Null,
                                                deduplicate: None,
                                            },
                                        )
                                    },
                                )
                            })
                            .collect();
                        for (id, fetch_options) in matching {
                            if let Err(err) = manager
                                .fetch_query(id, fetch_options, NetworkStatus::Refetch)
                                .await
                            {
                                tracing::warn!(query = %name, error = %err, "refetch after mutation failed");
                            }
                        }
                    }
                    RefetchTarget::Query {
                        document,
                        variables,
                    } => {
                        let mut query_options = QueryOptions::new(document);
                        query_options.variables = variables;
                        query_options.fetch_policy = FetchPolicy::NetworkOnly;
                        if let Err(err) = manager.query(query_options).await {
                            tracing::warn!(error = %err, "refetch after mutation failed");
                        }
                    }
                }
            }
        }
    }
}

/// Await the first emission (or failure) of a mutation's result stream.
async fn await_first_result(
    source: crate::observable::Observable<ExecutionResult>,
) -> Result<ExecutionResult> {
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

    let outcome = rx.await.unwrap_or(Err(ClientError::Stopped));
    sub.unsubscribe();
    outcome
}
