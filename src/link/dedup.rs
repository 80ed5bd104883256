//! In-flight request deduplication.
//!
//! Concurrent identical (server document, serialized variables) requests
//! share one transport call: the first request registers a multicast stream
//! under the request key, later requests attach to it, and the registry
//! entry prunes itself as soon as the stream has no more interested parties
//! (early detach or settlement). Registration and pruning both happen
//! synchronously under the registry lock, so two activations cannot race to
//! create two entries for one key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::observable::{Emitter, Observable, Observer, SharedObservable};
use crate::resolvers::LocalResolvers;
use crate::types::{Document, DocumentId, ExecutionResult, Variables};

/// Key for one deduplicatable request.
pub(crate) type RequestKey = (DocumentId, String);

/// Registry of shared in-flight network streams.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Arc<Mutex<HashMap<RequestKey, SharedObservable<ExecutionResult>>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the shared stream for `key`, creating it from `source` when
    /// absent. The created entry removes itself once idle.
    pub(crate) fn shared(
        &self,
        key: RequestKey,
        source: Observable<ExecutionResult>,
    ) -> SharedObservable<ExecutionResult> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }

        let prune_entries = Arc::clone(&self.entries);
        let prune_key = key.clone();
        let shared = SharedObservable::new(
            source,
            Some(Box::new(move || {
                prune_entries.lock().remove(&prune_key);
            })),
        );
        entries.insert(key, shared.clone());
        shared
    }

    /// Number of currently registered in-flight keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// Local-resolver stream mapping
// ============================================================================

/// Map every emission of `source` through the resolver engine, preserving
/// emission order (a worker task processes the queue sequentially).
///
/// Subscribing to the returned observable requires a tokio runtime.
pub(crate) fn map_through_resolvers(
    source: Observable<ExecutionResult>,
    resolvers: Arc<dyn LocalResolvers>,
    document: Document,
    context: Value,
    variables: Variables,
) -> Observable<ExecutionResult> {
    enum Item {
        Next(ExecutionResult),
        Failed(crate::error::ClientError),
        Done,
    }

    Observable::new(move |emitter: Emitter<ExecutionResult>| {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Item>();

        let next_tx = tx.clone();
        let err_tx = tx.clone();
        let done_tx = tx;
        let sub = source.subscribe(
            Observer::new()
                .on_next(move |result| {
                    let _ = next_tx.send(Item::Next(result));
                })
                .on_error(move |err| {
                    let _ = err_tx.send(Item::Failed(err));
                })
                .on_complete(move || {
                    let _ = done_tx.send(Item::Done);
                }),
        );

        let resolvers = Arc::clone(&resolvers);
        let document = document.clone();
        let context = context.clone();
        let variables = variables.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Item::Next(remote) => {
                        match resolvers
                            .run_resolvers(&document, remote, &context, &variables)
                            .await
                        {
                            Ok(resolved) => emitter.next(resolved),
                            Err(err) => {
                                emitter.error(err);
                                return;
                            }
                        }
                    }
                    Item::Failed(err) => {
                        emitter.error(err);
                        return;
                    }
                    Item::Done => {
                        emitter.complete();
                        return;
                    }
                }
            }
        });

        Some(Box::new(move || {
            sub.unsubscribe();
            worker.abort();
        }))
    })
}

// ============================================================================
// Tests
// ============================================================================
