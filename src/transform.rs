//! TransformCache — memoized per-document derived artifacts.
//!
//! The first `transform` call for a document identity computes the
//! cache-normalized form, the client/server splits, the resolver flags, and
//! the default variable values, then registers the entry under every
//! identity that could plausibly be passed back in (the original, the
//! transformed form, and both splits). Entries are immutable; a registered
//! identity is never recomputed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::resolvers::LocalResolvers;
use crate::store::Cache;
use crate::types::{Document, DocumentId, Variables};

/// Derived, memoized facts about one document.
#[derive(Debug)]
pub struct TransformEntry {
    /// The cache-normalized document; the form used for diffs and writes.
    pub document: Document,
    /// Client-only sub-document, when client-bound fields exist.
    pub client_query: Option<Document>,
    /// Server-bound sub-document, when any field reaches the transport.
    pub server_query: Option<Document>,
    /// Whether exported variables must be resolved before a network read.
    pub has_client_exports: bool,
    /// Whether local resolvers run even without client-only fields.
    pub forced_resolvers: bool,
    /// Declared default variable values.
    pub default_variables: Variables,
}

#[derive(Default)]
pub struct TransformCache {
    entries: Mutex<HashMap<DocumentId, Arc<TransformEntry>>>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or compute the entry for `document`.
    pub fn transform(
        &self,
        document: &Document,
        cache: &dyn Cache,
        resolvers: &dyn LocalResolvers,
    ) -> Arc<TransformEntry> {
        if let Some(entry) = self.entries.lock().get(&document.id()) {
            return Arc::clone(entry);
        }

        // Collaborator calls happen outside the lock; a concurrent first
        // call for the same identity is settled by or_insert below.
        let transformed = cache.transform_document(document);
        let client_query = resolvers.client_query(&transformed);
        let server_query = resolvers
            .server_query(&transformed)
            .map(|doc| cache.transform_for_link(&doc));
        let entry = Arc::new(TransformEntry {
            has_client_exports: resolvers.has_exported_variables(&transformed),
            forced_resolvers: resolvers.should_force_resolvers(&transformed),
            default_variables: transformed.default_variables().clone(),
            client_query,
            server_query,
            document: transformed,
        });

        let mut entries = self.entries.lock();
        let entry = Arc::clone(
            entries
                .entry(document.id())
                .or_insert_with(|| Arc::clone(&entry)),
        );
        for id in [
            Some(entry.document.id()),
            entry.client_query.as_ref().map(Document::id),
            entry.server_query.as_ref().map(Document::id),
        ]
        .into_iter()
        .flatten()
        {
            entries.entry(id).or_insert_with(|| Arc::clone(&entry));
        }
        entry
    }

    /// Number of registered identities (not distinct entries).
    pub fn identity_count(&self) -> usize {
        self.entries.lock().len()
    }
}
