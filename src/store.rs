//! Cache collaborator boundary.
//!
//! The normalized cache itself (diffing, record storage, optimistic layers)
//! lives outside this crate; the core only drives it through this trait.
//! Transactions are assumed atomic with respect to the cache's own readers.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{Diff, Document, Variables};

/// Write-through interface to the external normalized cache.
///
/// `perform_transaction` and `record_optimistic_transaction` hand the
/// closure a cache view so batched writes (mutation result + reducer
/// deltas) land atomically. Optimistic transactions are tagged with the
/// mutation id so `remove_optimistic` can roll back precisely one layer.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read `query` against the cache. `return_partial` asks for whatever
    /// is present even when incomplete; `optimistic` includes optimistic
    /// layers in the read.
    fn diff(
        &self,
        query: &Document,
        variables: &Variables,
        return_partial: bool,
        optimistic: bool,
    ) -> Result<Diff>;

    /// Write `data` for `query` under the record identified by `data_id`.
    fn write(
        &self,
        data: &Value,
        data_id: &str,
        query: &Document,
        variables: &Variables,
    ) -> Result<()>;

    /// Run `f` as one atomic batch of writes.
    fn perform_transaction(&self, f: &mut dyn FnMut(&dyn Cache));

    /// Run `f` as an optimistic (rollback-capable) layer tagged `id`.
    fn record_optimistic_transaction(&self, f: &mut dyn FnMut(&dyn Cache), id: &str);

    /// Remove the optimistic layer tagged `id`. No-op for unknown ids.
    fn remove_optimistic(&self, id: &str);

    /// Drop all cached data.
    async fn reset(&self) -> Result<()>;

    /// Normalize a document into the cache's canonical form.
    fn transform_document(&self, document: &Document) -> Document;

    /// Additional transform applied to documents bound for the link.
    fn transform_for_link(&self, document: &Document) -> Document;
}
