//! Local-resolver collaborator boundary.
//!
//! Client-only fields (`@client`) and exported variables (`@export`) are
//! resolved by an external engine. The core only needs to split documents,
//! schedule exported-variable resolution before a network read, and map
//! remote results through the resolver engine when a client split exists.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{Document, ExecutionResult, Variables};

/// Interface to the external local-resolver engine.
#[async_trait]
pub trait LocalResolvers: Send + Sync {
    /// The client-only sub-document, or `None` when the document has no
    /// client-bound fields.
    fn client_query(&self, document: &Document) -> Option<Document>;

    /// The server-bound sub-document, or `None` when every field is local.
    fn server_query(&self, document: &Document) -> Option<Document>;

    /// Whether local resolvers must run for this document even when it has
    /// no client-only fields.
    fn should_force_resolvers(&self, document: &Document) -> bool;

    /// Whether the document exports computed variables that must be
    /// resolved client-side before the network request is built.
    fn has_exported_variables(&self, document: &Document) -> bool;

    /// Resolve exported variables into the variable set.
    async fn add_exported_variables(
        &self,
        document: &Document,
        variables: &Variables,
        context: &Value,
    ) -> Result<Variables>;

    /// Run local resolvers over a remote result, producing the fully
    /// resolved result callers observe.
    async fn run_resolvers(
        &self,
        document: &Document,
        remote_result: ExecutionResult,
        context: &Value,
        variables: &Variables,
    ) -> Result<ExecutionResult>;

    /// Enrich the operation context before it reaches the link.
    fn prepare_context(&self, context: Value) -> Value;
}

/// Resolver engine for configurations without client-only fields: every
/// document is fully server-bound and results pass through untouched.
#[derive(Debug, Default)]
pub struct NoopResolvers;

#[async_trait]
impl LocalResolvers for NoopResolvers {
    fn client_query(&self, _document: &Document) -> Option<Document> {
        None
    }

    fn server_query(&self, document: &Document) -> Option<Document> {
        Some(document.clone())
    }

    fn should_force_resolvers(&self, _document: &Document) -> bool {
        false
    }

    fn has_exported_variables(&self, _document: &Document) -> bool {
        false
    }

    async fn add_exported_variables(
        &self,
        _document: &Document,
        variables: &Variables,
        _context: &Value,
    ) -> Result<Variables> {
        Ok(variables.clone())
    }

    async fn run_resolvers(
        &self,
        _document: &Document,
        remote_result: ExecutionResult,
        _context: &Value,
        _variables: &Variables,
    ) -> Result<ExecutionResult> {
        Ok(remote_result)
    }

    fn prepare_context(&self, context: Value) -> Value {
        context
    }
}
