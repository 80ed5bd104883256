//! Link (transport) collaborator boundary and the in-flight deduplication
//! registry.
//!
//! # Modules
//!
//! - [`dedup`] — [`InFlightRegistry`] and local-resolver stream mapping.

pub mod dedup;

pub use dedup::InFlightRegistry;

use serde_json::Value;

use crate::observable::Observable;
use crate::types::{Document, ExecutionResult, Variables};

/// One transport request: the server-bound document plus everything the
/// link chain needs to execute it.
#[derive(Debug, Clone)]
pub struct Operation {
    pub query: Document,
    pub variables: Variables,
    pub operation_name: Option<String>,
    pub context: Value,
}

/// The transport chain. `execute` returns a cold stream — no network work
/// happens until the stream is subscribed. Queries and mutations emit one
/// result and complete; subscriptions may emit indefinitely.
pub trait Link: Send + Sync {
    fn execute(&self, operation: Operation) -> Observable<ExecutionResult>;
}
