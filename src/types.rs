//! Core data types shared across the crate: opaque ids, the [`Document`]
//! handle, fetch/error policies, network status, and result shapes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::GraphQlError;

// ============================================================================
// Opaque ids
// ============================================================================

/// Identity of one registered query. Generated by the manager; records live
/// in an arena-style table keyed by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub(crate) u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Identity of one mutation invocation. Also used to tag (and precisely
/// roll back) the mutation's optimistic cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub(crate) u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Stable identity of one parsed document, assigned at construction.
///
/// Equality of documents is equality of ids — the transform cache and the
/// dedup registry key on this, never on pointer identity or deep equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Document
// ============================================================================

/// Which kind of operation a document declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

/// An opaque handle to a parsed GraphQL operation.
///
/// Parsing and validation happen outside this crate; the core only needs the
/// operation kind, an optional operation name, the source body (passed
/// through to the transport), and the declared default variable values.
/// Documents are cheap to clone (the body is shared) and compare by
/// [`DocumentId`].
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    kind: OperationKind,
    name: Option<String>,
    body: Arc<str>,
    default_variables: Variables,
}

impl Document {
    pub fn new(kind: OperationKind, name: Option<&str>, body: &str) -> Self {
        Self {
            id: DocumentId(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            name: name.map(str::to_string),
            body: Arc::from(body),
            default_variables: Variables::new(),
        }
    }

    pub fn query(name: &str, body: &str) -> Self {
        Self::new(OperationKind::Query, Some(name), body)
    }

    pub fn mutation(name: &str, body: &str) -> Self {
        Self::new(OperationKind::Mutation, Some(name), body)
    }

    pub fn subscription(name: &str, body: &str) -> Self {
        Self::new(OperationKind::Subscription, Some(name), body)
    }

    /// Attach declared default variable values (`query Q($limit: Int = 10)`).
    pub fn with_default_variables(mut self, defaults: Variables) -> Self {
        self.default_variables = defaults;
        self
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn default_variables(&self) -> &Variables {
        &self.default_variables
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ============================================================================
// Variables
// ============================================================================

/// Operation variables. `serde_json::Map` is BTreeMap-backed, so
/// serialization order is canonical — the dedup registry relies on this.
pub type Variables = serde_json::Map<String, Value>;

/// Merge caller-supplied variables over a document's declared defaults.
/// Caller values win; defaults fill the gaps.
pub fn merge_variables(defaults: &Variables, caller: &Variables) -> Variables {
    let mut merged = defaults.clone();
    for (k, v) in caller {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Canonical string form of a variable set, for use in dedup keys.
pub fn variables_key(variables: &Variables) -> String {
    serde_json::to_string(variables).unwrap_or_default()
}

// ============================================================================
// Policies
// ============================================================================

/// Strategy governing cache vs network usage for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Serve from cache when complete; otherwise fetch.
    #[default]
    CacheFirst,
    /// Emit the cache value (if useful), then always fetch. Downgrades to
    /// `CacheFirst` after the first activation of a handle.
    CacheAndNetwork,
    /// Serve from cache only, however incomplete. Never fetches.
    CacheOnly,
    /// Always fetch; the result still updates the cache.
    NetworkOnly,
    /// Always fetch; the result is never written to the shared cache.
    NoCache,
    /// Inert — no emission, no traffic, until re-activated differently.
    Standby,
}

impl FetchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheAndNetwork => "cache-and-network",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::NoCache => "no-cache",
            Self::Standby => "standby",
        }
    }

    /// Whether broadcasts should read this query's value from the cache.
    pub(crate) fn reads_cache(self) -> bool {
        !matches!(self, Self::NoCache)
    }
}

/// How GraphQL errors inside a successful transport response are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Any GraphQL error fails the operation; nothing is written.
    #[default]
    None,
    /// Errors are suppressed from the emitted value; data is still written.
    Ignore,
    /// Data and errors are surfaced together.
    All,
}

// ============================================================================
// NetworkStatus
// ============================================================================

/// Lifecycle status of a query's network activity, visible on every
/// emitted [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Registered but never activated.
    Idle,
    /// First fetch in flight.
    Loading,
    /// Refetch triggered by a variables change.
    SetVariables,
    /// Explicit refetch in flight.
    Refetch,
    /// Poll-triggered fetch in flight.
    Poll,
    /// Settled with usable data.
    Ready,
    /// Settled with an error.
    Error,
}

impl NetworkStatus {
    /// Whether a request is currently in flight for this status.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Loading | Self::SetVariables | Self::Refetch | Self::Poll
        )
    }
}

// ============================================================================
// Results
// ============================================================================

/// One emission from the transport (or from local resolution): GraphQL
/// `data` plus any response-level errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    pub errors: Vec<GraphQlError>,
    pub extensions: Option<Value>,
}

impl ExecutionResult {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// The single emission an all-local document short-circuits to.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A cache read paired with a completeness flag and missing field paths.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub result: Option<Value>,
    pub complete: bool,
    pub missing: Vec<String>,
}

/// The value delivered to query listeners and resolved from `query()`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Option<Value>,
    pub errors: Vec<GraphQlError>,
    pub loading: bool,
    pub network_status: NetworkStatus,
    /// True when the data came from an incomplete cache read.
    pub partial: bool,
}

impl QueryResult {
    pub(crate) fn loading(data: Option<Value>, status: NetworkStatus, partial: bool) -> Self {
        Self {
            data,
            errors: Vec::new(),
            loading: true,
            network_status: status,
            partial,
        }
    }

    pub(crate) fn ready(data: Option<Value>, errors: Vec<GraphQlError>, partial: bool) -> Self {
        Self {
            data,
            errors,
            loading: false,
            network_status: NetworkStatus::Ready,
            partial,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
