//! Query/mutation orchestration core for a cache-backed GraphQL client.
//!
//! Given a declarative operation (query, mutation, or subscription) plus a
//! fetch policy, the [`QueryManager`] decides whether to serve data from the
//! normalized cache, issue a network request through the link, or both, and
//! reconciles results back into the cache while keeping every observer of
//! overlapping data consistent. Superseded requests are dropped, identical
//! in-flight requests share one transport call, and mutations support
//! optimistic, rollback-capable writes.
//!
//! The cache, the link chain, and the local-resolver engine are external
//! collaborators, injected through the [`store::Cache`], [`link::Link`],
//! and [`resolvers::LocalResolvers`] traits.

pub mod cancel;
pub mod error;
pub mod link;
pub mod manager;
pub mod mutation;
pub mod observable;
pub mod query;
pub mod resolvers;
pub mod store;
pub mod transform;
pub mod types;

pub use error::{ClientError, GraphQlError, Result, UsageError};
pub use link::{Link, Operation};
pub use manager::{QueryManager, QueryManagerOptions, QueryOptions, SubscriptionOptions};
pub use mutation::{
    MutationOptions, MutationOutcome, MutationQueryReducer, MutationRecord, MutationUpdateFn,
    OptimisticResponse, RefetchTarget,
};
pub use observable::{Emitter, Observable, Observer, SharedObservable, Subscription, Teardown};
pub use query::{Unsubscribe, WatchQueryOptions, WatchedQuery};
pub use resolvers::{LocalResolvers, NoopResolvers};
pub use store::Cache;
pub use transform::{TransformCache, TransformEntry};
pub use types::{
    merge_variables, variables_key, Diff, Document, DocumentId, ErrorPolicy, ExecutionResult,
    FetchPolicy, MutationId, NetworkStatus, OperationKind, QueryId, QueryResult, Variables,
};
