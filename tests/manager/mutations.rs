//! Mutation pipeline: optimistic layers, transactional commit, reducers,
//! refetches, and error policies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};

use graph_client::{
    ClientError, Document, ErrorPolicy, ExecutionResult, FetchPolicy, GraphQlError,
    MutationOptions, MutationOutcome, MutationQueryReducer, OptimisticResponse, QueryResult,
    RefetchTarget, WatchQueryOptions,
};

use super::support::{manager_with, settle, vars, MockCache, MockLink};

fn mutation_doc() -> Document {
    Document::mutation("SaveName", "mutation SaveName($name: String!) { save(name: $name) { name } }")
}

fn todos_doc() -> Document {
    Document::query("Todos", "query Todos { todos }")
}

// ============================================================================
// Optimistic flow
// ============================================================================

#[tokio::test]
async fn optimistic_value_visible_mid_flight_then_replaced_by_server_result() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let document = mutation_doc();
    let variables = vars(&[("name", json!("draft"))]);

    let mutation = {
        let manager = manager.clone();
        let mut options = MutationOptions::new(document.clone());
        options.variables = variables.clone();
        options.optimistic_response =
            Some(OptimisticResponse::Value(json!({"save": {"name": "draft"}})));
        tokio::spawn(async move { manager.mutate(options).await })
    };
    settle().await;

    // Mid-flight: the optimistic layer answers optimistic reads.
    assert_eq!(cache.optimistic_layer_count(), 1);
    assert_eq!(
        cache.optimistic_data(&document, &variables),
        Some(json!({"save": {"name": "draft"}}))
    );
    assert_eq!(
        cache.base_data(&document, &variables),
        None,
        "optimistic write must not touch the base layer"
    );

    link.resolve_pending(0, ExecutionResult::data(json!({"save": {"name": "final"}})));
    let result = mutation.await.unwrap().unwrap();
    assert_eq!(result.data, Some(json!({"save": {"name": "final"}})));

    // Post-settlement: optimistic layer removed, real result committed.
    assert_eq!(cache.optimistic_layer_count(), 0);
    assert_eq!(
        cache.base_data(&document, &variables),
        Some(json!({"save": {"name": "final"}}))
    );
}

#[tokio::test]
async fn failed_mutation_rolls_back_the_optimistic_layer() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let document = mutation_doc();
    let variables = vars(&[("name", json!("draft"))]);

    let mutation = {
        let manager = manager.clone();
        let mut options = MutationOptions::new(document.clone());
        options.variables = variables.clone();
        options.optimistic_response =
            Some(OptimisticResponse::Value(json!({"save": {"name": "draft"}})));
        tokio::spawn(async move { manager.mutate(options).await })
    };
    settle().await;
    assert_eq!(cache.optimistic_layer_count(), 1);

    link.fail_pending(0, ClientError::network("connection reset"));
    let err = mutation.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Network { .. }));

    assert_eq!(cache.optimistic_layer_count(), 0, "layer rolled back");
    assert_eq!(
        cache.base_data(&document, &variables),
        None,
        "failure leaves the cache at its pre-mutation state"
    );

    let records = manager.mutation_records();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].1.outcome, MutationOutcome::Failed(_)));
}

#[tokio::test]
async fn optimistic_response_computed_from_variables() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let document = mutation_doc();
    let variables = vars(&[("name", json!("typed"))]);

    let mutation = {
        let manager = manager.clone();
        let mut options = MutationOptions::new(document.clone());
        options.variables = variables.clone();
        options.optimistic_response = Some(OptimisticResponse::Compute(Arc::new(
            |variables: &graph_client::Variables| {
                json!({"save": {"name": variables.get("name").cloned().unwrap_or(Value::Null)}})
            },
        )));
        tokio::spawn(async move { manager.mutate(options).await })
    };
    settle().await;

    assert_eq!(
        cache.optimistic_data(&document, &variables),
        Some(json!({"save": {"name": "typed"}}))
    );

    link.resolve_pending(0, ExecutionResult::data(json!({"save": {"name": "typed"}})));
    mutation.await.unwrap().unwrap();
}

// ============================================================================
// update_queries / update callback
// ============================================================================

#[tokio::test]
async fn update_queries_reducer_writes_delta_for_named_query() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"save": "x"}))));
    let manager = manager_with(&cache, &link, true);

    let query = todos_doc();
    cache.prime(&query, &vars(&[]), json!({"todos": ["a"]}));
    let handle = manager
        .watch_query(WatchQueryOptions::new(query.clone()))
        .unwrap();
    let seen: Arc<StdMutex<Vec<QueryResult>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _unsub = handle.subscribe(
        Arc::new(move |result: &QueryResult| {
            sink.lock().unwrap().push(result.clone());
        }),
        None,
    );

    let reducer: MutationQueryReducer = Arc::new(
        |current: Option<&Value>,
         mutation_result: &ExecutionResult,
         _vars: &graph_client::Variables| {
            let mut todos = current
                .and_then(|v| v.get("todos"))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if let Some(item) = mutation_result.data.as_ref().and_then(|d| d.get("save")) {
                todos.push(item.clone());
            }
            Some(json!({"todos": todos}))
        },
    );

    let mut update_queries = HashMap::new();
    update_queries.insert("Todos".to_string(), reducer);
    let mut options = MutationOptions::new(mutation_doc());
    options.update_queries = update_queries;
    manager.mutate(options).await.unwrap();

    assert_eq!(
        cache.base_data(&query, &vars(&[])),
        Some(json!({"todos": ["a", "x"]})),
        "reducer delta written back for the named query"
    );
    let emissions = seen.lock().unwrap();
    assert!(
        emissions
            .iter()
            .any(|r| r.data == Some(json!({"todos": ["a", "x"]}))),
        "watcher notified of the reduced value: {emissions:?}"
    );
}

#[tokio::test]
async fn panicking_reducer_is_isolated_from_the_transaction() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"save": "x"}))));
    let manager = manager_with(&cache, &link, true);

    let query = todos_doc();
    cache.prime(&query, &vars(&[]), json!({"todos": []}));
    let _handle = manager
        .watch_query(WatchQueryOptions::new(query.clone()))
        .unwrap();

    let reducer: MutationQueryReducer = Arc::new(
        |_: Option<&Value>, _: &ExecutionResult, _: &graph_client::Variables| {
            panic!("bad reducer")
        },
    );
    let mut update_queries = HashMap::new();
    update_queries.insert("Todos".to_string(), reducer);
    let mut options = MutationOptions::new(mutation_doc());
    options.update_queries = update_queries;

    let result = manager.mutate(options).await;
    assert!(result.is_ok(), "a faulty reducer must not fail the mutation");

    // The mutation result itself still committed.
    assert!(cache
        .writes()
        .iter()
        .any(|w| w.data_id == "ROOT_MUTATION" && w.data == json!({"save": "x"})));
}

#[tokio::test]
async fn update_callback_runs_inside_the_commit() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"save": "x"}))));
    let manager = manager_with(&cache, &link, true);

    let marker = todos_doc();
    let marker_clone = marker.clone();
    let mut options = MutationOptions::new(mutation_doc());
    options.update = Some(Arc::new(move |cache: &dyn graph_client::Cache,
                                         result: &ExecutionResult| {
        let data = result.data.clone().unwrap_or(Value::Null);
        let _ = cache.write(
            &json!({"merged": data}),
            "ROOT_QUERY",
            &marker_clone,
            &graph_client::Variables::new(),
        );
    }));
    manager.mutate(options).await.unwrap();

    assert_eq!(
        cache.base_data(&marker, &vars(&[])),
        Some(json!({"merged": {"save": "x"}}))
    );
}

// ============================================================================
// Refetches
// ============================================================================

#[tokio::test]
async fn refetch_by_name_reissues_watched_query() {
    let cache = MockCache::new();
    let link = MockLink::auto(|operation| {
        Ok(ExecutionResult::data(
            match operation.operation_name.as_deref() {
                Some("Todos") => json!({"todos": ["fresh"]}),
                _ => json!({"save": "x"}),
            },
        ))
    });
    let manager = manager_with(&cache, &link, true);

    let handle = manager
        .watch_query(WatchQueryOptions::new(todos_doc()))
        .unwrap();
    handle.activate().await.unwrap();
    assert_eq!(link.call_count(), 1);

    let mut options = MutationOptions::new(mutation_doc());
    options.refetch_queries = vec![RefetchTarget::Name("Todos".to_string())];
    options.await_refetch_queries = true;
    manager.mutate(options).await.unwrap();

    assert_eq!(link.call_count(), 3, "mutation plus one refetch");
    assert_eq!(
        handle.current_result().data,
        Some(json!({"todos": ["fresh"]}))
    );
}

#[tokio::test]
async fn explicit_refetch_target_runs_as_fresh_query() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"todos": []}))));
    let manager = manager_with(&cache, &link, true);

    let mut options = MutationOptions::new(mutation_doc());
    options.refetch_queries = vec![RefetchTarget::Query {
        document: todos_doc(),
        variables: vars(&[]),
    }];
    options.await_refetch_queries = true;
    manager.mutate(options).await.unwrap();

    assert_eq!(link.call_count(), 2);
    assert_eq!(manager.query_count(), 0, "fresh refetch query cleaned up");
}

// ============================================================================
// Validation and error policies
// ============================================================================

#[tokio::test]
async fn mutate_rejects_bad_options() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let err = manager
        .mutate(MutationOptions::new(todos_doc()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Usage(_)), "query doc: {err}");

    let mut options = MutationOptions::new(mutation_doc());
    options.fetch_policy = Some(FetchPolicy::CacheFirst);
    let err = manager.mutate(options).await.unwrap_err();
    assert!(matches!(err, ClientError::Usage(_)), "bad policy: {err}");

    assert_eq!(link.call_count(), 0);
}

#[tokio::test]
async fn no_cache_mutation_skips_the_commit() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"save": "x"}))));
    let manager = manager_with(&cache, &link, true);

    let mut options = MutationOptions::new(mutation_doc());
    options.fetch_policy = Some(FetchPolicy::NoCache);
    let result = manager.mutate(options).await.unwrap();

    assert_eq!(result.data, Some(json!({"save": "x"})));
    assert!(cache.writes().is_empty());
}

#[tokio::test]
async fn graphql_errors_fail_mutation_under_policy_none() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| {
        Ok(ExecutionResult {
            data: Some(json!({"save": "x"})),
            errors: vec![GraphQlError::new("denied")],
            extensions: None,
        })
    });
    let manager = manager_with(&cache, &link, true);

    let mut options = MutationOptions::new(mutation_doc());
    options.optimistic_response = Some(OptimisticResponse::Value(json!({"save": "draft"})));
    let err = manager.mutate(options).await.unwrap_err();

    assert!(matches!(err, ClientError::GraphQl(_)));
    let writes = cache.writes();
    assert_eq!(writes.len(), 1, "only the optimistic write happened");
    assert_eq!(writes[0].data, json!({"save": "draft"}));
    assert_eq!(cache.optimistic_layer_count(), 0, "and it was rolled back");
}

#[tokio::test]
async fn graphql_errors_ignored_policy_commits_and_strips() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| {
        Ok(ExecutionResult {
            data: Some(json!({"save": "x"})),
            errors: vec![GraphQlError::new("partial failure")],
            extensions: None,
        })
    });
    let manager = manager_with(&cache, &link, true);

    let mut options = MutationOptions::new(mutation_doc());
    options.error_policy = ErrorPolicy::Ignore;
    let result = manager.mutate(options).await.unwrap();

    assert!(result.errors.is_empty(), "ignore strips surfaced errors");
    assert!(cache
        .writes()
        .iter()
        .any(|w| w.data_id == "ROOT_MUTATION"));
}

#[tokio::test]
async fn mutation_store_tracks_outcomes() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"save": "x"}))));
    let manager = manager_with(&cache, &link, true);

    manager.mutate(MutationOptions::new(mutation_doc())).await.unwrap();
    let records = manager.mutation_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.outcome, MutationOutcome::Succeeded);

    manager.clear_store().await.unwrap();
    assert_eq!(manager.mutation_count(), 0, "reset clears bookkeeping");
}
