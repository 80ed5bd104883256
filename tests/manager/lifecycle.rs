//! Store reset, manager stop, polling, and variable changes.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;

use graph_client::{
    ClientError, Document, ExecutionResult, FetchPolicy, NetworkStatus, QueryOptions, QueryResult,
    WatchQueryOptions,
};

use super::support::{manager_with, settle, vars, MockCache, MockLink};

fn doc() -> Document {
    Document::query("Inbox", "query Inbox { inbox { id } }")
}

// ============================================================================
// clear_store / reset_store
// ============================================================================

#[tokio::test]
async fn clear_store_aborts_in_flight_and_never_applies_the_result() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let pending_query = {
        let manager = manager.clone();
        let mut options = QueryOptions::new(doc());
        options.fetch_policy = FetchPolicy::NetworkOnly;
        tokio::spawn(async move { manager.query(options).await })
    };
    settle().await;
    assert_eq!(link.call_count(), 1);

    manager.clear_store().await.unwrap();

    let err = pending_query.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::StoreReset);

    // The transport call completes late anyway; nothing may be applied.
    link.resolve_pending(0, ExecutionResult::data(json!({"inbox": [1]})));
    settle().await;
    assert!(cache.writes().is_empty(), "aborted fetch must not write");
    assert_eq!(cache.reset_count(), 1);
}

#[tokio::test]
async fn clear_store_keeps_watched_queries_as_loading_and_stops_unwatched() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": []}))));
    let manager = manager_with(&cache, &link, true);

    let handle = manager.watch_query(WatchQueryOptions::new(doc())).unwrap();
    handle.activate().await.unwrap();
    assert_eq!(handle.current_result().network_status, NetworkStatus::Ready);
    assert_eq!(manager.query_count(), 1);

    manager.clear_store().await.unwrap();

    assert_eq!(manager.query_count(), 1, "watched record survives");
    let current = handle.current_result();
    assert!(current.loading, "watched record resets to loading");
}

#[tokio::test]
async fn reset_store_refetches_watched_queries() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": [9]}))));
    let manager = manager_with(&cache, &link, true);

    let handle = manager.watch_query(WatchQueryOptions::new(doc())).unwrap();
    handle.activate().await.unwrap();
    assert_eq!(link.call_count(), 1);

    let results = manager.reset_store().await.unwrap();

    assert_eq!(cache.reset_count(), 1);
    assert_eq!(link.call_count(), 2, "watched query refetched after reset");
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(handle.current_result().network_status, NetworkStatus::Ready);
}

#[tokio::test]
async fn reset_store_skips_cache_only_queries() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": []}))));
    let manager = manager_with(&cache, &link, true);

    let mut options = WatchQueryOptions::new(doc());
    options.fetch_policy = FetchPolicy::CacheOnly;
    let handle = manager.watch_query(options).unwrap();
    handle.activate().await.unwrap();

    let results = manager.reset_store().await.unwrap();
    assert!(results.is_empty());
    assert_eq!(link.call_count(), 0);
}

// ============================================================================
// stop
// ============================================================================

#[tokio::test]
async fn stop_rejects_in_flight_work_and_new_registrations() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let pending_query = {
        let manager = manager.clone();
        let mut options = QueryOptions::new(doc());
        options.fetch_policy = FetchPolicy::NetworkOnly;
        tokio::spawn(async move { manager.query(options).await })
    };
    settle().await;

    manager.stop();

    let err = pending_query.await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::Stopped);
    assert_eq!(manager.query_count(), 0);

    let err = manager.watch_query(WatchQueryOptions::new(doc())).unwrap_err();
    assert_eq!(err, ClientError::Stopped);
}

#[tokio::test]
async fn one_shot_query_cleans_up_its_record() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": []}))));
    let manager = manager_with(&cache, &link, true);

    let mut options = QueryOptions::new(doc());
    options.fetch_policy = FetchPolicy::NetworkOnly;
    manager.query(options).await.unwrap();

    assert_eq!(manager.query_count(), 0, "one-shot record removed on settle");
}

// ============================================================================
// Polling
// ============================================================================

#[tokio::test]
async fn polling_issues_repeated_fetches_until_stopped() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": []}))));
    let manager = manager_with(&cache, &link, true);

    let mut options = WatchQueryOptions::new(doc());
    options.fetch_policy = FetchPolicy::NetworkOnly;
    options.poll_interval = Some(Duration::from_millis(30));
    let handle = manager.watch_query(options).unwrap();

    handle.activate().await.unwrap();
    tokio::time::sleep(Duration::from_millis(110)).await;

    let polled = link.call_count();
    assert!(polled >= 3, "expected repeated poll fetches, saw {polled}");

    handle.stop_polling();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(link.call_count(), polled, "no fetches after stop_polling");
}

// ============================================================================
// set_variables
// ============================================================================

#[tokio::test]
async fn set_variables_noop_when_unchanged_and_refetches_when_changed() {
    let cache = MockCache::new();
    let link = MockLink::auto(|operation| {
        let limit = operation
            .variables
            .get("limit")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(ExecutionResult::data(json!({"inbox": [limit]})))
    });
    let manager = manager_with(&cache, &link, true);

    let document = Document::query("Inbox", "query Inbox($limit: Int = 10) { inbox(limit: $limit) }")
        .with_default_variables(vars(&[("limit", json!(10))]));
    let handle = manager.watch_query(WatchQueryOptions::new(document)).unwrap();
    handle.activate().await.unwrap();
    assert_eq!(link.call_count(), 1);

    // Unchanged (matches the merged defaults): no fetch.
    let unchanged = handle.set_variables(vars(&[("limit", json!(10))])).await.unwrap();
    assert!(unchanged.is_none());
    assert_eq!(link.call_count(), 1);

    // Changed: fetch under the effective policy.
    let changed = handle
        .set_variables(vars(&[("limit", json!(25))]))
        .await
        .unwrap()
        .expect("changed variables refetch");
    assert_eq!(link.call_count(), 2);
    assert_eq!(changed.data, Some(json!({"inbox": [25]})));
}

// ============================================================================
// Error surfacing
// ============================================================================

#[tokio::test]
async fn network_failure_surfaces_on_listeners_and_record_fields() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let handle = manager.watch_query(WatchQueryOptions::new(doc())).unwrap();
    let errors: Arc<StdMutex<Vec<ClientError>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let _unsub = handle.subscribe(
        Arc::new(|_: &QueryResult| {}),
        Some(Arc::new(move |err: &ClientError| {
            sink.lock().unwrap().push(err.clone());
        })),
    );

    let activation = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.activate().await })
    };
    settle().await;
    link.fail_pending(0, ClientError::network("gateway down"));

    let err = activation.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Network { .. }));
    assert_eq!(errors.lock().unwrap().len(), 1, "error listener notified");
    assert_eq!(
        handle.current_result().network_status,
        NetworkStatus::Error
    );
    assert!(matches!(
        handle.last_error(),
        Some(ClientError::Network { .. })
    ));
}

// ============================================================================
// Broadcast reach
// ============================================================================

#[tokio::test]
async fn write_through_one_query_notifies_overlapping_watcher() {
    let cache = MockCache::new();
    let link = MockLink::auto(|_| Ok(ExecutionResult::data(json!({"inbox": ["fresh"]}))));
    let manager = manager_with(&cache, &link, true);

    // Two watchers over the same document identity and variables observe
    // the same cache entry.
    let document = doc();
    let watcher = manager
        .watch_query(WatchQueryOptions::new(document.clone()))
        .unwrap();
    let seen: Arc<StdMutex<Vec<QueryResult>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _unsub = watcher.subscribe(
        Arc::new(move |result: &QueryResult| {
            sink.lock().unwrap().push(result.clone());
        }),
        None,
    );

    let fetcher = manager
        .watch_query(WatchQueryOptions::new(document))
        .unwrap();
    fetcher.activate().await.unwrap();

    let emissions = seen.lock().unwrap();
    assert!(
        emissions
            .iter()
            .any(|r| r.data == Some(json!({"inbox": ["fresh"]}))),
        "watcher of overlapping data must observe the committed write: {emissions:?}"
    );
}
