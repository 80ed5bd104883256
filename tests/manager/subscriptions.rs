//! GraphQL subscription streams.

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;

use graph_client::{
    ClientError, Document, ExecutionResult, Observer, SubscriptionOptions,
};

use super::support::{manager_with, settle, MockCache, MockLink};

fn sub_doc() -> Document {
    Document::subscription("OnMessage", "subscription OnMessage { message { body } }")
}

#[tokio::test]
async fn subscription_streams_every_emission_without_caching() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let stream = manager
        .subscribe(SubscriptionOptions::new(sub_doc()))
        .await
        .unwrap();

    let seen: Arc<StdMutex<Vec<ExecutionResult>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let done: Arc<StdMutex<bool>> = Arc::new(StdMutex::new(false));
    let done_sink = Arc::clone(&done);
    let _subscription = stream.subscribe(
        Observer::new()
            .on_next(move |result: ExecutionResult| {
                sink.lock().unwrap().push(result);
            })
            .on_complete(move || {
                *done_sink.lock().unwrap() = true;
            }),
    );
    settle().await;
    assert_eq!(link.call_count(), 1);

    link.emit_pending(0, ExecutionResult::data(json!({"message": {"body": "hi"}})));
    link.emit_pending(0, ExecutionResult::data(json!({"message": {"body": "again"}})));
    link.complete_pending(0);

    let results = seen.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data, Some(json!({"message": {"body": "hi"}})));
    assert_eq!(results[1].data, Some(json!({"message": {"body": "again"}})));
    assert!(*done.lock().unwrap());

    assert!(cache.writes().is_empty(), "subscription data is not cached");
}

#[tokio::test]
async fn subscribe_rejects_non_subscription_documents() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let query_doc = Document::query("Q", "query Q { a }");
    let err = manager
        .subscribe(SubscriptionOptions::new(query_doc))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Usage(_)));
    assert_eq!(link.call_count(), 0);
}

#[tokio::test]
async fn unsubscribing_tears_down_the_transport_stream() {
    let cache = MockCache::new();
    let link = MockLink::manual();
    let manager = manager_with(&cache, &link, true);

    let stream = manager
        .subscribe(SubscriptionOptions::new(sub_doc()))
        .await
        .unwrap();
    let subscription = stream.subscribe(Observer::new());
    settle().await;
    assert_eq!(manager.in_flight_count(), 1);

    subscription.unsubscribe();
    assert_eq!(
        manager.in_flight_count(),
        0,
        "last unsubscribe prunes the shared entry"
    );
}
