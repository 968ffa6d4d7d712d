//! Tests for the shared HTTP transport: token refresh, request timing
//! events, update-v2 parsing and moved-on handling

use super::test_utils::{make_task, FakeOrchestrator, RecordingListener};
use crate::events::{EventBus, WorkerEvent};
use crate::transport::ApiClient;
use serde_json::Map;
use shared::model::TaskResult;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn completed_result(task_id: &str, task_type: &str) -> TaskResult {
    let task = make_task(task_id, task_type, &[], 60);
    TaskResult::completed(&task, "transport-test-worker", Map::new())
}

#[tokio::test]
async fn test_poll_batch_empty_queue_returns_empty_vec() {
    let server = FakeOrchestrator::start().await;
    let client = ApiClient::new(server.settings(), EventBus::default()).unwrap();

    let tasks = client
        .poll_batch("transport_poll", "w1", None, 3, 50)
        .await
        .unwrap();
    assert!(tasks.is_empty());
    assert_eq!(server.state.polls(), vec![3]);
}

#[tokio::test]
async fn test_poll_batch_hands_out_queued_tasks() {
    let server = FakeOrchestrator::start().await;
    server.enqueue(make_task("p1", "transport_poll", &[], 60));
    server.enqueue(make_task("p2", "transport_poll", &[], 60));
    let client = ApiClient::new(server.settings(), EventBus::default()).unwrap();

    let tasks = client
        .poll_batch("transport_poll", "w1", Some("eu"), 5, 50)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, "p1");
    assert_eq!(tasks[1].task_id, "p2");
}

#[tokio::test]
async fn test_token_exchanged_eagerly_and_reused() {
    let server = FakeOrchestrator::start_with_auth().await;
    let client = ApiClient::new(server.settings_with_auth(), EventBus::default()).unwrap();

    client.authenticate().await.unwrap();
    assert_eq!(server.state.tokens_issued.load(Ordering::SeqCst), 1);

    // Subsequent requests reuse the cached token instead of re-exchanging.
    client
        .poll_batch("transport_auth", "w1", None, 1, 50)
        .await
        .unwrap();
    client
        .poll_batch("transport_auth", "w1", None, 1, 50)
        .await
        .unwrap();
    assert_eq!(server.state.tokens_issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_401_triggers_single_refresh_and_retry() {
    let server = FakeOrchestrator::start_with_auth().await;
    let client = ApiClient::new(server.settings_with_auth(), EventBus::default()).unwrap();

    client.authenticate().await.unwrap();
    assert_eq!(server.state.tokens_issued.load(Ordering::SeqCst), 1);

    // Invalidate the token server-side: the next request sees a 401,
    // refreshes once, and succeeds on the retry.
    server.state.rotate_token();
    let tasks = client
        .poll_batch("transport_auth", "w1", None, 1, 50)
        .await
        .unwrap();
    assert!(tasks.is_empty());
    assert_eq!(server.state.tokens_issued.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_update_v2_parses_chained_task_or_none() {
    let server = FakeOrchestrator::start().await;
    let client = ApiClient::new(server.settings(), EventBus::default()).unwrap();

    // Empty response body means no next task.
    let next = client
        .update_v2(&completed_result("u1", "transport_chain"))
        .await
        .unwrap();
    assert!(next.is_none());

    // A chained task in the response is validated and returned.
    server.enqueue_chain(make_task("u2", "transport_chain", &[], 60));
    let next = client
        .update_v2(&completed_result("u1", "transport_chain"))
        .await
        .unwrap();
    assert_eq!(next.unwrap().task_id, "u2");
}

#[tokio::test]
async fn test_update_conflict_maps_to_task_moved_on() {
    let server = FakeOrchestrator::start().await;
    let client = ApiClient::new(server.settings(), EventBus::default()).unwrap();

    server.state.reject_updates.store(true, Ordering::SeqCst);
    let error = client
        .update(&completed_result("gone", "transport_conflict"))
        .await
        .unwrap_err();
    assert!(error.is_task_moved_on());

    let error = client
        .update_v2(&completed_result("gone", "transport_conflict"))
        .await
        .unwrap_err();
    assert!(error.is_task_moved_on());
}

#[tokio::test]
async fn test_append_log_and_get_task() {
    let server = FakeOrchestrator::start().await;
    server.enqueue(make_task("diag1", "transport_diag", &[], 60));
    let client = ApiClient::new(server.settings(), EventBus::default()).unwrap();

    client.append_log("diag1", "step one done").await.unwrap();
    assert_eq!(
        server.state.logs.lock().unwrap().as_slice(),
        &[("diag1".to_string(), "step one done".to_string())]
    );

    let task = client.get_task("diag1").await.unwrap();
    assert_eq!(task.task_id, "diag1");
    assert_eq!(task.task_def_name, "transport_diag");
}

#[tokio::test]
async fn test_every_request_emits_a_timing_event() {
    let server = FakeOrchestrator::start().await;
    let listener = Arc::new(RecordingListener::default());
    let events = EventBus::new(vec![listener.clone()]);
    let client = ApiClient::new(server.settings(), events).unwrap();

    client
        .poll_batch("transport_events", "w1", None, 2, 50)
        .await
        .unwrap();
    client
        .update(&completed_result("ev1", "transport_events"))
        .await
        .unwrap();

    let events = listener.events.lock().unwrap();
    let http_events: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::HttpRequest {
                method,
                uri,
                status,
                ..
            } => Some((method.clone(), uri.clone(), status.clone())),
            _ => None,
        })
        .collect();

    // The uri label carries the pattern, never the raw task-typed path.
    assert!(http_events.contains(&(
        "GET".to_string(),
        "/tasks/poll/batch/{taskType}".to_string(),
        "200".to_string()
    )));
    assert!(http_events.contains(&(
        "POST".to_string(),
        "/tasks".to_string(),
        "200".to_string()
    )));
}
