//! Tests for the metrics collector, event bus containment and exposure

use super::test_utils::RecordingListener;
use crate::events::{EventBus, EventListener, WorkerEvent};
use crate::exposition::{self, MetricsExposure};
use crate::metrics::MetricsCollector;
use shared::model::TaskResultStatus;
use std::sync::Arc;
use std::time::Duration;

fn poll_started(task_type: &str) -> WorkerEvent {
    WorkerEvent::PollStarted {
        task_type: task_type.to_string(),
        worker_id: "metrics-test".to_string(),
        poll_count: 1,
    }
}

fn poll_completed(task_type: &str, millis: u64) -> WorkerEvent {
    WorkerEvent::PollCompleted {
        task_type: task_type.to_string(),
        duration: Duration::from_millis(millis),
        tasks_received: 1,
    }
}

#[test]
fn test_counters_follow_events() {
    let collector = MetricsCollector::new();
    collector.on_event(&poll_started("demo"));
    collector.on_event(&poll_started("demo"));
    collector.on_event(&WorkerEvent::TaskPaused {
        task_type: "demo".to_string(),
    });
    collector.on_event(&WorkerEvent::WorkerRestarted {
        task_type: "demo".to_string(),
    });
    collector.on_event(&WorkerEvent::TaskUpdateFailure {
        task_type: "demo".to_string(),
        duration: Duration::from_millis(5),
        cause: "TransportError".to_string(),
    });

    assert_eq!(
        collector.counter_value("task_poll_total", &[("taskType", "demo")]),
        2
    );
    assert_eq!(
        collector.counter_value("task_paused_total", &[("taskType", "demo")]),
        1
    );
    assert_eq!(
        collector.counter_value("worker_restart_total", &[("taskType", "demo")]),
        1
    );
    assert_eq!(
        collector.counter_value(
            "task_update_error_total",
            &[("taskType", "demo"), ("exception", "TransportError")]
        ),
        1
    );
}

#[test]
fn test_execution_failure_labels_exception() {
    let collector = MetricsCollector::new();
    collector.on_event(&WorkerEvent::TaskExecutionFailure {
        task_type: "demo".to_string(),
        task_id: "t1".to_string(),
        workflow_instance_id: "wf1".to_string(),
        worker_id: "w".to_string(),
        duration: Duration::from_millis(30),
        cause: "NonRetryableError".to_string(),
        status: TaskResultStatus::FailedWithTerminalError,
    });

    assert_eq!(
        collector.counter_value(
            "task_execute_error_total",
            &[("taskType", "demo"), ("exception", "NonRetryableError")]
        ),
        1
    );
    let rendered = collector.render();
    assert!(rendered.contains(
        "task_execute_time_seconds{taskType=\"demo\",status=\"FAILED_WITH_TERMINAL_ERROR\",quantile=\"0.5\"}"
    ));
}

#[test]
fn test_render_exposition_format() {
    let collector = MetricsCollector::new();
    collector.on_event(&poll_started("render_demo"));
    collector.on_event(&poll_completed("render_demo", 100));

    let rendered = collector.render();
    assert!(rendered.contains("# TYPE task_poll_total counter"));
    assert!(rendered.contains("task_poll_total{taskType=\"render_demo\"} 1"));
    assert!(rendered.contains("# TYPE task_poll_time_seconds summary"));
    // With a single 100ms observation every quantile is that observation.
    assert!(rendered.contains(
        "task_poll_time_seconds{taskType=\"render_demo\",status=\"SUCCESS\",quantile=\"0.5\"} 0.1"
    ));
    assert!(rendered.contains(
        "task_poll_time_seconds{taskType=\"render_demo\",status=\"SUCCESS\",quantile=\"0.99\"} 0.1"
    ));
    assert!(rendered
        .contains("task_poll_time_seconds_count{taskType=\"render_demo\",status=\"SUCCESS\"} 1"));
    assert!(rendered
        .contains("task_poll_time_seconds_sum{taskType=\"render_demo\",status=\"SUCCESS\"} 0.1"));
}

#[test]
fn test_quantile_window_slides_but_count_accumulates() {
    let collector = MetricsCollector::new();
    // Fill the window, then push it past capacity with a different value;
    // the count keeps the full history while quantiles only see the window.
    for _ in 0..1_000 {
        collector.on_event(&poll_completed("window_demo", 10));
    }
    for _ in 0..1_000 {
        collector.on_event(&poll_completed("window_demo", 20));
    }

    let rendered = collector.render();
    assert!(rendered
        .contains("task_poll_time_seconds_count{taskType=\"window_demo\",status=\"SUCCESS\"} 2000"));
    // The first thousand observations have been evicted.
    assert!(rendered.contains(
        "task_poll_time_seconds{taskType=\"window_demo\",status=\"SUCCESS\",quantile=\"0.5\"} 0.02"
    ));
}

#[test]
fn test_listener_panic_is_contained() {
    struct PanickingListener;
    impl EventListener for PanickingListener {
        fn on_event(&self, _event: &WorkerEvent) {
            panic!("listener bug");
        }
    }

    let collector = Arc::new(MetricsCollector::new());
    let recording = Arc::new(RecordingListener::default());
    let bus = EventBus::new(vec![
        Arc::new(PanickingListener),
        collector.clone(),
        recording.clone(),
    ]);

    bus.publish(&poll_started("contained"));

    // The panicking listener was counted and the rest still ran.
    assert_eq!(bus.listener_failures(), 1);
    assert_eq!(
        collector.counter_value("task_poll_total", &[("taskType", "contained")]),
        1
    );
    assert_eq!(recording.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_http_exposure_serves_metrics_and_health() {
    let collector = Arc::new(MetricsCollector::new());
    collector.on_event(&poll_started("exposed"));

    let handle = exposition::spawn(collector, MetricsExposure::Http { port: 0 })
        .await
        .unwrap();
    let addr = handle.local_addr.unwrap();

    let body = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("task_poll_total{taskType=\"exposed\"} 1"));

    let health = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap();
    assert!(health.status().is_success());

    handle.stop().await;
}

#[tokio::test]
async fn test_file_exposure_writes_metrics_file() {
    let directory = tempfile::tempdir().unwrap();
    let collector = Arc::new(MetricsCollector::new());
    collector.on_event(&poll_started("file_exposed"));

    let handle = exposition::spawn(
        collector,
        MetricsExposure::File {
            directory: directory.path().to_path_buf(),
            interval: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();

    let path = directory.path().join("metrics.prom");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("task_poll_total{taskType=\"file_exposed\"} 1"));

    handle.stop().await;
}
