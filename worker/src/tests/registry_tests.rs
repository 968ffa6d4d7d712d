//! Tests for worker registration, handler adapters and input binding

use super::test_utils::make_task;
use crate::registry::{TaskHandlerFn, Worker, WorkerRegistry};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use shared::model::{HandlerError, Task, TaskOutput};

#[derive(Debug, Deserialize, JsonSchema)]
struct OrderInput {
    customer: String,
    quantity: i64,
    express: bool,
}

fn invoke_sync(worker: &Worker, task: Task) -> Result<TaskOutput, HandlerError> {
    match worker.handler() {
        TaskHandlerFn::Sync(handler) => (**handler)(task),
        TaskHandlerFn::Async(_) => panic!("expected a sync handler"),
    }
}

async fn invoke_async(worker: &Worker, task: Task) -> Result<TaskOutput, HandlerError> {
    match worker.handler() {
        TaskHandlerFn::Async(handler) => (**handler)(task).await,
        TaskHandlerFn::Sync(_) => panic!("expected an async handler"),
    }
}

#[test]
fn test_typed_binding_with_primitive_coercion() {
    let worker = Worker::builder("reg_orders")
        .handler(|input: OrderInput| {
            Ok(json!({
                "customer": input.customer,
                "quantity": input.quantity,
                "express": input.express,
            }))
        })
        .unwrap();

    // Numbers arrive as strings and vice versa; the adapter coerces them
    // toward the declared schema types before binding.
    let task = make_task(
        "o1",
        "reg_orders",
        &[
            ("customer", json!(42)),
            ("quantity", json!("3")),
            ("express", json!("true")),
        ],
        60,
    );

    let output = invoke_sync(&worker, task).unwrap();
    match output {
        TaskOutput::Data(map) => {
            assert_eq!(map.get("customer"), Some(&json!("42")));
            assert_eq!(map.get("quantity"), Some(&json!(3)));
            assert_eq!(map.get("express"), Some(&json!(true)));
        }
        other => panic!("unexpected output: {other:?}"),
    }
}

#[test]
fn test_unknown_keys_ignored_without_strict_schema() {
    let worker = Worker::builder("reg_lenient")
        .handler(|input: OrderInput| Ok(json!({ "customer": input.customer })))
        .unwrap();

    let task = make_task(
        "o2",
        "reg_lenient",
        &[
            ("customer", json!("acme")),
            ("quantity", json!(1)),
            ("express", json!(false)),
            ("surprise", json!("extra")),
        ],
        60,
    );
    assert!(invoke_sync(&worker, task).is_ok());
}

#[test]
fn test_strict_schema_rejects_unknown_keys_terminally() {
    let worker = Worker::builder("reg_strict")
        .strict_schema(true)
        .handler(|input: OrderInput| Ok(json!({ "customer": input.customer })))
        .unwrap();

    let task = make_task(
        "o3",
        "reg_strict",
        &[
            ("customer", json!("acme")),
            ("quantity", json!(1)),
            ("express", json!(false)),
            ("surprise", json!("extra")),
        ],
        60,
    );

    match invoke_sync(&worker, task) {
        Err(HandlerError::NonRetryable(reason)) => {
            assert!(reason.contains("schema violation"), "{reason}");
            assert!(reason.contains("surprise"), "{reason}");
        }
        other => panic!("expected a terminal schema violation, got {other:?}"),
    }
}

#[test]
fn test_missing_input_key_fails_retryably() {
    let worker = Worker::builder("reg_missing")
        .handler(|input: OrderInput| Ok(json!({ "customer": input.customer })))
        .unwrap();

    let task = make_task("o4", "reg_missing", &[("customer", json!("acme"))], 60);
    match invoke_sync(&worker, task) {
        Err(HandlerError::Failed(reason)) => {
            assert!(reason.contains("failed to bind task input"), "{reason}");
        }
        other => panic!("expected a retryable binding failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_async_typed_adapter() {
    let worker = Worker::builder("reg_async")
        .async_handler(|input: OrderInput| async move {
            Ok(format!("{} x{}", input.customer, input.quantity))
        })
        .unwrap();

    let task = make_task(
        "o5",
        "reg_async",
        &[
            ("customer", json!("acme")),
            ("quantity", json!(2)),
            ("express", json!(false)),
        ],
        60,
    );

    match invoke_async(&worker, task).await.unwrap() {
        TaskOutput::Value(value) => assert_eq!(value, json!("acme x2")),
        other => panic!("unexpected output: {other:?}"),
    }
}

#[test]
fn test_whole_task_adapter_sees_task_identity() {
    let worker = Worker::builder("reg_whole_task")
        .task_handler(|task| Ok(json!({ "echoed_id": task.task_id }).into()))
        .unwrap();

    let task = make_task("o6", "reg_whole_task", &[("anything", json!(1))], 60);
    match invoke_sync(&worker, task).unwrap() {
        TaskOutput::Data(map) => assert_eq!(map.get("echoed_id"), Some(&json!("o6"))),
        other => panic!("unexpected output: {other:?}"),
    }
}

#[test]
fn test_task_def_carries_generated_schema() {
    let worker = Worker::builder("reg_schema")
        .description("order intake")
        .handler(|input: OrderInput| Ok(json!({ "customer": input.customer })))
        .unwrap();

    let task_def = worker.task_def();
    assert_eq!(task_def.name, "reg_schema");
    assert_eq!(task_def.description.as_deref(), Some("order intake"));

    let schema = task_def.input_schema.unwrap();
    let properties = schema.get("properties").unwrap().as_object().unwrap();
    assert!(properties.contains_key("customer"));
    assert!(properties.contains_key("quantity"));
    assert!(properties.contains_key("express"));
}

#[test]
fn test_whole_task_worker_has_no_schema() {
    let worker = Worker::builder("reg_no_schema")
        .task_handler(|_task| Ok(TaskOutput::Empty))
        .unwrap();
    assert!(worker.task_def().input_schema.is_none());
}

#[test]
fn test_zero_thread_count_rejected_at_registration() {
    let result = Worker::builder("reg_zero_threads")
        .thread_count(0)
        .task_handler(|_task| Ok(TaskOutput::Empty));
    assert!(result.is_err());
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut registry = WorkerRegistry::new();
    registry
        .register(
            Worker::builder("reg_dup")
                .task_handler(|_task| Ok(TaskOutput::Empty))
                .unwrap(),
        )
        .unwrap();

    let duplicate = Worker::builder("reg_dup")
        .task_handler(|_task| Ok(TaskOutput::Empty))
        .unwrap();
    assert!(registry.register(duplicate).is_err());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_registry_lookup_and_names() {
    let mut registry = WorkerRegistry::new();
    registry
        .register(
            Worker::builder("reg_lookup_a")
                .task_handler(|_task| Ok(TaskOutput::Empty))
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            Worker::builder("reg_lookup_b")
                .task_handler(|_task| Ok(TaskOutput::Empty))
                .unwrap(),
        )
        .unwrap();

    assert!(registry.get("reg_lookup_a").is_some());
    assert!(registry.get("reg_lookup_missing").is_none());
    assert_eq!(registry.names(), vec!["reg_lookup_a", "reg_lookup_b"]);

    let worker = registry.get("reg_lookup_a").unwrap();
    assert_eq!(worker.config().thread_count, 1);
    assert_eq!(worker.handler().kind(), "sync");
}
