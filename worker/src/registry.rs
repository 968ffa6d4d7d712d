//! Worker registration and handler adapters
//!
//! A worker associates a task type name with a handler and a resolved
//! configuration. Binding is decided once, at registration: the builder
//! produces a typed adapter closure that either passes the whole [`Task`]
//! through or binds named `inputData` keys onto a deserializable input
//! struct, so no reflection happens on the hot path. Input schemas are
//! generated from the input type and reused both for task-definition
//! registration and for strict-schema validation.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use shared::config::{WorkerConfig, WorkerOptions};
use shared::model::{HandlerError, Task, TaskDef, TaskOutput};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Synchronous handler adapter: runs on the blocking pool
pub type SyncHandler = Arc<dyn Fn(Task) -> Result<TaskOutput, HandlerError> + Send + Sync>;

/// Asynchronous handler adapter: runs on the cooperative scheduler
pub type AsyncHandler =
    Arc<dyn Fn(Task) -> BoxFuture<'static, Result<TaskOutput, HandlerError>> + Send + Sync>;

/// Execution kind plus the adapter closure, fixed at registration
#[derive(Clone)]
pub enum TaskHandlerFn {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl TaskHandlerFn {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskHandlerFn::Sync(_) => "sync",
            TaskHandlerFn::Async(_) => "async",
        }
    }
}

/// A registered task handler with its resolved configuration
pub struct Worker {
    config: WorkerConfig,
    handler: TaskHandlerFn,
    input_schema: Option<Value>,
    description: Option<String>,
}

impl Worker {
    /// Start building a worker for the given task type
    pub fn builder(task_def_name: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder {
            task_def_name: task_def_name.into(),
            options: WorkerOptions::default(),
            description: None,
        }
    }

    pub fn task_def_name(&self) -> &str {
        &self.config.task_def_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn handler(&self) -> &TaskHandlerFn {
        &self.handler
    }

    /// Task-definition payload for startup registration
    pub fn task_def(&self) -> TaskDef {
        let mut def = TaskDef::new(self.config.task_def_name.clone());
        def.description = self.description.clone();
        def.input_schema = self.input_schema.clone();
        def
    }
}

/// Builder collecting code-level defaults and the handler adapter.
///
/// The terminal methods fix the binding mode: `handler`/`async_handler`
/// bind named input keys onto a typed input struct, while
/// `task_handler`/`async_task_handler` pass the whole task through (the
/// explicit form of a single task-typed parameter).
pub struct WorkerBuilder {
    task_def_name: String,
    options: WorkerOptions,
    description: Option<String>,
}

impl WorkerBuilder {
    pub fn poll_interval_millis(mut self, value: u64) -> Self {
        self.options.poll_interval_millis = value;
        self
    }

    pub fn thread_count(mut self, value: usize) -> Self {
        self.options.thread_count = value;
        self
    }

    pub fn domain(mut self, value: impl Into<String>) -> Self {
        self.options.domain = Some(value.into());
        self
    }

    pub fn worker_id(mut self, value: impl Into<String>) -> Self {
        self.options.worker_id = Some(value.into());
        self
    }

    pub fn poll_timeout_millis(mut self, value: u64) -> Self {
        self.options.poll_timeout_millis = value;
        self
    }

    pub fn lease_extend_enabled(mut self, value: bool) -> Self {
        self.options.lease_extend_enabled = value;
        self
    }

    pub fn register_task_def(mut self, value: bool) -> Self {
        self.options.register_task_def = value;
        self
    }

    pub fn overwrite_task_def(mut self, value: bool) -> Self {
        self.options.overwrite_task_def = value;
        self
    }

    pub fn strict_schema(mut self, value: bool) -> Self {
        self.options.strict_schema = value;
        self
    }

    pub fn description(mut self, value: impl Into<String>) -> Self {
        self.description = Some(value.into());
        self
    }

    /// Synchronous handler bound by input name
    pub fn handler<I, O, F>(self, handler: F) -> shared::Result<Worker>
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Into<TaskOutput>,
        F: Fn(I) -> Result<O, HandlerError> + Send + Sync + 'static,
    {
        let config = WorkerConfig::resolve(&self.task_def_name, &self.options)?;
        let schema = input_schema::<I>()?;
        let strict = config.strict_schema;
        let binding_schema = schema.clone();

        let adapter: SyncHandler = Arc::new(move |task: Task| {
            let input: I = bind_input(&task, &binding_schema, strict)?;
            handler(input).map(Into::into)
        });

        Ok(Worker {
            config,
            handler: TaskHandlerFn::Sync(adapter),
            input_schema: Some(schema),
            description: self.description,
        })
    }

    /// Asynchronous handler bound by input name
    pub fn async_handler<I, O, F, Fut>(self, handler: F) -> shared::Result<Worker>
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Into<TaskOutput> + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        let config = WorkerConfig::resolve(&self.task_def_name, &self.options)?;
        let schema = input_schema::<I>()?;
        let strict = config.strict_schema;
        let binding_schema = schema.clone();

        let adapter: AsyncHandler = Arc::new(move |task: Task| {
            match bind_input::<I>(&task, &binding_schema, strict) {
                Ok(input) => {
                    let fut = handler(input);
                    async move { fut.await.map(Into::into) }.boxed()
                }
                Err(error) => async move { Err(error) }.boxed(),
            }
        });

        Ok(Worker {
            config,
            handler: TaskHandlerFn::Async(adapter),
            input_schema: Some(schema),
            description: self.description,
        })
    }

    /// Synchronous handler receiving the whole task
    pub fn task_handler<F>(self, handler: F) -> shared::Result<Worker>
    where
        F: Fn(Task) -> Result<TaskOutput, HandlerError> + Send + Sync + 'static,
    {
        let config = WorkerConfig::resolve(&self.task_def_name, &self.options)?;
        Ok(Worker {
            config,
            handler: TaskHandlerFn::Sync(Arc::new(handler)),
            input_schema: None,
            description: self.description,
        })
    }

    /// Asynchronous handler receiving the whole task
    pub fn async_task_handler<F, Fut>(self, handler: F) -> shared::Result<Worker>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, HandlerError>> + Send + 'static,
    {
        let config = WorkerConfig::resolve(&self.task_def_name, &self.options)?;
        let adapter: AsyncHandler = Arc::new(move |task: Task| handler(task).boxed());
        Ok(Worker {
            config,
            handler: TaskHandlerFn::Async(adapter),
            input_schema: None,
            description: self.description,
        })
    }
}

/// Name → worker map, populated before `start()` and immutable afterwards
#[derive(Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. A task type is served by exactly one worker per
    /// process, so duplicates are rejected.
    pub fn register(&mut self, worker: Worker) -> shared::Result<()> {
        let name = worker.task_def_name().to_string();
        if self.workers.contains_key(&name) {
            return Err(shared::RuntimeError::Registration(format!(
                "worker '{}' is already registered",
                name
            ))
            .into());
        }
        self.workers.insert(name, Arc::new(worker));
        Ok(())
    }

    pub fn get(&self, task_def_name: &str) -> Option<Arc<Worker>> {
        self.workers.get(task_def_name).cloned()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Generate a draft-07 JSON Schema for the handler input type
fn input_schema<I: JsonSchema>() -> shared::Result<Value> {
    let schema = schemars::generate::SchemaSettings::draft07()
        .into_generator()
        .into_root_schema_for::<I>();
    serde_json::to_value(&schema).map_err(|e| {
        shared::RuntimeError::Registration(format!("failed to generate input schema: {e}")).into()
    })
}

/// Bind `inputData` onto the typed input, applying strict-schema checking
/// and primitive coercion
fn bind_input<I: DeserializeOwned>(
    task: &Task,
    schema: &Value,
    strict: bool,
) -> Result<I, HandlerError> {
    if strict {
        if let Some(known) = schema_property_names(schema) {
            let unknown: Vec<&str> = task
                .input_data
                .keys()
                .map(String::as_str)
                .filter(|key| !known.iter().any(|k| k == key))
                .collect();
            if !unknown.is_empty() {
                return Err(HandlerError::non_retryable(format!(
                    "schema violation: unknown input keys: {}",
                    unknown.join(", ")
                )));
            }
        }
    }

    let coerced = coerce_input(schema, &task.input_data);
    serde_json::from_value(Value::Object(coerced))
        .map_err(|e| HandlerError::failed(format!("failed to bind task input: {e}")))
}

fn schema_property_names(schema: &Value) -> Option<Vec<String>> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| properties.keys().cloned().collect())
}

/// Coerce primitive input values toward the declared property types, so a
/// numeric string binds onto an integer field and vice versa. Values that
/// do not coerce cleanly pass through and fail (or succeed) in serde.
fn coerce_input(schema: &Value, input: &Map<String, Value>) -> Map<String, Value> {
    let properties = schema.get("properties").and_then(Value::as_object);
    let mut coerced = Map::with_capacity(input.len());

    for (key, value) in input {
        let declared = properties
            .and_then(|p| p.get(key))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        coerced.insert(key.clone(), coerce_value(declared, value));
    }
    coerced
}

fn coerce_value(declared: Option<&str>, value: &Value) -> Value {
    match (declared, value) {
        (Some("string"), Value::Number(n)) => Value::String(n.to_string()),
        (Some("string"), Value::Bool(b)) => Value::String(b.to_string()),
        (Some("integer"), Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| value.clone()),
        (Some("number"), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        (Some("boolean"), Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}
