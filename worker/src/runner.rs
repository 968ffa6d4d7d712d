//! Per-worker poll/execute/update driver
//!
//! One runner serves exactly one task type. Each cycle it reaps finished
//! executions, checks capacity and the pause flag, drains tasks chained
//! through update responses before polling the server for the remainder,
//! and dispatches everything obtained to the execution backend. Updates are
//! posted by the driver itself so a chained task is always preferred over a
//! fresh poll, matching the chaining contract of the V2 update endpoint.

use crate::events::{EventBus, WorkerEvent};
use crate::executor::{self, CompletedExecution};
use crate::registry::Worker;
use crate::transport::{jittered_delay, ApiClient};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use shared::config::resolve_paused;
use shared::defaults::{
    default_update_retry_attempts, default_update_retry_base_delay_ms,
    default_update_retry_max_delay_ms, empty_poll_backoff_base_millis, lease_extension_factor,
};
use shared::model::{Task, TaskResult};
use shared::utils::calculate_backoff_delay;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Stop signal shared by all runners: `None` while running, the grace
/// period to drain with once a stop was requested.
pub(crate) type StopSignal = watch::Receiver<Option<Duration>>;

pub(crate) struct TaskRunner {
    worker: Arc<Worker>,
    client: Arc<ApiClient>,
    events: EventBus,
    update_v2_enabled: bool,
    /// In-flight executions; its length is the number of consumed permits
    executions: FuturesUnordered<JoinHandle<CompletedExecution>>,
    /// Abort handles for the hard shutdown deadline
    execution_aborts: Vec<AbortHandle>,
    /// One-shot lease-extension timers keyed by task id
    lease_timers: HashMap<String, JoinHandle<()>>,
    /// Tasks obtained "for free" from V2 update responses
    local_queue: VecDeque<Task>,
    consecutive_empty_polls: u32,
    stop: StopSignal,
}

impl TaskRunner {
    pub(crate) fn new(
        worker: Arc<Worker>,
        client: Arc<ApiClient>,
        events: EventBus,
        stop: StopSignal,
    ) -> Self {
        let update_v2_enabled = client.settings().update_v2_enabled;
        Self {
            worker,
            client,
            events,
            update_v2_enabled,
            executions: FuturesUnordered::new(),
            execution_aborts: Vec::new(),
            lease_timers: HashMap::new(),
            local_queue: VecDeque::new(),
            consecutive_empty_polls: 0,
            stop,
        }
    }

    /// Drive the loop until a stop is signalled, then drain within the
    /// requested grace period.
    pub(crate) async fn run(mut self) {
        let config = self.worker.config();
        info!(
            worker = %config.task_def_name,
            thread_count = config.thread_count,
            worker_id = %config.worker_id,
            handler = self.worker.handler().kind(),
            "Task runner started"
        );

        loop {
            let stop_requested = *self.stop.borrow();
            if let Some(grace) = stop_requested {
                self.shutdown(grace).await;
                return;
            }
            self.run_once().await;
        }
    }

    /// One cycle of the poll/execute/update loop
    async fn run_once(&mut self) {
        self.reap_completed().await;

        let config = self.worker.config();
        let poll_interval = Duration::from_millis(config.poll_interval_millis);
        let task_def_name = config.task_def_name.clone();

        // Free permits: thread_count minus running executions. Chained
        // tasks waiting locally consume the poll quota below, so a full
        // local queue suppresses polling without blocking dispatch.
        let capacity = config.thread_count.saturating_sub(self.executions.len());
        if capacity == 0 {
            self.sleep_or_stop(Duration::from_millis(1)).await;
            return;
        }

        // The pause flag is environment-only and re-read every cycle so
        // operators can toggle it without a restart.
        if resolve_paused(&task_def_name) {
            self.events.publish(&WorkerEvent::TaskPaused {
                task_type: task_def_name,
            });
            self.sleep_or_stop(poll_interval).await;
            return;
        }

        // Back off while the server keeps coming up empty.
        if self.consecutive_empty_polls > 0 {
            let backoff_ms = calculate_backoff_delay(
                self.consecutive_empty_polls,
                empty_poll_backoff_base_millis(),
                config.poll_interval_millis,
            );
            self.sleep_or_stop(Duration::from_millis(backoff_ms)).await;
        }

        // Chained tasks first; one batch poll for whatever quota remains.
        let mut obtained: Vec<Task> = Vec::new();
        while obtained.len() < capacity {
            match self.local_queue.pop_front() {
                Some(task) => obtained.push(task),
                None => break,
            }
        }
        let remainder = capacity - obtained.len();
        if remainder > 0 {
            obtained.extend(self.poll_tasks(remainder).await);
        }

        if obtained.is_empty() {
            self.consecutive_empty_polls = self.consecutive_empty_polls.saturating_add(1);
        } else {
            self.consecutive_empty_polls = 0;
        }

        let dispatched = obtained.len();
        for task in obtained {
            self.dispatch(task);
        }

        if dispatched > 0 {
            // Keep momentum while work is flowing.
            tokio::task::yield_now().await;
        } else {
            self.sleep_or_stop(poll_interval).await;
        }
    }

    /// Issue one batch poll. Polling errors are runner-local: they are
    /// logged, counted and converted into an empty result so the adaptive
    /// backoff engages.
    async fn poll_tasks(&self, count: usize) -> Vec<Task> {
        let config = self.worker.config();
        self.events.publish(&WorkerEvent::PollStarted {
            task_type: config.task_def_name.clone(),
            worker_id: config.worker_id.clone(),
            poll_count: count,
        });

        let started = Instant::now();
        match self
            .client
            .poll_batch(
                &config.task_def_name,
                &config.worker_id,
                config.domain.as_deref(),
                count,
                config.poll_timeout_millis,
            )
            .await
        {
            Ok(tasks) => {
                self.events.publish(&WorkerEvent::PollCompleted {
                    task_type: config.task_def_name.clone(),
                    duration: started.elapsed(),
                    tasks_received: tasks.len(),
                });
                if !tasks.is_empty() {
                    debug!(
                        worker = %config.task_def_name,
                        count = tasks.len(),
                        "Polled tasks from server"
                    );
                }
                tasks
            }
            Err(error) => {
                warn!(worker = %config.task_def_name, %error, "Poll failed");
                self.events.publish(&WorkerEvent::PollFailure {
                    task_type: config.task_def_name.clone(),
                    duration: started.elapsed(),
                    cause: error.kind().to_string(),
                });
                Vec::new()
            }
        }
    }

    /// Atomically consume a permit for the task: schedule its lease timer
    /// and hand it to the execution backend.
    fn dispatch(&mut self, task: Task) {
        if task.task_def_name != self.worker.config().task_def_name {
            warn!(
                task_id = %task.task_id,
                expected = %self.worker.config().task_def_name,
                received = %task.task_def_name,
                "Server handed out a task of an unexpected type"
            );
        }
        self.schedule_lease_extension(&task);
        let handle = executor::submit(&self.worker, task, &self.events);
        self.execution_aborts.push(handle.abort_handle());
        self.executions.push(handle);
    }

    /// Non-blockingly collect finished executions: release the permit,
    /// stop the lease timer, emit the execution event and post the update.
    async fn reap_completed(&mut self) {
        loop {
            match self.executions.next().now_or_never() {
                Some(Some(Ok(completed))) => self.finish_execution(completed).await,
                Some(Some(Err(join_error))) => {
                    // Only abort at the shutdown deadline lands here;
                    // handler panics are contained inside the execution.
                    warn!(error = %join_error, "Execution task ended abnormally");
                }
                _ => break,
            }
        }
        self.execution_aborts.retain(|handle| !handle.is_finished());
    }

    async fn finish_execution(&mut self, completed: CompletedExecution) {
        let CompletedExecution {
            task,
            outcome,
            elapsed,
        } = completed;

        if let Some(timer) = self.lease_timers.remove(&task.task_id) {
            timer.abort();
        }

        let worker_id = self.worker.config().worker_id.clone();
        let (result, failure_cause) = match outcome {
            Ok(output) => (TaskResult::from_output(&task, &worker_id, output), None),
            Err(error) => {
                let cause = error.kind().to_string();
                (
                    TaskResult::from_handler_error(&task, &worker_id, &error),
                    Some(cause),
                )
            }
        };

        match failure_cause {
            None => self.events.publish(&WorkerEvent::TaskExecutionCompleted {
                task_type: task.task_def_name.clone(),
                task_id: task.task_id.clone(),
                workflow_instance_id: task.workflow_instance_id.clone(),
                worker_id,
                duration: elapsed,
                output_size_bytes: result.output_size_bytes(),
                status: result.status,
            }),
            Some(cause) => self.events.publish(&WorkerEvent::TaskExecutionFailure {
                task_type: task.task_def_name.clone(),
                task_id: task.task_id.clone(),
                workflow_instance_id: task.workflow_instance_id.clone(),
                worker_id,
                duration: elapsed,
                cause,
                status: result.status,
            }),
        }

        if let Some(next) = self.submit_update(result).await {
            debug!(
                task_id = %next.task_id,
                worker = %self.worker.config().task_def_name,
                "Update response chained the next task"
            );
            self.local_queue.push_back(next);
        }
    }

    /// Post a result, retrying transient failures with exponential backoff
    /// and jitter. Returns the chained next task when the V2 endpoint
    /// supplies one. Lease-extension updates never consume a chained task.
    async fn submit_update(&mut self, result: TaskResult) -> Option<Task> {
        let chain_allowed = self.update_v2_enabled && !result.extend_lease;
        let task_type = self.worker.config().task_def_name.clone();
        let max_retries = default_update_retry_attempts();
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let outcome = if chain_allowed {
                self.client.update_v2(&result).await
            } else {
                self.client.update(&result).await.map(|_| None)
            };

            match outcome {
                Ok(next) => {
                    self.events.publish(&WorkerEvent::TaskUpdateCompleted {
                        task_type: task_type.clone(),
                        duration: started.elapsed(),
                        status: result.status,
                    });
                    return next;
                }
                Err(error) if error.is_task_moved_on() => {
                    // The lease expired and the server reassigned the task;
                    // there is nothing left to report.
                    info!(task_id = %result.task_id, %error, "Task moved on; dropping update");
                    return None;
                }
                Err(error) => {
                    self.events.publish(&WorkerEvent::TaskUpdateFailure {
                        task_type: task_type.clone(),
                        duration: started.elapsed(),
                        cause: error.kind().to_string(),
                    });
                    if attempt >= max_retries {
                        error!(
                            task_id = %result.task_id,
                            %error,
                            "Giving up on update; lease expiry will reclaim the task"
                        );
                        return None;
                    }
                    let delay_ms = calculate_backoff_delay(
                        attempt,
                        default_update_retry_base_delay_ms(),
                        default_update_retry_max_delay_ms(),
                    );
                    warn!(
                        task_id = %result.task_id,
                        attempt = attempt + 1,
                        %error,
                        "Update failed, retrying"
                    );
                    tokio::time::sleep(jittered_delay(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Schedule the automated lease-extension timer for a dispatched task.
    /// It fires at 0.8 of the response timeout, posts an IN_PROGRESS update
    /// with `extendLease=true` through the legacy endpoint, and reschedules
    /// itself until the execution completes and aborts it.
    fn schedule_lease_extension(&mut self, task: &Task) {
        let config = self.worker.config();
        if !config.lease_extend_enabled || task.response_timeout_seconds == 0 {
            return;
        }

        let interval = Duration::from_secs_f64(
            task.response_timeout_seconds as f64 * lease_extension_factor(),
        );
        let callback_after_seconds = interval.as_secs().max(1);
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let worker_id = config.worker_id.clone();
        let task_type = config.task_def_name.clone();
        let snapshot = task.clone();

        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                debug!(task_id = %snapshot.task_id, "Extending task lease");
                let extension =
                    TaskResult::lease_extension(&snapshot, &worker_id, callback_after_seconds);

                let started = Instant::now();
                match client.update(&extension).await {
                    Ok(()) => events.publish(&WorkerEvent::TaskUpdateCompleted {
                        task_type: task_type.clone(),
                        duration: started.elapsed(),
                        status: extension.status,
                    }),
                    Err(error) if error.is_task_moved_on() => {
                        info!(
                            task_id = %snapshot.task_id,
                            %error,
                            "Task moved on; stopping lease extension"
                        );
                        return;
                    }
                    Err(error) => {
                        // The next rescheduled tick tries again; a missed
                        // extension only matters once the lease lapses.
                        warn!(task_id = %snapshot.task_id, %error, "Lease extension failed");
                        events.publish(&WorkerEvent::TaskUpdateFailure {
                            task_type: task_type.clone(),
                            duration: started.elapsed(),
                            cause: error.kind().to_string(),
                        });
                    }
                }
            }
        });

        if let Some(previous) = self.lease_timers.insert(task.task_id.clone(), timer) {
            previous.abort();
        }
    }

    /// Cooperative shutdown: cancel lease timers, drain in-flight work up
    /// to the grace deadline, then abandon the rest to lease expiry.
    async fn shutdown(&mut self, grace: Duration) {
        let worker = self.worker.config().task_def_name.clone();
        info!(
            %worker,
            in_flight = self.executions.len(),
            grace_seconds = grace.as_secs(),
            "Stopping task runner"
        );

        for (_, timer) in self.lease_timers.drain() {
            timer.abort();
        }

        let deadline = Instant::now() + grace;
        let mut check = tokio::time::interval(Duration::from_millis(100));
        while !self.executions.is_empty() {
            check.tick().await;
            self.reap_completed().await;
            if self.executions.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    %worker,
                    still_running = self.executions.len(),
                    "Grace deadline reached; abandoning in-flight tasks to lease expiry"
                );
                break;
            }
        }

        for handle in self.execution_aborts.drain(..) {
            handle.abort();
        }
        if !self.local_queue.is_empty() {
            debug!(
                %worker,
                dropped = self.local_queue.len(),
                "Dropping chained tasks received during shutdown; lease expiry reclaims them"
            );
        }

        info!(%worker, "Task runner stopped");
    }

    async fn sleep_or_stop(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut stop = self.stop.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stop.changed() => {}
        }
    }
}
