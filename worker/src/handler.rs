//! Task handler: supervisor for all registered workers
//!
//! The handler owns worker lifecycle. `start()` spawns one isolated runner
//! per registered worker plus a supervisor that restarts crashed runners
//! within a rate-limited policy; `stop()` signals every runner, waits up to
//! the grace period for a clean drain and force-terminates survivors. The
//! shared HTTP transport, event bus and metrics exposure are owned here and
//! closed on shutdown.

use crate::events::{EventBus, EventListener, WorkerEvent};
use crate::exposition::{self, ExpositionHandle, MetricsExposure};
use crate::metrics::MetricsCollector;
use crate::registry::{Worker, WorkerRegistry};
use crate::runner::TaskRunner;
use crate::transport::ApiClient;
use shared::config::ServerSettings;
use shared::defaults::{
    default_grace_period_seconds, default_max_restarts, default_restart_window_seconds,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval at which the supervisor checks runner liveness
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle state of the handler
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerState {
    Stopped,
    Running,
}

/// Liveness snapshot for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    /// False once the restart budget is exhausted or the handler stopped
    pub alive: bool,
    /// Total restarts since `start()`
    pub restarts: u32,
}

/// Construction-time options: extra event listeners and metrics exposure
#[derive(Default)]
pub struct HandlerOptions {
    /// Listeners invoked for every runtime event, in registration order,
    /// after the built-in metrics collector
    pub listeners: Vec<Arc<dyn EventListener>>,
    /// Metrics exposure mode; `None` disables exposure entirely
    pub exposure: Option<MetricsExposure>,
}

/// Bookkeeping for one supervised runner
struct RunnerSlot {
    worker: Arc<Worker>,
    handle: JoinHandle<()>,
    restart_times: VecDeque<Instant>,
}

pub struct TaskHandler {
    registry: Arc<WorkerRegistry>,
    client: Arc<ApiClient>,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    exposure_config: Option<MetricsExposure>,
    exposure: Mutex<Option<ExpositionHandle>>,
    state: Mutex<HandlerState>,
    statuses: Arc<Mutex<HashMap<String, WorkerStatus>>>,
    stop_tx: watch::Sender<Option<Duration>>,
    stop_rx: watch::Receiver<Option<Duration>>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandler {
    /// Create a handler for a populated registry. The registry is immutable
    /// from here on.
    pub fn new(registry: WorkerRegistry, settings: ServerSettings) -> shared::Result<Self> {
        Self::with_options(registry, settings, HandlerOptions::default())
    }

    pub fn with_options(
        registry: WorkerRegistry,
        settings: ServerSettings,
        options: HandlerOptions,
    ) -> shared::Result<Self> {
        let metrics = Arc::new(MetricsCollector::new());
        let mut listeners: Vec<Arc<dyn EventListener>> = vec![metrics.clone()];
        listeners.extend(options.listeners);
        let events = EventBus::new(listeners);

        let client = Arc::new(ApiClient::new(settings, events.clone())?);
        let (stop_tx, stop_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(false);

        Ok(Self {
            registry: Arc::new(registry),
            client,
            events,
            metrics,
            exposure_config: options.exposure,
            exposure: Mutex::new(None),
            state: Mutex::new(HandlerState::Stopped),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            stop_tx,
            stop_rx,
            done_tx: Arc::new(done_tx),
            done_rx,
            supervisor: Mutex::new(None),
        })
    }

    /// Spawn one runner per registered worker. Idempotent: a second call
    /// while running is a no-op. Startup errors (no workers, failed token
    /// exchange, failed task-definition registration) are fatal and leave
    /// the handler stopped.
    pub async fn start(&self) -> shared::Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == HandlerState::Running {
                debug!("Task handler already started");
                return Ok(());
            }
            if self.registry.is_empty() {
                return Err(shared::RuntimeError::Registration(
                    "no workers registered".to_string(),
                )
                .into());
            }
            *state = HandlerState::Running;
        }
        // Reset lifecycle signals from a previous start/stop cycle.
        let _ = self.stop_tx.send(None);
        let _ = self.done_tx.send(false);

        if let Err(error) = self.client.authenticate().await {
            *lock(&self.state) = HandlerState::Stopped;
            return Err(shared::RuntimeError::Network(format!(
                "initial token exchange failed: {error}"
            ))
            .into());
        }

        for worker in self.registry.workers() {
            let config = worker.config();
            if config.register_task_def {
                if let Err(error) = self
                    .client
                    .register_task_def(&worker.task_def(), config.overwrite_task_def)
                    .await
                {
                    *lock(&self.state) = HandlerState::Stopped;
                    return Err(shared::RuntimeError::Registration(format!(
                        "failed to register task definition '{}': {error}",
                        config.task_def_name
                    ))
                    .into());
                }
                info!(task_def = %config.task_def_name, "Registered task definition");
            }
        }

        if let Some(exposure_config) = &self.exposure_config {
            match exposition::spawn(self.metrics.clone(), exposure_config.clone()).await {
                Ok(handle) => *lock(&self.exposure) = Some(handle),
                Err(error) => {
                    *lock(&self.state) = HandlerState::Stopped;
                    return Err(error);
                }
            }
        }

        let mut slots = HashMap::new();
        {
            let mut statuses = lock(&self.statuses);
            statuses.clear();
            for worker in self.registry.workers() {
                let name = worker.task_def_name().to_string();
                statuses.insert(
                    name.clone(),
                    WorkerStatus {
                        alive: true,
                        restarts: 0,
                    },
                );
                slots.insert(
                    name,
                    RunnerSlot {
                        worker: Arc::clone(worker),
                        handle: self.spawn_runner(worker),
                        restart_times: VecDeque::new(),
                    },
                );
            }
        }

        let supervisor = tokio::spawn(supervise(
            slots,
            SupervisorContext {
                client: Arc::clone(&self.client),
                events: self.events.clone(),
                statuses: Arc::clone(&self.statuses),
                stop: self.stop_rx.clone(),
                done: Arc::clone(&self.done_tx),
            },
        ));
        *lock(&self.supervisor) = Some(supervisor);

        info!(workers = self.registry.len(), "Task handler started");
        Ok(())
    }

    fn spawn_runner(&self, worker: &Arc<Worker>) -> JoinHandle<()> {
        let runner = TaskRunner::new(
            Arc::clone(worker),
            Arc::clone(&self.client),
            self.events.clone(),
            self.stop_rx.clone(),
        );
        tokio::spawn(runner.run())
    }

    /// Stop with the default 30 second grace period
    pub async fn stop(&self) {
        self.stop_with_grace(Duration::from_secs(default_grace_period_seconds()))
            .await;
    }

    /// Signal every runner to stop, wait up to `grace` for a clean drain,
    /// force-terminate survivors, then close shared resources. Idempotent.
    pub async fn stop_with_grace(&self, grace: Duration) {
        {
            let mut state = lock(&self.state);
            if *state == HandlerState::Stopped {
                debug!("Task handler already stopped");
                return;
            }
            *state = HandlerState::Stopped;
        }
        info!(grace_seconds = grace.as_secs(), "Stopping task handler");

        let _ = self.stop_tx.send(Some(grace));

        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            let abort = handle.abort_handle();
            // The supervisor waits for the runners itself; the extra margin
            // covers its own bookkeeping.
            if tokio::time::timeout(grace + Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!("Supervisor did not finish within the grace period; aborting it");
                abort.abort();
            }
        }

        let exposure = lock(&self.exposure).take();
        if let Some(handle) = exposure {
            handle.stop().await;
        }

        info!("Task handler stopped");
    }

    /// Block until the handler has fully stopped (runner drain included).
    /// Used for CLI-style "run forever" processes.
    pub async fn join(&self) {
        if lock(&self.supervisor).is_none() && *lock(&self.state) == HandlerState::Stopped {
            return;
        }
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// True iff the handler is running and every runner is alive or was
    /// restarted within the supervision policy
    pub fn is_healthy(&self) -> bool {
        if *lock(&self.state) != HandlerState::Running {
            return false;
        }
        let statuses = lock(&self.statuses);
        !statuses.is_empty() && statuses.values().all(|status| status.alive)
    }

    /// Liveness and restart counts per worker
    pub fn get_worker_process_status(&self) -> HashMap<String, WorkerStatus> {
        lock(&self.statuses).clone()
    }

    pub fn state(&self) -> HandlerState {
        lock(&self.state).clone()
    }

    /// Built-in metrics collector, for embedding or direct scraping
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Convenience for long-running processes: start, run until SIGINT or
    /// SIGTERM, then stop within the default grace period.
    pub async fn run_with_signal_handling(&self) -> shared::Result<()> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        self.stop().await;
        Ok(())
    }
}

impl Drop for TaskHandler {
    fn drop(&mut self) {
        // Scoped-usage guarantee: leaving scope without an explicit stop
        // still signals the runners so they exit instead of idling forever.
        let _ = self.stop_tx.send(Some(Duration::ZERO));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SupervisorContext {
    client: Arc<ApiClient>,
    events: EventBus,
    statuses: Arc<Mutex<HashMap<String, WorkerStatus>>>,
    stop: watch::Receiver<Option<Duration>>,
    done: Arc<watch::Sender<bool>>,
}

/// Monitor runner liveness, restarting crashed runners within the policy
/// (at most N restarts per worker within window W), then coordinate the
/// drain once a stop is signalled.
async fn supervise(mut slots: HashMap<String, RunnerSlot>, context: SupervisorContext) {
    let max_restarts = default_max_restarts();
    let window = Duration::from_secs(default_restart_window_seconds());
    let mut stop = context.stop.clone();
    let mut check = tokio::time::interval(SUPERVISION_INTERVAL);

    loop {
        tokio::select! {
            _ = check.tick() => {
                // A runner observed stopping is draining, not crashing.
                if stop.borrow().is_some() {
                    break;
                }
                for (name, slot) in slots.iter_mut() {
                    if !slot.handle.is_finished() {
                        continue;
                    }

                    // The runner exited without a stop signal: a crash.
                    if let Err(join_error) = (&mut slot.handle).await {
                        warn!(worker = %name, error = %join_error, "Runner terminated abnormally");
                    } else {
                        warn!(worker = %name, "Runner exited unexpectedly");
                    }

                    let now = Instant::now();
                    while let Some(oldest) = slot.restart_times.front() {
                        if now.duration_since(*oldest) > window {
                            slot.restart_times.pop_front();
                        } else {
                            break;
                        }
                    }

                    if slot.restart_times.len() < max_restarts as usize {
                        slot.restart_times.push_back(now);
                        let runner = TaskRunner::new(
                            Arc::clone(&slot.worker),
                            Arc::clone(&context.client),
                            context.events.clone(),
                            context.stop.clone(),
                        );
                        slot.handle = tokio::spawn(runner.run());
                        context.events.publish(&WorkerEvent::WorkerRestarted {
                            task_type: name.clone(),
                        });
                        let mut statuses = context.statuses.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if let Some(status) = statuses.get_mut(name) {
                            status.alive = true;
                            status.restarts += 1;
                        }
                        info!(worker = %name, "Restarted crashed runner");
                    } else {
                        let mut statuses = context.statuses.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if statuses.get(name).map(|s| s.alive) != Some(false) {
                            error!(
                                worker = %name,
                                window_seconds = window.as_secs(),
                                "Restart budget exhausted; worker unhealthy until the window passes"
                            );
                        }
                        if let Some(status) = statuses.get_mut(name) {
                            status.alive = false;
                        }
                    }
                }
            }
            _ = stop.changed() => {
                if stop.borrow().is_some() {
                    break;
                }
            }
        }
    }

    // Stop path: the runners drain themselves within the grace period; wait
    // for them and force-terminate whatever is left.
    let grace = stop.borrow().unwrap_or(Duration::ZERO);
    let deadline = Instant::now() + grace + Duration::from_secs(1);
    loop {
        if slots.values().all(|slot| slot.handle.is_finished()) {
            break;
        }
        if Instant::now() >= deadline {
            let stragglers: Vec<&String> = slots
                .iter()
                .filter(|(_, slot)| !slot.handle.is_finished())
                .map(|(name, _)| name)
                .collect();
            warn!(?stragglers, "Force-terminating runners after the grace period");
            for slot in slots.values() {
                slot.handle.abort();
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    {
        let mut statuses = context
            .statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for status in statuses.values_mut() {
            status.alive = false;
        }
    }

    let _ = context.done.send(true);
    debug!("Supervisor finished");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(error) => {
                error!(%error, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(error) => {
                error!(%error, "Failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C");
    }
}
