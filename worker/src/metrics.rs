//! Prometheus-shaped metrics collection
//!
//! The [`MetricsCollector`] is an event listener that maintains counters and
//! sliding-window quantile summaries keyed by metric name and label set, and
//! renders them in the Prometheus text exposition format. Quantiles are
//! computed over the most recent observations per label combination (window
//! size 1,000 by default).

use crate::events::{EventListener, WorkerEvent};
use shared::defaults::{metric_quantiles, quantile_window_size};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

type Labels = Vec<(&'static str, String)>;
type MetricKey = (&'static str, Labels);

/// Sliding window of observations with running count and sum
struct SummaryWindow {
    samples: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl SummaryWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            count: 0,
            sum: 0.0,
        }
    }

    fn observe(&mut self, value: f64, window_size: usize) {
        if self.samples.len() == window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.count += 1;
        self.sum += value;
    }

    /// Nearest-rank quantile over the current window
    fn quantile(&self, q: f64) -> f64 {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (q * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Built-in listener that turns runtime events into Prometheus metrics
pub struct MetricsCollector {
    counters: Mutex<BTreeMap<MetricKey, u64>>,
    summaries: Mutex<BTreeMap<MetricKey, SummaryWindow>>,
    window_size: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            summaries: Mutex::new(BTreeMap::new()),
            window_size: quantile_window_size(),
        }
    }

    fn increment(&self, name: &'static str, labels: Labels) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry((name, labels)).or_insert(0) += 1;
    }

    fn observe(&self, name: &'static str, labels: Labels, value: f64) {
        let mut summaries = self.summaries.lock().unwrap_or_else(|p| p.into_inner());
        summaries
            .entry((name, labels))
            .or_insert_with(SummaryWindow::new)
            .observe(value, self.window_size);
    }

    /// Current value of a counter, for tests and health checks
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters
            .iter()
            .find(|((n, l), _)| {
                *n == name
                    && l.len() == labels.len()
                    && l.iter()
                        .zip(labels.iter())
                        .all(|((lk, lv), (k, v))| lk == k && lv == v)
            })
            .map(|(_, value)| *value)
            .unwrap_or(0)
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::new();

        {
            let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
            let mut current_name = "";
            for ((name, labels), value) in counters.iter() {
                if *name != current_name {
                    let _ = writeln!(out, "# TYPE {} counter", name);
                    current_name = *name;
                }
                let _ = writeln!(out, "{}{} {}", name, render_labels(labels, None), value);
            }
        }

        {
            let summaries = self.summaries.lock().unwrap_or_else(|p| p.into_inner());
            let mut current_name = "";
            for ((name, labels), window) in summaries.iter() {
                if *name != current_name {
                    let _ = writeln!(out, "# TYPE {} summary", name);
                    current_name = *name;
                }
                for q in metric_quantiles() {
                    let _ = writeln!(
                        out,
                        "{}{} {}",
                        name,
                        render_labels(labels, Some(*q)),
                        window.quantile(*q)
                    );
                }
                let _ = writeln!(
                    out,
                    "{}_count{} {}",
                    name,
                    render_labels(labels, None),
                    window.count
                );
                let _ = writeln!(
                    out,
                    "{}_sum{} {}",
                    name,
                    render_labels(labels, None),
                    window.sum
                );
            }
        }

        out
    }
}

fn render_labels(labels: &Labels, quantile: Option<f64>) -> String {
    if labels.is_empty() && quantile.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, escape_label(value)))
        .collect();
    if let Some(q) = quantile {
        parts.push(format!("quantile=\"{}\"", q));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn seconds(duration: &Duration) -> f64 {
    duration.as_secs_f64()
}

impl EventListener for MetricsCollector {
    fn on_event(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::PollStarted { task_type, .. } => {
                self.increment("task_poll_total", vec![("taskType", task_type.clone())]);
            }
            WorkerEvent::PollCompleted {
                task_type,
                duration,
                ..
            } => {
                self.observe(
                    "task_poll_time_seconds",
                    vec![
                        ("taskType", task_type.clone()),
                        ("status", "SUCCESS".to_string()),
                    ],
                    seconds(duration),
                );
            }
            WorkerEvent::PollFailure {
                task_type,
                duration,
                ..
            } => {
                self.observe(
                    "task_poll_time_seconds",
                    vec![
                        ("taskType", task_type.clone()),
                        ("status", "FAILURE".to_string()),
                    ],
                    seconds(duration),
                );
            }
            WorkerEvent::TaskExecutionStarted { .. } => {}
            WorkerEvent::TaskExecutionCompleted {
                task_type,
                duration,
                output_size_bytes,
                status,
                ..
            } => {
                self.observe(
                    "task_execute_time_seconds",
                    vec![
                        ("taskType", task_type.clone()),
                        ("status", status.as_str().to_string()),
                    ],
                    seconds(duration),
                );
                self.observe(
                    "task_result_size",
                    vec![("taskType", task_type.clone())],
                    *output_size_bytes as f64,
                );
            }
            WorkerEvent::TaskExecutionFailure {
                task_type,
                duration,
                cause,
                status,
                ..
            } => {
                self.observe(
                    "task_execute_time_seconds",
                    vec![
                        ("taskType", task_type.clone()),
                        ("status", status.as_str().to_string()),
                    ],
                    seconds(duration),
                );
                self.increment(
                    "task_execute_error_total",
                    vec![
                        ("taskType", task_type.clone()),
                        ("exception", cause.clone()),
                    ],
                );
            }
            WorkerEvent::TaskUpdateCompleted {
                task_type,
                duration,
                status,
            } => {
                self.observe(
                    "task_update_time_seconds",
                    vec![
                        ("taskType", task_type.clone()),
                        ("status", status.as_str().to_string()),
                    ],
                    seconds(duration),
                );
            }
            WorkerEvent::TaskUpdateFailure {
                task_type, cause, ..
            } => {
                self.increment(
                    "task_update_error_total",
                    vec![
                        ("taskType", task_type.clone()),
                        ("exception", cause.clone()),
                    ],
                );
            }
            WorkerEvent::TaskPaused { task_type } => {
                self.increment("task_paused_total", vec![("taskType", task_type.clone())]);
            }
            WorkerEvent::WorkerRestarted { task_type } => {
                self.increment(
                    "worker_restart_total",
                    vec![("taskType", task_type.clone())],
                );
            }
            WorkerEvent::HttpRequest {
                method,
                uri,
                status,
                duration,
            } => {
                self.observe(
                    "http_api_client_request",
                    vec![
                        ("method", method.clone()),
                        ("uri", uri.clone()),
                        ("status", status.clone()),
                    ],
                    seconds(duration),
                );
            }
        }
    }
}
