//! Metrics exposure: embedded HTTP endpoint or file sink
//!
//! Exactly one exposure mode is active per handler. The HTTP mode serves
//! `GET /metrics` in the Prometheus text format plus `GET /health`; the
//! file mode rewrites a `metrics.prom` file in a configurable directory at
//! a configurable interval.

use crate::metrics::MetricsCollector;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// File name written by the file sink
const METRICS_FILE_NAME: &str = "metrics.prom";

/// Content type of the Prometheus text exposition format
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// How metrics leave the process
#[derive(Debug, Clone)]
pub enum MetricsExposure {
    /// Embedded HTTP server bound to this port (0 picks a free port)
    Http { port: u16 },
    /// Periodic dump into `directory/metrics.prom`
    File {
        directory: PathBuf,
        interval: Duration,
    },
}

/// Handle to a running exposure task
pub(crate) struct ExpositionHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    /// Bound address of the HTTP server, when that mode is active
    pub(crate) local_addr: Option<SocketAddr>,
}

impl ExpositionHandle {
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .is_err()
        {
            warn!("Metrics exposure did not stop cleanly; aborting it");
            abort.abort();
        }
    }
}

/// Start the configured exposure. Binding failures are startup errors.
pub(crate) async fn spawn(
    metrics: Arc<MetricsCollector>,
    exposure: MetricsExposure,
) -> shared::Result<ExpositionHandle> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match exposure {
        MetricsExposure::Http { port } => {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|e| {
                    shared::RuntimeError::Config(format!(
                        "failed to bind metrics endpoint on port {port}: {e}"
                    ))
                })?;
            let local_addr = listener.local_addr().ok();
            if let Some(addr) = local_addr {
                info!(%addr, "Serving metrics endpoint");
            }

            let app = router(metrics);
            let mut shutdown_rx = shutdown_rx;
            let handle = tokio::spawn(async move {
                let shutdown = async move {
                    let _ = shutdown_rx.changed().await;
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %e, "Metrics endpoint failed");
                }
            });

            Ok(ExpositionHandle {
                shutdown: shutdown_tx,
                handle,
                local_addr,
            })
        }
        MetricsExposure::File {
            directory,
            interval,
        } => {
            std::fs::create_dir_all(&directory).map_err(|e| {
                shared::RuntimeError::Config(format!(
                    "failed to create metrics directory {}: {e}",
                    directory.display()
                ))
            })?;
            info!(directory = %directory.display(), "Writing metrics to file");

            let mut shutdown_rx = shutdown_rx;
            let handle = tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = write_metrics_file(&metrics, &directory) {
                                warn!(error = %e, "Failed to write metrics file");
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            // One final flush so the last observations land.
                            if let Err(e) = write_metrics_file(&metrics, &directory) {
                                warn!(error = %e, "Failed to write final metrics file");
                            }
                            break;
                        }
                    }
                }
            });

            Ok(ExpositionHandle {
                shutdown: shutdown_tx,
                handle,
                local_addr: None,
            })
        }
    }
}

fn router(metrics: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/health", get(serve_health))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render(),
    )
}

async fn serve_health() -> impl IntoResponse {
    "OK"
}

/// Write the rendered metrics atomically: to a temporary file first, then
/// rename over the target so scrapers never read a partial dump.
fn write_metrics_file(metrics: &MetricsCollector, directory: &Path) -> std::io::Result<()> {
    let target = directory.join(METRICS_FILE_NAME);
    let staging = directory.join(format!("{METRICS_FILE_NAME}.tmp"));
    std::fs::write(&staging, metrics.render())?;
    std::fs::rename(&staging, &target)
}
