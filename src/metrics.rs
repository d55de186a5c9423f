//! Prometheus metrics infrastructure for k2.
//!
//! This module installs the process-global metrics recorder and serves the
//! rendered snapshot over HTTP at `GET /metrics`. The counters themselves are
//! emitted with the `metrics` macros where the events happen:
//!
//! | Metric                            | Kind    | Labels    |
//! |-----------------------------------|---------|-----------|
//! | `k2_connections_total`            | counter |           |
//! | `k2_connections_active`           | gauge   |           |
//! | `k2_messages_accepted_total`      | counter | `topic`   |
//! | `k2_bytes_appended_total`         | counter |           |
//! | `k2_partition_files_opened_total` | counter |           |
//! | `k2_protocol_errors_total`        | counter | `kind`    |
//! | `k2_unsupported_requests_total`   | counter | `request` |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,
}

/// Cheaply cloneable handle to the installed Prometheus recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current metrics snapshot in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

/// Guard to ensure the global recorder is installed at most once per process.
static RECORDER_HANDLE: std::sync::OnceLock<MetricsHandle> = std::sync::OnceLock::new();

/// Install the global Prometheus metrics recorder.
///
/// Must be called before any `metrics` macro fires for the values to be kept.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] on a second call in the same process.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let mut was_set = false;
    let handle = RECORDER_HANDLE.get_or_init(|| {
        was_set = true;
        let recorder = PrometheusBuilder::new().build_recorder();
        let prom_handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "another metrics recorder is already installed");
        }
        MetricsHandle {
            inner: Arc::new(prom_handle),
        }
    });

    if was_set {
        Ok(handle.clone())
    } else {
        Err(MetricsError::AlreadyInstalled)
    }
}

/// Returns the previously installed [`MetricsHandle`], if any.
///
/// Useful in tests where another test in the same process may already have
/// installed the recorder.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

/// Build the axum [`Router`] that serves Prometheus metrics at `GET /metrics`.
fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move {
                let body = h.render();
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    )
}

/// Spawn an axum HTTP server that serves Prometheus metrics on `addr`.
///
/// On bind failure, logs `tracing::error!` and returns a `JoinHandle` that
/// resolves immediately. Metrics are never allowed to take the broker down.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
                return;
            }
        };
        run_metrics_server(handle, listener).await;
    })
}

/// Spawn the metrics HTTP server on an already-bound listener.
///
/// Useful in tests that need to know the ephemeral port up front.
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(run_metrics_server(handle, listener))
}

async fn run_metrics_server(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    let app = metrics_router(handle);

    match listener.local_addr() {
        Ok(bound_addr) => tracing::info!(addr = %bound_addr, "Metrics server listening"),
        Err(e) => tracing::warn!(error = %e, "Metrics listener has no local address"),
    }

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Metrics server error");
    }
}
