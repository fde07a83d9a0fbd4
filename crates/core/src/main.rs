use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use coordinator_core::daemon::{BootstrapError, Daemon};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Shared state for the diagnostics HTTP server (`/health`, `/metrics`).
/// Deliberately separate from the control-plane protocol (C5): this is an
/// internal operability surface, not a client-facing one.
struct DiagnosticsState {
    daemon: Arc<Daemon>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("coordinator daemon starting");

    let config_dir = std::env::var("COORDINATOR_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    let (daemon, events_rx) = match Daemon::bootstrap(config_dir).await {
        Ok(pair) => pair,
        Err(BootstrapError::Config(e)) => {
            tracing::error!(error = %e, "invalid configuration — refusing to start");
            return ExitCode::from(2);
        }
        Err(BootstrapError::Store(e)) => {
            tracing::error!(error = %e, "shared-state store unreachable at startup");
            return ExitCode::from(3);
        }
    };

    tracing::info!("configuration loaded, shared-state store reachable");

    let diagnostics_state = Arc::new(DiagnosticsState {
        daemon: Arc::clone(&daemon),
        metrics_handle,
    });
    let diagnostics_app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(diagnostics_state);

    let port: u16 = std::env::var("COORDINATOR_METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9090);

    let diagnostics_listener = match tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, port, "failed to bind diagnostics listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!(port, "diagnostics endpoint listening on localhost");

    let diagnostics_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(diagnostics_listener, diagnostics_app).await {
            tracing::error!(error = %e, "diagnostics HTTP server exited");
        }
    });

    let exit_code = daemon.run(events_rx).await;
    diagnostics_task.abort();
    exit_code
}

/// Checks the shared-state store and issue-tracker circuit breakers; the
/// control-plane equivalent lives at the `health.check` command.
async fn health_handler(State(state): State<Arc<DiagnosticsState>>) -> impl IntoResponse {
    let body = state.daemon.health_snapshot_for_diagnostics().await;
    let healthy = body
        .get("healthy")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn metrics_handler(State(state): State<Arc<DiagnosticsState>>) -> String {
    state.metrics_handle.render()
}
