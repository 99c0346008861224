//! Agent metrics endpoint.
//!
//! Serves Prometheus text format on `/metrics` with two gauges: an info
//! gauge carrying version/os/arch labels, and the unix timestamp of the
//! last successful heartbeat. The heartbeat is what dashboards alert on
//! when an agent goes dark.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

/// Shared metrics state for the agent process.
pub struct MetricsState {
    /// Agent version (crate version)
    pub version: String,
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
    heartbeat: AtomicI64,
}

impl MetricsState {
    /// Create metrics state for this build.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            heartbeat: AtomicI64::new(0),
        }
    }

    /// Record a successful heartbeat at the current time.
    pub fn record_heartbeat(&self) {
        self.heartbeat
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        format!(
            "# HELP hostpool_agent_info Information about the hostpool agent\n\
             # TYPE hostpool_agent_info gauge\n\
             hostpool_agent_info{{version=\"{}\",os=\"{}\",arch=\"{}\"}} 1\n\
             # HELP hostpool_agent_last_heartbeat_timestamp Timestamp of the last successful heartbeat\n\
             # TYPE hostpool_agent_last_heartbeat_timestamp gauge\n\
             hostpool_agent_last_heartbeat_timestamp {}\n",
            self.version,
            self.os,
            self.arch,
            self.heartbeat.load(Ordering::Relaxed),
        )
    }
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> String {
    state.render()
}

/// Build the metrics router.
pub fn metrics_router(state: Arc<MetricsState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve(addr: std::net::SocketAddr, state: Arc<MetricsState>) {
    info!(%addr, "metrics server listening");
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, metrics_router(state)).await {
                error!(error = %e, "metrics server error");
            }
        }
        Err(e) => error!(error = %e, %addr, "failed to bind metrics address"),
    }
}
