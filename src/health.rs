//! Health check HTTP endpoint for deployment platform monitoring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::database::Database;

/// State shared with the health handlers.
#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<Database>,
}

/// Start the health check HTTP server.
pub async fn start_health_server(port: u16, state: HealthState) {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(port = port, "Starting health check server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind health check port");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Health check server failed");
    }
}

/// Liveness plus a database probe: 200 when the store answers, 503 otherwise.
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

/// Spawn the health check server as a background task.
pub fn spawn_health_server(port: u16, state: HealthState) {
    tokio::spawn(async move {
        start_health_server(port, state).await;
    });
}
