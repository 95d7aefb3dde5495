//! Status HTTP server for Clip Relay
//!
//! Read-only JSON view of the daemon for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server stopped: {0}")]
    Serve(std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Bind the status listener; failures surface before any task is spawned
pub async fn bind_status_listener(addr: &str) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "status server listening");
    }
    Ok(listener)
}

/// Serve the status endpoint on an already bound listener
pub async fn serve_status(listener: TcpListener, status: SharedStatus) -> Result<(), ServerError> {
    axum::serve(listener, create_status_router(status))
        .await
        .map_err(ServerError::Serve)
}

/// Serve the status endpoint on `addr` until the task is aborted
pub async fn run_status_server(status: SharedStatus, addr: &str) -> Result<(), ServerError> {
    let listener = bind_status_listener(addr).await?;
    serve_status(listener, status).await
}
