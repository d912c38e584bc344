//! Operator-facing HTTP API.
//!
//! - POST   /systems/{id}/renew                      force a renewal
//! - GET    /queue                                   queue items
//! - DELETE /queue/{system_id}                       cancel queued work
//! - GET    /reconciliation                          latest classification report
//! - POST   /reconciliation/points/{username}/push   local point to partner API
//! - POST   /reconciliation/points/{username}/pull   partner API point to local store
//! - POST   /captures                                extract credentials from posted text
//! - GET    /health

pub mod error;
pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{audit::AuditSink, reconcile::ReconciliationService, renewal::RenewalController};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RenewalController>,
    /// Absent when the partner API is disabled.
    pub reconciliation: Option<Arc<ReconciliationService>>,
    pub audit: Arc<dyn AuditSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/systems/{id}/renew", post(handlers::force_renew))
        .route("/queue", get(handlers::list_queue))
        .route("/queue/{system_id}", delete(handlers::cancel))
        .route("/reconciliation", get(handlers::reconciliation_report))
        .route("/reconciliation/points/{username}/push", post(handlers::push_point))
        .route("/reconciliation/points/{username}/pull", post(handlers::pull_point))
        .route("/captures", post(handlers::submit_capture))
        .with_state(state)
}

/// Serve the router on `bind` until `shutdown` fires.
pub async fn serve(bind: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Operator API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
