//! Defines the operator-facing HTTP routes.
//!
//! ## Structure
//! - `GET /healthz` — liveness
//! - `GET /readyz` — readiness of the local store (SQLite and payload disk)
//! - `GET /archive/{container}/status` — block, index and state object counts

use crate::{
    config::AttributeKeys,
    handlers::{
        archive_handlers::archive_status,
        health_handlers::{healthz, readyz},
    },
    services::local_store::LocalObjectStore,
};
use axum::{Router, routing::get};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LocalObjectStore>,
    pub keys: Arc<AttributeKeys>,
}

/// Build the router; the caller attaches an [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/archive/{container}/status", get(archive_status))
}
