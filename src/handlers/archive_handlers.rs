//! Read-only archive status for operators.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{errors::AppError, routes::AppState, services::archiver::ArchiveStatus};

/// `GET /archive/{container}/status`
///
/// Block, index and state object counts plus the lowest index id that has
/// no index file. 404 for an unknown container.
pub async fn archive_status(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Result<Json<ArchiveStatus>, AppError> {
    let status = ArchiveStatus::collect(state.store.as_ref(), &container, &state.keys).await?;
    tracing::debug!(?status, "archive status");
    Ok(Json(status))
}
