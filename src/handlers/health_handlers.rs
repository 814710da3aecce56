//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness of the local store: SQLite and payload disk

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

use crate::{routes::AppState, services::local_store::LocalObjectStore};

/// `GET /healthz`
///
/// Never touches the store.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when both the metadata database answers and a scratch file can be
/// written, read back and removed under the payload directory; 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", probe_sqlite(&state.store).await);
    checks.insert("disk", probe_disk(&state.store).await);

    let ready = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_sqlite(store: &LocalObjectStore) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM containers")
        .fetch_one(&*store.db)
        .await
    {
        Ok(_) => CheckStatus::passed(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

async fn probe_disk(store: &LocalObjectStore) -> CheckStatus {
    let probe = store.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::failed(format!("could not write probe file: {}", e));
    }
    let read = fs::read(&probe).await;
    let removed = fs::remove_file(&probe).await;
    match (read, removed) {
        (Ok(bytes), _) if bytes != b"readyz" => CheckStatus::failed("probe file content mismatch"),
        (Ok(_), Ok(())) => CheckStatus::passed(),
        (Ok(_), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe file: {}", e)),
        },
        (Err(e), _) => CheckStatus::failed(format!("could not read probe file: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn passed() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeKeys;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    #[tokio::test]
    async fn ready_when_database_and_disk_respond() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::in_memory(dir.path()).await.unwrap();
        let state = AppState {
            store: Arc::new(store),
            keys: Arc::new(AttributeKeys::default()),
        };

        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn not_ready_without_payload_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::in_memory(dir.path().join("absent")).await.unwrap();
        let state = AppState {
            store: Arc::new(store),
            keys: Arc::new(AttributeKeys::default()),
        };

        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        assert_eq!(healthz().await.into_response().status(), StatusCode::OK);
    }
}
