use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    models::{codec::CodecError, object::ObjectId},
    services::{ledger::LedgerError, object_store::StoreError},
};

/// Errors raised by the archival pipelines.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("container `{container}` magic {found:?} does not match chain magic {expected}")]
    MagicMismatch {
        container: String,
        expected: u32,
        found: Option<String>,
    },
    #[error("ledger does not retain full state, snapshots cannot be exported")]
    StateNotRetained,
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("block {height} is not present in the store, index {index_id} cannot be completed")]
    MissingBlock { height: u32, index_id: u32 },
    #[error("store returned an empty object id for {what}")]
    EmptyObjectId { what: String },
    #[error("object {id} has a malformed {what}")]
    Malformed { id: ObjectId, what: String },
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ArchiveError>,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

impl ArchiveError {
    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::Store(err) => err.is_transient(),
            ArchiveError::Ledger(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Single-slot, non-blocking error report shared by a set of workers.
///
/// Only the first reported error is kept; later reports are dropped so a
/// slow worker never blocks on a full channel.
#[derive(Clone)]
pub struct ErrorSlot {
    tx: mpsc::Sender<ArchiveError>,
}

pub struct ErrorSlotReceiver {
    rx: mpsc::Receiver<ArchiveError>,
}

impl ErrorSlot {
    pub fn new() -> (Self, ErrorSlotReceiver) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, ErrorSlotReceiver { rx })
    }

    /// Offer an error. Returns `false` when another error got there first.
    pub fn report(&self, err: ArchiveError) -> bool {
        self.tx.try_send(err).is_ok()
    }
}

impl ErrorSlotReceiver {
    /// Wait for a reported error. Resolves to `None` once every `ErrorSlot`
    /// handle is gone without reporting.
    pub async fn recv(&mut self) -> Option<ArchiveError> {
        self.rx.recv().await
    }

    /// Take a reported error without waiting.
    pub fn take(&mut self) -> Option<ArchiveError> {
        self.rx.try_recv().ok()
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Store(StoreError::ContainerNotFound(_)) => {
                AppError::not_found(err.to_string())
            }
            other => AppError::internal(other.to_string()),
        }
    }
}
