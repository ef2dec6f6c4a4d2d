//! Store errors that callers must be able to tell apart (HTTP status mapping).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("invalid payload, missing or invalid fields: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("ledger actor for project {0} is not running")]
    ActorClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
