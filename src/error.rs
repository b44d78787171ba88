use crate::record_store::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid schedule time '{0}', expected HH:MM")]
    InvalidScheduleTime(String),
}

/// The record query behind a selection failed. A run that hits this aborts
/// before touching any record or counter.
#[derive(Debug, Error)]
#[error("Record selection failed: {0}")]
pub struct SelectionError(#[from] pub anyhow::Error);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum UndoError {
    #[error("Nothing to undo: no recent bulk action, or it has expired")]
    NoBufferOrExpired,
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Invalid import data: {0}")]
    Format(String),
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Errors surfaced by [`crate::service::RefresherService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Undo(#[from] UndoError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("Record {0} not found")]
    RecordNotFound(RecordId),
    #[error("A refresh run is in progress, retry once it finishes")]
    RunInProgress,
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<SelectionError> for ServiceError {
    fn from(err: SelectionError) -> Self {
        ServiceError::Engine(EngineError::Selection(err))
    }
}
