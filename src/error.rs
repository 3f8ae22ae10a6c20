//! Error types for workqueue.

use crate::model::WorkId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A required identifier argument was missing or empty.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// `do_work` was asked for an empty or unregistered work type.
    #[error("work type invalid: {0:?}")]
    WorkTypeInvalid(String),

    /// The item is absent or not in a state that allows the operation.
    /// Deliberately does not say which.
    #[error("work item {0} not found or in wrong status")]
    WorkNotFoundOrWrongStatus(WorkId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
