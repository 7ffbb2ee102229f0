use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
