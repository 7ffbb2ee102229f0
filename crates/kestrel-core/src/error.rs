use thiserror::Error;

#[derive(Debug, Error)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity file error: {0}")]
    Identity(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Gateway error ({channel}): {reason}")]
    Gateway { channel: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KestrelError>;
