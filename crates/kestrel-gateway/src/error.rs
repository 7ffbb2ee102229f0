use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no adapter registered for channel: {0}")]
    UnknownChannel(String),

    #[error("adapter '{channel}' error: {reason}")]
    Adapter { channel: String, reason: String },

    #[error("send not supported by '{channel}': {what}")]
    Unsupported { channel: String, what: String },

    #[error("session error: {0}")]
    Session(#[from] kestrel_sessions::SessionError),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
