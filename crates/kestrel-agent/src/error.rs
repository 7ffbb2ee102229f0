use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] kestrel_llm::LlmError),

    #[error("memory error: {0}")]
    Memory(#[from] kestrel_memory::MemoryError),

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("skill error: {0}")]
    Skill(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
