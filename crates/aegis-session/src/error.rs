use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("LLM backend error: {0}")]
    Llm(#[from] aegis_llm::LlmError),

    #[error("Store error: {0}")]
    Store(#[from] aegis_store::StoreError),

    #[error("Sandbox error: {0}")]
    Vm(#[from] aegis_vm::VmError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
