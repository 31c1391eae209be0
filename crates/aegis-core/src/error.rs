use thiserror::Error;

/// Top-level error taxonomy. Subsystem crates define their own error enums;
/// this is the shape surfaced at the gateway boundary.
#[derive(Debug, Error)]
pub enum AegisError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("Operation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AegisError {
    /// Short error code string included in wire `{error}` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AegisError::Config(_) => "CONFIG_ERROR",
            AegisError::BadRequest(_) => "BAD_REQUEST",
            AegisError::SandboxUnavailable(_) => "SANDBOX_UNAVAILABLE",
            AegisError::CopyFailed(_) => "COPY_FAILED",
            AegisError::Timeout { .. } => "TIMEOUT",
            AegisError::Llm(_) => "LLM_ERROR",
            AegisError::Database(_) => "DATABASE_ERROR",
            AegisError::Serialization(_) => "SERIALIZATION_ERROR",
            AegisError::Io(_) => "IO_ERROR",
            AegisError::Cancelled => "CANCELLED",
            AegisError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AegisError>;
