use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickworkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job definition ({job}): {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TickworkError {
    /// Short error code string used in structured log lines.
    pub fn code(&self) -> &'static str {
        match self {
            TickworkError::Config(_) => "CONFIG_ERROR",
            TickworkError::InvalidJob { .. } => "INVALID_JOB",
            TickworkError::Serialization(_) => "SERIALIZATION_ERROR",
            TickworkError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TickworkError>;
