//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::StateError(_) => "CORE002",
            CoreError::ProcessSpawn(_) => "CORE003",
            CoreError::ProcessSignal(_) => "CORE004",
            CoreError::ProcessWait(_) => "CORE005",
            CoreError::Timeout(_) => "CORE006",
            CoreError::InitializationError(_) => "CORE007",
            CoreError::IoError(_) => "CORE008",
            CoreError::SerializationError(_) => "CORE009",
            CoreError::Other(_) => "CORE999",
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

// Convenience implementations
impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}
