use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No games to compute a table from")]
    EmptyInput,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {0} is already processing")]
    AlreadyProcessing(String),

    #[error("Job execution exceeded {0} ms")]
    Timeout(u64),

    #[error("Automation is stopped")]
    AutomationStopped,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient errors are retried by the processor up to `max_retries`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::StorageError(_))
    }

    /// Stable tag recorded in history entries and returned by the admin API.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::EmptyInput => "empty_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyProcessing(_) => "already_processing",
            EngineError::Timeout(_) => "timeout",
            EngineError::AutomationStopped => "automation_stopped",
            EngineError::StorageError(_) => "storage_error",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
