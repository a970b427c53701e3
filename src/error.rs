use thiserror::Error;

/// Main error type for the trading pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors (rejected before enqueue / persist)
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state for {operation}: order is {state}")]
    InvalidState { operation: String, state: String },

    // Execution errors
    #[error("Retryable execution failure: {0}")]
    RetryableExecution(String),

    #[error("Terminal execution failure: {0}")]
    TerminalExecution(String),

    #[error("Signal too old to act on: {age_secs}s")]
    StaleSignal { age_secs: i64 },

    // Crash-recovery errors
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
