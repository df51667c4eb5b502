use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur in the stellwerk runtime layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unit canceled: {0}")]
    Canceled(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unit failed: {0}")]
    Task(String),

    #[error("host '{0}' is not running")]
    HostNotRunning(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("settings persistence error: {0}")]
    Persist(String),
}

/// Shared form of a unit failure, cheap to fan out to every waiter.
pub type TaskError = Arc<RuntimeError>;
