//! Error types for service registration and dispatch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The directory refused to register a handler.
    #[error("registration rejected: {0}")]
    Registration(String),

    /// Dispatch never reached the handler (bad fingerprint, missing
    /// service, pool unavailable).
    #[error("request not proceeded: {0}")]
    NotProceeded(String),

    /// The handler itself failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The handler exceeded the configured execution timeout.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The execution was abandoned before it could settle (owner
    /// dropped, pool unit aborted).
    #[error("execution canceled: {0}")]
    Canceled(String),

    /// A failure observed through a coalesced execution owned by another
    /// caller.
    #[error("{0}")]
    Shared(Arc<ServiceError>),
}

impl From<Arc<ServiceError>> for ServiceError {
    fn from(error: Arc<ServiceError>) -> Self {
        ServiceError::Shared(error)
    }
}
