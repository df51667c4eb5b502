//! The trait a service implementation provides to the directory.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServiceError;

/// A named request/response handler.
///
/// The dispatcher coalesces concurrent requests by [`fingerprint`]: two
/// requests with the same fingerprint arriving while one is in flight
/// share a single execution and receive the same response. Returning a
/// distinct fingerprint per request opts out of coalescing entirely.
///
/// [`fingerprint`]: Handler::fingerprint
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Response: Clone + Send + Sync + 'static;

    /// Primary lookup name, unique within a directory.
    fn name(&self) -> String;

    /// Additional lookup names. Aliases that collide with an existing
    /// name are dropped at registration time.
    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    /// Equivalence key for coalescing and result caching. An `Err` here
    /// fails the request before any execution is claimed.
    fn fingerprint(&self, request: &Self::Request) -> Result<i64, ServiceError>;

    /// How long a completed response stays claimable by equal-fingerprint
    /// requests. Zero disables caching: the slot is evicted as soon as
    /// the execution completes and its attached waiters are served.
    fn cache_window(&self, _request: &Self::Request, _response: &Self::Response) -> Duration {
        Duration::ZERO
    }

    async fn execute(&self, request: Self::Request) -> Result<Self::Response, ServiceError>;
}
