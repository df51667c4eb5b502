//! stellwerk-service: named request/response services on top of the
//! stellwerk runtime, with fingerprint-based request coalescing and
//! windowed result caching.

pub mod directory;
pub mod error;
pub mod handler;
pub mod service;

pub use directory::ServiceDirectory;
pub use error::ServiceError;
pub use handler::Handler;
pub use service::{Dispatched, Origin, ResponsePromise, Service, ServiceStats};
