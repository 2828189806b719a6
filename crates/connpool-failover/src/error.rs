//! Error types for the failover router.

use connpool::PoolError;
use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors surfaced to callers of [`FailoverRouter`](crate::FailoverRouter).
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failover router is closed")]
    Closed,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("invalid monitor configuration: {0}")]
    Config(String),
}
