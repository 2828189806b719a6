//! Error types for the connection pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors reported by a [`PhysicalConnection`](crate::PhysicalConnection) or
/// a [`ConnectionSupplier`](crate::ConnectionSupplier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("failed to open connection: {0}")]
    Open(String),

    #[error("statement failed: {0}")]
    Execute(String),

    #[error("failed to close connection: {0}")]
    Close(String),

    /// The physical connection was closed underneath the handle, usually
    /// because the owning pool was shut down.
    #[error("connection is closed")]
    Closed,
}

/// Errors surfaced to callers of [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Opening a physical connection failed. Never retried by the pool.
    #[error("connection supplier failed: {0}")]
    Supplier(#[from] DriverError),

    #[error("connection pool {0} is closed")]
    Closed(String),

    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}
