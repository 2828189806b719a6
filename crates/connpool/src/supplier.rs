//! Driver-facing capabilities consumed by the pool.
//!
//! The pool knows nothing about wire protocols. A driver plugs in by
//! implementing [`ConnectionSupplier`], which opens [`PhysicalConnection`]s.
//! Both traits are deliberately narrow: open, execute a statement, check
//! validity, close, plus the small administrative subset the failover router
//! forwards.

use std::time::Duration;

use crate::error::DriverError;
use crate::key::Credentials;

/// A live, non-pooled session to a database.
pub trait PhysicalConnection: Send + std::fmt::Debug {
    /// Execute a statement, returning the number of affected rows.
    fn execute(&mut self, statement: &str) -> Result<u64, DriverError>;
    /// Cheap liveness check. Returns `true` if the session is usable.
    fn is_valid(&mut self) -> bool;
    /// Close the underlying session.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Factory for physical connections, supplied by the driver.
pub trait ConnectionSupplier: Send + Sync {
    /// Open one physical connection, with explicit credentials or with the
    /// supplier's defaults when `credentials` is `None`.
    fn open(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError>;

    /// Login timeout applied when opening connections.
    fn login_timeout(&self) -> Duration {
        Duration::ZERO
    }

    fn set_login_timeout(&self, _timeout: Duration) {}

    /// Human-readable driver description, e.g. `"postgres 16 @ db1:5432"`.
    fn describe(&self) -> String {
        "unknown driver".to_string()
    }

    /// Release supplier-level resources. Called once, after the owning pool
    /// has closed every connection.
    fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}
