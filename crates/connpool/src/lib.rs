//! connpool: a bounded, credential-keyed database connection pool.
//!
//! Wraps a driver-provided [`ConnectionSupplier`] and hands out
//! [`PooledConnection`] handles that return to the pool when dropped:
//! - **key**: [`ConnectionKey`] buckets, default or per-credentials
//! - **config**: [`PoolConfig`] (connection TTL, hard size cap, default acquire deadline)
//! - **pool**: the [`ConnectionPool`] engine with its strict cap, TTL recycling and parked waiters
//! - **connection**: the [`PooledConnection`] handle
//! - **supplier**: the narrow driver traits the pool consumes
//!
//! # Example
//!
//! ```rust,ignore
//! let config = PoolConfig::new(Duration::from_secs(60), 8)?;
//! let pool = ConnectionPool::new("primary", config, Arc::new(PgSupplier::new(url)));
//!
//! let mut conn = pool.acquire(&ConnectionKey::Default).await?;
//! conn.execute("SELECT 1")?;
//! drop(conn); // back to the idle store
//!
//! pool.shutdown();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod pool;
pub mod supplier;

pub use config::{PoolConfig, PoolSettings, parse_duration};
pub use connection::PooledConnection;
pub use error::{DriverError, PoolError, PoolResult};
pub use key::{ConnectionKey, Credentials};
pub use pool::{ConnectionPool, PoolStats};
pub use supplier::{ConnectionSupplier, PhysicalConnection};
