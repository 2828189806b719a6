//! connpool-failover: master/slave routing over two [`connpool`] pools.
//!
//! A [`FailoverRouter`] owns a primary and a secondary [`ConnectionPool`](connpool::ConnectionPool)
//! and a [`LivenessMonitor`] that keeps probing the primary:
//! - **checker**: one probe, plus the [`ProbeTracker`] failure counter and backoff
//! - **monitor**: the paced background probe loop and its [`LivenessStatus`] cell
//! - **router**: routing, administrative delegation, and lifecycle
//! - **config**: failover.toml loading
//!
//! # Example
//!
//! ```rust,ignore
//! let config = FailoverConfig::from_file(Path::new("failover.toml"))?;
//! let router = FailoverRouter::from_config(&config, primary_supplier, secondary_supplier)?;
//!
//! let mut conn = router.acquire().await?;
//! conn.execute("UPDATE jobs SET state = 'done' WHERE id = 7")?;
//! drop(conn);
//!
//! router.close().await;
//! ```

pub mod checker;
pub mod config;
pub mod error;
pub mod monitor;
pub mod router;

pub use checker::{ProbeFailure, ProbeTracker, probe};
pub use config::{FailoverConfig, MonitorConfig, MonitorSettings};
pub use error::{RouterError, RouterResult};
pub use monitor::{LivenessMonitor, LivenessStatus};
pub use router::{FailoverRouter, Route, RouterState};
