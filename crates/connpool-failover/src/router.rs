//! The failover router.
//!
//! ```text
//! acquire() ──► status.is_alive()? ──yes──► primary pool
//!                      │
//!                      no ───────────────► secondary pool
//!
//! LivenessMonitor ──probe──► primary pool
//!        └──────writes──────► status
//! ```
//!
//! Routing is decided afresh on every call and never fails by itself; a
//! caller may race the monitor and get the primary just as it goes down.
//! Connections already handed out by the primary are left alone when it is
//! marked down.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use connpool::{
    ConnectionKey, ConnectionPool, ConnectionSupplier, PoolConfig, PoolError, PooledConnection,
};
use tracing::{debug, info};

use crate::config::{FailoverConfig, MonitorConfig};
use crate::error::{RouterError, RouterResult};
use crate::monitor::{LivenessMonitor, LivenessStatus};

/// Lifecycle of a [`FailoverRouter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterState {
    Running = 0,
    Closing = 1,
    Closed = 2,
}

impl RouterState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RouterState::Running,
            1 => RouterState::Closing,
            _ => RouterState::Closed,
        }
    }
}

/// Which pool a new connection request goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Primary,
    Secondary,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Primary => write!(f, "primary"),
            Route::Secondary => write!(f, "secondary"),
        }
    }
}

/// Routes connection requests to the primary pool while it answers probes,
/// and to the secondary pool while it does not.
pub struct FailoverRouter {
    primary: ConnectionPool,
    secondary: ConnectionPool,
    status: LivenessStatus,
    monitor: Mutex<Option<LivenessMonitor>>,
    state: AtomicU8,
    stop_timeout: Duration,
}

impl FailoverRouter {
    /// Build a router over two existing pools and start monitoring the
    /// primary. Must be called from within a Tokio runtime.
    pub fn new(
        primary: ConnectionPool,
        secondary: ConnectionPool,
        monitor: MonitorConfig,
    ) -> RouterResult<Self> {
        monitor.validate()?;

        let status = LivenessStatus::default();
        let stop_timeout = monitor.stop_timeout;
        let handle = LivenessMonitor::start(primary.clone(), monitor, status.clone());

        info!(
            primary = %primary.name(),
            secondary = %secondary.name(),
            "failover router started"
        );
        Ok(Self {
            primary,
            secondary,
            status,
            monitor: Mutex::new(Some(handle)),
            state: AtomicU8::new(RouterState::Running as u8),
            stop_timeout,
        })
    }

    /// Build both pools from their suppliers and start the router.
    ///
    /// Each pool gets one slot on top of its configured size. On the primary
    /// that slot is reserved for the monitor's probe, so callers saturating
    /// the primary cannot starve the probe and get a busy primary marked down.
    pub fn with_pooling(
        primary_supplier: Arc<dyn ConnectionSupplier>,
        primary_config: PoolConfig,
        secondary_supplier: Arc<dyn ConnectionSupplier>,
        secondary_config: PoolConfig,
        monitor: MonitorConfig,
    ) -> RouterResult<Self> {
        let primary = ConnectionPool::new(
            Route::Primary.to_string(),
            primary_config.with_reserved_capacity(1),
            primary_supplier,
        );
        let secondary = ConnectionPool::new(
            Route::Secondary.to_string(),
            secondary_config.with_extra_capacity(1),
            secondary_supplier,
        );
        Self::new(primary, secondary, monitor)
    }

    /// Build a router from a parsed failover.toml.
    pub fn from_config(
        config: &FailoverConfig,
        primary_supplier: Arc<dyn ConnectionSupplier>,
        secondary_supplier: Arc<dyn ConnectionSupplier>,
    ) -> RouterResult<Self> {
        Self::with_pooling(
            primary_supplier,
            config.primary_pool()?,
            secondary_supplier,
            config.secondary_pool()?,
            config.monitor_config()?,
        )
    }

    /// The pool a request made now would go to.
    pub fn route(&self) -> Route {
        if self.status.is_alive() {
            Route::Primary
        } else {
            Route::Secondary
        }
    }

    pub fn state(&self) -> RouterState {
        RouterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_primary_alive(&self) -> bool {
        self.status.is_alive()
    }

    pub fn status(&self) -> &LivenessStatus {
        &self.status
    }

    pub fn primary(&self) -> &ConnectionPool {
        &self.primary
    }

    pub fn secondary(&self) -> &ConnectionPool {
        &self.secondary
    }

    /// Check out a connection with the pools' default credentials.
    pub async fn acquire(&self) -> RouterResult<PooledConnection> {
        self.acquire_key(&ConnectionKey::Default).await
    }

    /// Check out a connection authenticated as `username`.
    pub async fn acquire_as(
        &self,
        username: &str,
        password: &str,
    ) -> RouterResult<PooledConnection> {
        let key = ConnectionKey::with_credentials(username, password);
        self.acquire_key(&key).await
    }

    async fn acquire_key(&self, key: &ConnectionKey) -> RouterResult<PooledConnection> {
        if self.state() != RouterState::Running {
            return Err(RouterError::Closed);
        }

        let route = self.route();
        debug!(%route, key = %key, "routing connection request");
        let pool = match route {
            Route::Primary => &self.primary,
            Route::Secondary => &self.secondary,
        };

        pool.acquire(key).await.map_err(|e| match e {
            PoolError::Closed(_) if self.state() != RouterState::Running => RouterError::Closed,
            e => RouterError::Pool(e),
        })
    }

    /// Login timeout as reported by the primary.
    pub fn login_timeout(&self) -> Duration {
        self.primary.login_timeout()
    }

    /// Apply a login timeout to both pools.
    pub fn set_login_timeout(&self, timeout: Duration) {
        self.primary.set_login_timeout(timeout);
        self.secondary.set_login_timeout(timeout);
    }

    /// Driver description as reported by the primary.
    pub fn describe(&self) -> String {
        self.primary.describe()
    }

    /// Stop the monitor and shut down both pools. Returns the number of
    /// physical connections closed; calls after the first return 0.
    pub async fn close(&self) -> usize {
        if self
            .state
            .compare_exchange(
                RouterState::Running as u8,
                RouterState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("failover router already closed");
            return 0;
        }

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop(self.stop_timeout).await;
        }

        let closed = self.primary.shutdown() + self.secondary.shutdown();
        self.state.store(RouterState::Closed as u8, Ordering::Release);
        info!(closed, "failover router closed");
        closed
    }
}

impl fmt::Debug for FailoverRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverRouter")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .field("route", &self.route())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
