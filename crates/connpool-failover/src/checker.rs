//! Probe logic for the liveness monitor.
//!
//! A probe checks out a connection from the monitored pool, runs the probe
//! statement, and gives the connection back. [`ProbeTracker`] turns the
//! stream of probe outcomes into an alive/down verdict and decides how long
//! to wait before the next probe.

use std::time::Duration;

use connpool::{ConnectionKey, ConnectionPool, DriverError, PoolError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

/// Why a probe failed. Never surfaced to router callers; it only shows up as
/// the primary being marked down.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("could not acquire a probe connection: {0}")]
    Acquire(#[from] PoolError),

    #[error("probe statement failed: {0}")]
    Execute(#[from] DriverError),
}

/// Run one probe against `pool`.
///
/// The probe checks out through
/// [`ConnectionPool::acquire_reserved`], so a pool built with reserved
/// capacity answers it even while callers hold every ordinary slot.
/// A connection whose probe statement fails is discarded rather than
/// returned, so a dead primary does not keep broken sessions parked in its
/// idle store.
pub async fn probe(
    pool: &ConnectionPool,
    statement: &str,
    timeout: Duration,
) -> Result<(), ProbeFailure> {
    let mut conn = pool.acquire_reserved(&ConnectionKey::Default, timeout).await?;
    match conn.execute(statement) {
        Ok(_) => {
            conn.release();
            Ok(())
        }
        Err(e) => {
            conn.discard();
            Err(e.into())
        }
    }
}

/// Tracks consecutive probe outcomes for the monitored pool.
#[derive(Debug)]
pub struct ProbeTracker {
    alive: bool,
    consecutive_failures: u32,
    failure_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl ProbeTracker {
    /// Create a tracker. The monitored pool starts out presumed alive.
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            alive: true,
            consecutive_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            current_backoff: config.interval,
            base_interval: config.interval,
            max_backoff: config.max_backoff.max(config.interval),
        }
    }

    /// Record a probe outcome and return the new verdict.
    pub fn record(&mut self, result: &Result<(), ProbeFailure>) -> bool {
        match result {
            Ok(()) => {
                if !self.alive {
                    debug!(
                        failures = self.consecutive_failures,
                        "primary recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                self.alive = true;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                // Exponential backoff: double the interval up to max.
                self.current_backoff = self
                    .current_backoff
                    .checked_mul(2)
                    .map_or(self.max_backoff, |next| next.min(self.max_backoff));

                if self.consecutive_failures >= self.failure_threshold {
                    if self.alive {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.failure_threshold,
                            error = %e,
                            "primary marked down"
                        );
                    }
                    self.alive = false;
                } else {
                    debug!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        error = %e,
                        "probe failed"
                    );
                }
            }
        }
        self.alive
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Pause before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}
