//! Liveness monitor: a background task that keeps probing the primary pool.
//!
//! The monitor publishes its verdict through a [`LivenessStatus`] cell. It is
//! the only writer; the router only reads it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use connpool::ConnectionPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checker::{ProbeTracker, probe};
use crate::config::MonitorConfig;

/// Shared "primary is reachable" flag.
#[derive(Clone, Debug)]
pub struct LivenessStatus(Arc<AtomicBool>);

impl LivenessStatus {
    pub fn new(alive: bool) -> Self {
        Self(Arc::new(AtomicBool::new(alive)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Publish a verdict, returning the previous one.
    pub(crate) fn set(&self, alive: bool) -> bool {
        self.0.swap(alive, Ordering::AcqRel)
    }
}

impl Default for LivenessStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Handle to a running probe loop.
pub struct LivenessMonitor {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    status: LivenessStatus,
}

impl LivenessMonitor {
    /// Spawn the probe loop against `pool`. Must be called from within a
    /// Tokio runtime.
    pub fn start(pool: ConnectionPool, config: MonitorConfig, status: LivenessStatus) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_status = status.clone();

        info!(
            pool = %pool.name(),
            interval = ?config.interval,
            statement = %config.probe_statement,
            "liveness monitor started"
        );
        let handle = tokio::spawn(async move {
            run_probe_loop(pool, config, loop_status, shutdown_rx).await;
        });

        Self {
            handle,
            shutdown_tx,
            status,
        }
    }

    pub fn status(&self) -> &LivenessStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop to stop and wait up to `grace` for it to exit. A probe
    /// in flight is allowed to finish; if the task is still running when
    /// `grace` elapses it is aborted.
    ///
    /// Returns `true` if the loop exited on its own.
    pub async fn stop(mut self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(_) => {
                debug!("liveness monitor stopped");
                true
            }
            Err(_) => {
                warn!(?grace, "liveness monitor did not stop in time, aborting");
                self.handle.abort();
                false
            }
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            let _ = self.shutdown_tx.send(true);
            self.handle.abort();
        }
    }
}

/// The probe loop: probe, publish, pause, repeat until told to stop.
async fn run_probe_loop(
    pool: ConnectionPool,
    config: MonitorConfig,
    status: LivenessStatus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = ProbeTracker::new(&config);

    debug!(pool = %pool.name(), "probe loop starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = probe(&pool, &config.probe_statement, config.probe_timeout).await;
        let alive = tracker.record(&result);
        let was_alive = status.set(alive);
        if alive != was_alive {
            info!(pool = %pool.name(), alive, "primary liveness changed");
        }

        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {}
            _ = shutdown.changed() => {
                debug!(pool = %pool.name(), "probe loop shutting down");
                break;
            }
        }
    }
}
