//! The pool engine.
//!
//! # Architecture
//!
//! ```text
//! acquire(key)
//!   → idle entry for key, fresh        → activate → handle
//!   → idle entry for key, past TTL     → close it, reuse its slot → open → handle
//!   → no idle entry, live < max        → reserve slot → open → handle
//!   → at cap, other key holds idle     → close its oldest idle entry, reuse slot → open → handle
//!   → at cap, nothing reusable         → park on Notify until a release frees something
//!   → ordinary slots all in use        → park, even if reserved slots are free
//!
//! acquire_reserved(key)
//!   → same steps, but may also use the slots set aside by
//!     `PoolConfig::with_reserved_capacity`
//!
//! handle dropped / released
//!   → healthy → idle store under its key → wake waiters
//!   → broken  → close, free slot         → wake waiters
//! ```
//!
//! All bookkeeping (idle store, active set, counters) lives behind one
//! `std::sync::Mutex` per pool. The lock is never held across an `.await` or
//! across a call into the supplier: a cap slot is reserved under the lock,
//! the physical open runs outside it, and the result is committed under the
//! lock again. A [`Reservation`] rolls its slot back if the open fails or the
//! future is dropped, so `live` can never exceed `max_pool_size`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{PooledConnection, Slot};
use crate::error::{PoolError, PoolResult};
use crate::key::ConnectionKey;
use crate::supplier::{ConnectionSupplier, PhysicalConnection};

/// Lock a mutex, recovering the guard if a previous holder panicked.
/// Pool bookkeeping is updated field-by-field, so a poisoned guard is still
/// consistent enough to continue closing connections.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An idle physical connection waiting in the store.
#[derive(Debug)]
struct IdleEntry {
    id: u64,
    created_at: Instant,
    conn: Box<dyn PhysicalConnection>,
}

/// A checked-out connection. The slot is shared with the caller's handle so
/// shutdown can close connections that are still in use.
#[derive(Debug)]
struct ActiveEntry {
    key: ConnectionKey,
    created_at: Instant,
    slot: Slot,
    /// Checked out through `acquire_reserved`.
    reserved: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: HashMap<ConnectionKey, VecDeque<IdleEntry>>,
    active: HashMap<u64, ActiveEntry>,
    /// Physical connections currently counted against the cap:
    /// idle + active + opening.
    live: usize,
    /// Slots reserved for a physical open that has not completed yet.
    opening: usize,
    /// Active or opening connections taken through `acquire_reserved`.
    reserved_in_use: usize,
    created: u64,
    closed: u64,
    waits: u64,
    shut_down: bool,
}

impl PoolState {
    fn idle_len(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    /// Connections held by ordinary callers, checked out or being opened.
    fn ordinary_in_use(&self) -> usize {
        (self.active.len() + self.opening).saturating_sub(self.reserved_in_use)
    }

    /// Pop the longest-idle entry for `key`. Empty queues are dropped so the
    /// map does not keep one entry per credential ever seen.
    fn pop_idle(&mut self, key: &ConnectionKey) -> Option<IdleEntry> {
        let queue = self.idle.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(key);
        }
        entry
    }

    /// Remove the oldest-created idle entry belonging to any key other
    /// than `key`.
    fn pop_oldest_foreign(&mut self, key: &ConnectionKey) -> Option<(ConnectionKey, IdleEntry)> {
        let (victim, index) = self
            .idle
            .iter()
            .filter(|(k, _)| *k != key)
            .flat_map(|(k, queue)| queue.iter().enumerate().map(move |(i, e)| (k, i, e)))
            .min_by_key(|(_, _, e)| e.created_at)
            .map(|(k, i, _)| (k.clone(), i))?;
        let queue = self.idle.get_mut(&victim)?;
        let entry = queue.remove(index)?;
        if queue.is_empty() {
            self.idle.remove(&victim);
        }
        Some((victim, entry))
    }
}

/// Snapshot of pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections counted against the cap.
    pub live: usize,
    /// Connections sitting idle across all keys.
    pub idle: usize,
    /// Connections checked out by callers.
    pub active: usize,
    /// Opens currently in flight.
    pub opening: usize,
    /// Physical connections opened over the pool's lifetime.
    pub created: u64,
    /// Physical connections closed over the pool's lifetime.
    pub closed: u64,
    /// Number of acquires that had to park waiting for a connection.
    pub waits: u64,
}

pub(crate) struct Shared {
    name: String,
    config: PoolConfig,
    supplier: Arc<dyn ConnectionSupplier>,
    state: Mutex<PoolState>,
    /// Woken on every release, eviction, rollback, and shutdown.
    available: Notify,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return a checked-out connection. Called from the handle's `Drop`.
    pub(crate) fn release(&self, id: u64, broken: bool) {
        let mut state = lock(&self.state);
        let Some(entry) = state.active.remove(&id) else {
            // Already reclaimed by shutdown.
            debug!(pool = %self.name, id, "released connection after pool shutdown");
            return;
        };
        let conn = lock(&entry.slot).take();
        if entry.reserved {
            state.reserved_in_use = state.reserved_in_use.saturating_sub(1);
        }

        match conn {
            Some(conn) if !broken => {
                let queue = state.idle.entry(entry.key.clone()).or_default();
                queue.push_back(IdleEntry {
                    id,
                    created_at: entry.created_at,
                    conn,
                });
                debug!(
                    pool = %self.name,
                    id,
                    key = %entry.key,
                    idle_count = queue.len(),
                    "returned connection to pool"
                );
                drop(state);
            }
            conn => {
                state.live = state.live.saturating_sub(1);
                state.closed += 1;
                drop(state);
                debug!(
                    pool = %self.name,
                    id,
                    key = %entry.key,
                    "destroying broken connection on release"
                );
                if let Some(mut conn) = conn {
                    close_quietly(&self.name, id, conn.as_mut());
                }
            }
        }

        self.available.notify_waiters();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, queue) in state.idle.drain() {
            for mut entry in queue {
                close_quietly(&self.name, entry.id, entry.conn.as_mut());
            }
        }
    }
}

/// Close a physical connection, logging rather than propagating failures.
fn close_quietly(pool: &str, id: u64, conn: &mut dyn PhysicalConnection) {
    if let Err(e) = conn.close() {
        warn!(pool, id, error = %e, "failed to close physical connection");
    }
}

/// A cap slot reserved for a physical open. Dropping it un-committed gives
/// the slot back and wakes waiters.
struct Reservation {
    shared: Arc<Shared>,
    reserved: bool,
    armed: bool,
}

impl Reservation {
    fn new(shared: &Arc<Shared>, reserved: bool) -> Self {
        Self {
            shared: Arc::clone(shared),
            reserved,
            armed: true,
        }
    }

    /// Move a freshly opened connection into the active set.
    fn commit(
        mut self,
        key: &ConnectionKey,
        mut conn: Box<dyn PhysicalConnection>,
    ) -> PoolResult<PooledConnection> {
        let id = self.shared.allocate_id();
        let created_at = Instant::now();
        let mut state = lock(&self.shared.state);
        state.created += 1;

        if state.shut_down {
            state.closed += 1;
            drop(state);
            close_quietly(&self.shared.name, id, conn.as_mut());
            return Err(PoolError::Closed(self.shared.name.clone()));
        }

        self.armed = false;
        state.opening -= 1;
        let slot: Slot = Arc::new(Mutex::new(Some(conn)));
        state.active.insert(
            id,
            ActiveEntry {
                key: key.clone(),
                created_at,
                slot: Arc::clone(&slot),
                reserved: self.reserved,
            },
        );
        debug!(
            pool = %self.shared.name,
            id,
            key = %key,
            live = state.live,
            "created new connection"
        );
        drop(state);

        Ok(PooledConnection::new(
            id,
            key.clone(),
            created_at,
            slot,
            Arc::clone(&self.shared),
        ))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = lock(&self.shared.state);
            state.opening = state.opening.saturating_sub(1);
            state.live = state.live.saturating_sub(1);
            if self.reserved {
                state.reserved_in_use = state.reserved_in_use.saturating_sub(1);
            }
        }
        self.shared.available.notify_waiters();
    }
}

/// What an acquire attempt decided while holding the lock.
enum Step {
    Ready(PooledConnection),
    /// A slot was reserved; `evict` is an idle entry whose slot is being
    /// reused and must be closed first.
    Open { evict: Option<(&'static str, IdleEntry)> },
    Wait,
}

/// A bounded pool of physical connections, bucketed by [`ConnectionKey`].
///
/// Cloning is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create a pool. `name` labels log lines and the handles it produces.
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        supplier: Arc<dyn ConnectionSupplier>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                supplier,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).shut_down
    }

    /// Check out a connection for `key`, waiting for one to become available
    /// if the pool is at capacity.
    ///
    /// The wait is bounded by the configured `acquire_timeout`, if any.
    pub async fn acquire(&self, key: &ConnectionKey) -> PoolResult<PooledConnection> {
        match self.shared.config.acquire_timeout() {
            Some(timeout) => self.acquire_timeout(key, timeout).await,
            None => self.checkout(key, false).await,
        }
    }

    /// Check out a connection for `key`, failing with
    /// [`PoolError::AcquireTimeout`] if none is available within `timeout`.
    pub async fn acquire_timeout(
        &self,
        key: &ConnectionKey,
        timeout: Duration,
    ) -> PoolResult<PooledConnection> {
        self.checkout_within(key, timeout, false).await
    }

    /// Like [`acquire_timeout`](Self::acquire_timeout), but may also use the
    /// slots set aside by
    /// [`PoolConfig::with_reserved_capacity`](crate::PoolConfig::with_reserved_capacity),
    /// which ordinary acquires never take.
    pub async fn acquire_reserved(
        &self,
        key: &ConnectionKey,
        timeout: Duration,
    ) -> PoolResult<PooledConnection> {
        self.checkout_within(key, timeout, true).await
    }

    async fn checkout_within(
        &self,
        key: &ConnectionKey,
        timeout: Duration,
        reserved: bool,
    ) -> PoolResult<PooledConnection> {
        match tokio::time::timeout(timeout, self.checkout(key, reserved)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pool = %self.shared.name, key = %key, ?timeout, "acquire timed out");
                Err(PoolError::AcquireTimeout(timeout))
            }
        }
    }

    async fn checkout(&self, key: &ConnectionKey, reserved: bool) -> PoolResult<PooledConnection> {
        let ttl = self.shared.config.connection_ttl();
        let max = self.shared.config.max_pool_size();
        let ordinary_max = max - self.shared.config.reserved_capacity();
        let mut parked = false;

        loop {
            // Registered before the state check so a release between the
            // check and the await is not missed.
            let notified = self.shared.available.notified();
            tokio::pin!(notified);

            let step = {
                let mut state = lock(&self.shared.state);
                if state.shut_down {
                    return Err(PoolError::Closed(self.shared.name.clone()));
                }

                let may_take = reserved || state.ordinary_in_use() < ordinary_max;
                let idle = if may_take { state.pop_idle(key) } else { None };

                let step = if !may_take {
                    Step::Wait
                } else if let Some(entry) = idle {
                    if entry.created_at.elapsed() > ttl {
                        state.opening += 1;
                        state.closed += 1;
                        Step::Open {
                            evict: Some(("connection ttl expired", entry)),
                        }
                    } else {
                        Step::Ready(self.activate(&mut state, key, entry, reserved))
                    }
                } else if state.live < max {
                    state.live += 1;
                    state.opening += 1;
                    Step::Open { evict: None }
                } else if let Some((owner, entry)) = state.pop_oldest_foreign(key) {
                    debug!(
                        pool = %self.shared.name,
                        id = entry.id,
                        from = %owner,
                        to = %key,
                        "pool at capacity, recycling idle connection of another key"
                    );
                    state.opening += 1;
                    state.closed += 1;
                    Step::Open {
                        evict: Some(("slot reassigned to another key", entry)),
                    }
                } else {
                    Step::Wait
                };

                match &step {
                    Step::Wait => {
                        if !parked {
                            parked = true;
                            state.waits += 1;
                        }
                        notified.as_mut().enable();
                    }
                    Step::Open { .. } if reserved => state.reserved_in_use += 1,
                    _ => {}
                }
                step
            };

            match step {
                Step::Ready(conn) => return Ok(conn),
                Step::Wait => {
                    debug!(
                        pool = %self.shared.name,
                        key = %key,
                        "pool exhausted, waiting for a connection"
                    );
                    notified.await;
                }
                Step::Open { evict } => {
                    let reservation = Reservation::new(&self.shared, reserved);
                    if let Some((reason, mut entry)) = evict {
                        debug!(
                            pool = %self.shared.name,
                            id = entry.id,
                            age = ?entry.created_at.elapsed(),
                            reason,
                            "closing idle connection"
                        );
                        close_quietly(&self.shared.name, entry.id, entry.conn.as_mut());
                    }
                    let conn = self.shared.supplier.open(key.credentials()).map_err(|e| {
                        warn!(
                            pool = %self.shared.name,
                            key = %key,
                            error = %e,
                            "failed to open connection"
                        );
                        e
                    })?;
                    return reservation.commit(key, conn);
                }
            }
        }
    }

    /// Move an idle entry into the active set. Caller holds the state lock.
    fn activate(
        &self,
        state: &mut PoolState,
        key: &ConnectionKey,
        entry: IdleEntry,
        reserved: bool,
    ) -> PooledConnection {
        let slot: Slot = Arc::new(Mutex::new(Some(entry.conn)));
        if reserved {
            state.reserved_in_use += 1;
        }
        state.active.insert(
            entry.id,
            ActiveEntry {
                key: key.clone(),
                created_at: entry.created_at,
                slot: Arc::clone(&slot),
                reserved,
            },
        );
        debug!(
            pool = %self.shared.name,
            id = entry.id,
            key = %key,
            "reused idle connection from pool"
        );
        PooledConnection::new(
            entry.id,
            key.clone(),
            entry.created_at,
            slot,
            Arc::clone(&self.shared),
        )
    }

    /// Close idle connections older than the TTL. Returns how many were closed.
    pub fn reap_expired(&self) -> usize {
        let ttl = self.shared.config.connection_ttl();
        let expired: Vec<IdleEntry> = {
            let mut state = lock(&self.shared.state);
            let mut expired = Vec::new();
            for queue in state.idle.values_mut() {
                let (keep, old): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|e| e.created_at.elapsed() <= ttl);
                *queue = keep;
                expired.extend(old);
            }
            state.idle.retain(|_, queue| !queue.is_empty());
            state.live = state.live.saturating_sub(expired.len());
            state.closed += expired.len() as u64;
            expired
        };

        let reaped = expired.len();
        for mut entry in expired {
            close_quietly(&self.shared.name, entry.id, entry.conn.as_mut());
        }
        if reaped > 0 {
            info!(pool = %self.shared.name, reaped, "reaped expired idle connections");
            self.shared.available.notify_waiters();
        }
        reaped
    }

    /// Close every idle and checked-out connection and reject further
    /// acquires. Returns the number of physical connections closed; a second
    /// call is a no-op returning 0.
    ///
    /// Handles still held by callers stay valid objects, but their
    /// operations fail with [`DriverError::Closed`](crate::DriverError::Closed).
    pub fn shutdown(&self) -> usize {
        let (idle, active) = {
            let mut state = lock(&self.shared.state);
            if state.shut_down {
                return 0;
            }
            state.shut_down = true;
            let idle: Vec<IdleEntry> = state.idle.drain().flat_map(|(_, queue)| queue).collect();
            let active: Vec<(u64, ActiveEntry)> = state.active.drain().collect();
            let reserved_active = active.iter().filter(|(_, e)| e.reserved).count();
            state.reserved_in_use = state.reserved_in_use.saturating_sub(reserved_active);
            state.closed += (idle.len() + active.len()) as u64;
            // Opens still in flight are closed by their own commit.
            state.live = state.opening;
            (idle, active)
        };
        self.shared.available.notify_waiters();

        let mut closed = 0;
        for mut entry in idle {
            close_quietly(&self.shared.name, entry.id, entry.conn.as_mut());
            closed += 1;
        }
        for (id, entry) in active {
            if let Some(mut conn) = lock(&entry.slot).take() {
                close_quietly(&self.shared.name, id, conn.as_mut());
                closed += 1;
            }
        }

        if let Err(e) = self.shared.supplier.close() {
            warn!(pool = %self.shared.name, error = %e, "connection supplier failed to close");
        }
        info!(pool = %self.shared.name, closed, "connection pool shut down");
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            live: state.live,
            idle: state.idle_len(),
            active: state.active.len(),
            opening: state.opening,
            created: state.created,
            closed: state.closed,
            waits: state.waits,
        }
    }

    /// Log pool statistics at `info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            pool = %self.shared.name,
            live = stats.live,
            idle = stats.idle,
            active = stats.active,
            opening = stats.opening,
            created = stats.created,
            closed = stats.closed,
            waits = stats.waits,
            max = self.shared.config.max_pool_size(),
            "pool statistics"
        );
    }

    pub fn login_timeout(&self) -> Duration {
        self.shared.supplier.login_timeout()
    }

    pub fn set_login_timeout(&self, timeout: Duration) {
        self.shared.supplier.set_login_timeout(timeout);
    }

    /// Description of the underlying driver.
    pub fn describe(&self) -> String {
        self.shared.supplier.describe()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
