//! Pooled connection handles.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::DriverError;
use crate::key::ConnectionKey;
use crate::pool::{Shared, lock};
use crate::supplier::PhysicalConnection;

/// Physical connection storage shared between a handle and the pool's active
/// set. Emptied exactly once: by release or by pool shutdown.
pub(crate) type Slot = Arc<Mutex<Option<Box<dyn PhysicalConnection>>>>;

/// A checked-out connection.
///
/// Dropping the handle (or calling [`release`](Self::release)) returns the
/// physical connection to the pool it came from instead of closing it.
/// Ownership makes a double release impossible.
pub struct PooledConnection {
    id: u64,
    key: ConnectionKey,
    created_at: Instant,
    slot: Slot,
    pool: Arc<Shared>,
    broken: bool,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        key: ConnectionKey,
        created_at: Instant,
        slot: Slot,
        pool: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            key,
            created_at,
            slot,
            pool,
            broken: false,
        }
    }

    /// Identifier of the underlying physical connection. A connection opened
    /// to replace an expired one gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// When the physical connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Name of the pool this connection belongs to.
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Execute a statement on the physical connection.
    pub fn execute(&mut self, statement: &str) -> Result<u64, DriverError> {
        match lock(&self.slot).as_mut() {
            Some(conn) => conn.execute(statement),
            None => Err(DriverError::Closed),
        }
    }

    /// Liveness check on the physical connection. Always `false` once the
    /// pool has closed it.
    pub fn is_valid(&mut self) -> bool {
        lock(&self.slot).as_mut().is_some_and(|conn| conn.is_valid())
    }

    /// Flag the connection as unusable: it will be closed on release rather
    /// than returned to the idle store.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to its pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the physical connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.id, self.broken);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.name())
            .field("key", &self.key)
            .field("age", &self.age())
            .field("broken", &self.broken)
            .finish()
    }
}
