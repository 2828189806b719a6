//! Pool configuration.
//!
//! [`PoolConfig`] is the validated, immutable form handed to a pool.
//! [`PoolSettings`] is its serde representation, with durations written as
//! human strings (`"60s"`, `"500ms"`, `"2m"`) so it can be embedded in a
//! TOML file.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{PoolError, PoolResult};

/// Validated configuration for one pool instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    connection_ttl: Duration,
    max_pool_size: usize,
    reserved_capacity: usize,
    acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Create a config. `max_pool_size` must be positive.
    pub fn new(connection_ttl: Duration, max_pool_size: usize) -> PoolResult<Self> {
        if max_pool_size == 0 {
            return Err(PoolError::Config(
                "max_pool_size must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            connection_ttl,
            max_pool_size,
            reserved_capacity: 0,
            acquire_timeout: None,
        })
    }

    /// Builder method: default deadline applied by `acquire` when the caller
    /// gives none. `None` waits indefinitely.
    pub fn with_acquire_timeout(self, acquire_timeout: Option<Duration>) -> Self {
        Self {
            acquire_timeout,
            ..self
        }
    }

    /// Builder method: grow the cap by `extra` slots.
    pub fn with_extra_capacity(self, extra: usize) -> Self {
        Self {
            max_pool_size: self.max_pool_size.saturating_add(extra),
            ..self
        }
    }

    /// Builder method: grow the cap by `extra` slots that only
    /// [`ConnectionPool::acquire_reserved`](crate::ConnectionPool::acquire_reserved)
    /// may use. Ordinary acquires stay within the previous cap.
    pub fn with_reserved_capacity(self, extra: usize) -> Self {
        Self {
            max_pool_size: self.max_pool_size.saturating_add(extra),
            reserved_capacity: self.reserved_capacity.saturating_add(extra),
            ..self
        }
    }

    /// Maximum age of a physical connection before it is recycled.
    pub fn connection_ttl(&self) -> Duration {
        self.connection_ttl
    }

    /// Hard cap on concurrently-open physical connections.
    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    /// Slots of `max_pool_size` held back for reserved acquires.
    pub fn reserved_capacity(&self) -> usize {
        self.reserved_capacity
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }
}

/// Serde form of [`PoolConfig`].
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    pub connection_ttl: String,
    pub max_pool_size: usize,
    pub acquire_timeout: Option<String>,
}

impl TryFrom<PoolSettings> for PoolConfig {
    type Error = PoolError;

    fn try_from(settings: PoolSettings) -> PoolResult<Self> {
        let ttl = parse_duration(&settings.connection_ttl).ok_or_else(|| {
            PoolError::Config(format!(
                "invalid connection_ttl: {:?}",
                settings.connection_ttl
            ))
        })?;
        let acquire_timeout = match settings.acquire_timeout.as_deref() {
            Some(raw) => Some(parse_duration(raw).ok_or_else(|| {
                PoolError::Config(format!("invalid acquire_timeout: {raw:?}"))
            })?),
            None => None,
        };
        Ok(PoolConfig::new(ttl, settings.max_pool_size)?.with_acquire_timeout(acquire_timeout))
    }
}

/// Parse a duration string: `"500ms"`, `"5s"`, `"2m"`, `"1h"`, or a bare
/// number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.trim().parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours = hours.trim().parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
