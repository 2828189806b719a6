//! failover.toml configuration.
//!
//! ```toml
//! [primary]
//! connection_ttl = "60s"
//! max_pool_size = 8
//!
//! [secondary]
//! connection_ttl = "60s"
//! max_pool_size = 4
//!
//! [monitor]
//! interval = "1s"
//! probe_statement = "SELECT 1"
//! ```

use std::path::Path;
use std::time::Duration;

use connpool::{PoolConfig, PoolResult, PoolSettings, parse_duration};
use serde::Deserialize;

use crate::error::{RouterError, RouterResult};

/// Liveness monitor configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Pause between two probe cycles while the primary is healthy.
    pub interval: Duration,
    /// Ceiling for the pause while probes keep failing.
    pub max_backoff: Duration,
    /// How long a probe may wait for a primary connection.
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the primary is considered down.
    pub failure_threshold: u32,
    /// Side-effect-free statement executed by every probe.
    pub probe_statement: String,
    /// How long `close()` waits for the monitor task before aborting it.
    pub stop_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 1,
            probe_statement: "SELECT 1".to_string(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> RouterResult<()> {
        if self.interval.is_zero() {
            return Err(RouterError::Config("interval must be non-zero".to_string()));
        }
        if self.max_backoff < self.interval {
            return Err(RouterError::Config(
                "max_backoff must not be shorter than interval".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(RouterError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.probe_statement.trim().is_empty() {
            return Err(RouterError::Config("probe_statement is empty".to_string()));
        }
        Ok(())
    }
}

/// Serde form of the `[monitor]` table. Missing keys take the
/// [`MonitorConfig`] defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    pub interval: Option<String>,
    pub max_backoff: Option<String>,
    pub probe_timeout: Option<String>,
    pub failure_threshold: Option<u32>,
    pub probe_statement: Option<String>,
    pub stop_timeout: Option<String>,
}

impl TryFrom<MonitorSettings> for MonitorConfig {
    type Error = RouterError;

    fn try_from(settings: MonitorSettings) -> RouterResult<Self> {
        fn duration(field: &str, raw: Option<&str>, default: Duration) -> RouterResult<Duration> {
            match raw {
                Some(raw) => parse_duration(raw)
                    .ok_or_else(|| RouterError::Config(format!("invalid {field}: {raw:?}"))),
                None => Ok(default),
            }
        }

        let defaults = MonitorConfig::default();
        let interval = duration("interval", settings.interval.as_deref(), defaults.interval)?;
        let config = MonitorConfig {
            interval,
            max_backoff: duration(
                "max_backoff",
                settings.max_backoff.as_deref(),
                defaults.max_backoff.max(interval),
            )?,
            probe_timeout: duration(
                "probe_timeout",
                settings.probe_timeout.as_deref(),
                defaults.probe_timeout,
            )?,
            failure_threshold: settings.failure_threshold.unwrap_or(defaults.failure_threshold),
            probe_statement: settings.probe_statement.unwrap_or(defaults.probe_statement),
            stop_timeout: duration(
                "stop_timeout",
                settings.stop_timeout.as_deref(),
                defaults.stop_timeout,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Top-level failover.toml.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverConfig {
    pub primary: PoolSettings,
    pub secondary: PoolSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl FailoverConfig {
    /// Read and validate a failover.toml file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FailoverConfig = toml::from_str(content)?;
        config.primary_pool()?;
        config.secondary_pool()?;
        config.monitor_config()?;
        Ok(config)
    }

    pub fn primary_pool(&self) -> PoolResult<PoolConfig> {
        PoolConfig::try_from(self.primary.clone())
    }

    pub fn secondary_pool(&self) -> PoolResult<PoolConfig> {
        PoolConfig::try_from(self.secondary.clone())
    }

    pub fn monitor_config(&self) -> RouterResult<MonitorConfig> {
        MonitorConfig::try_from(self.monitor.clone())
    }
}
