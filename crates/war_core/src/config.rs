//! Runtime configuration for every component.
//!
//! All sections have sensible defaults; a RON file only needs to list the
//! values it overrides.
//!
//! # Example RON
//!
//! ```ron
//! WarConfig(
//!     dispatcher: (workers: 8),
//!     battle: (tick_ms: 50),
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WarError};

/// Unit actor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Command inbox capacity per unit.
    pub inbox_capacity: usize,
    /// How long `submit` waits for inbox space before reporting backpressure.
    pub submit_wait_ms: u64,
    /// Event outbox capacity per unit.
    pub event_buffer: usize,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 10,
            submit_wait_ms: 100,
            event_buffer: 100,
        }
    }
}

impl UnitConfig {
    /// Submit wait as a [`Duration`].
    #[must_use]
    pub const fn submit_wait(&self) -> Duration {
        Duration::from_millis(self.submit_wait_ms)
    }
}

/// Unit manager (registry + dispatcher) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of command workers.
    pub workers: usize,
    /// Shared command queue capacity.
    pub command_queue: usize,
    /// Fan-in status channel capacity.
    pub status_buffer: usize,
    /// Per-listener event buffer.
    pub listener_buffer: usize,
    /// Deadline applied to each queued command.
    pub command_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            command_queue: 1000,
            status_buffer: 1000,
            listener_buffer: 100,
            command_timeout_ms: 1000,
        }
    }
}

impl DispatcherConfig {
    /// Command deadline as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Token bucket settings for resource transaction admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size.
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Resource manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Transaction queue capacity.
    pub transaction_queue: usize,
    /// Threshold monitor / reservation sweep period.
    pub monitor_interval_ms: u64,
    /// Default reservation lifetime.
    pub reservation_ttl_ms: u64,
    /// Allocation records kept per resource and in the global log.
    pub history_len: usize,
    /// Per-listener event buffer.
    pub listener_buffer: usize,
    /// Optional admission rate limit.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            transaction_queue: 1000,
            monitor_interval_ms: 250,
            reservation_ttl_ms: 30_000,
            history_len: 100,
            listener_buffer: 100,
            rate_limit: None,
        }
    }
}

impl ResourceConfig {
    /// Monitor period as a [`Duration`].
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Default reservation lifetime as a [`Duration`].
    #[must_use]
    pub const fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }
}

/// Battle simulator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleConfigDefaults {
    /// Tick interval.
    pub tick_ms: u64,
    /// Event queue capacity.
    pub event_queue: usize,
    /// Maximum events retained per battle log.
    pub max_log_events: usize,
    /// Per-observer event buffer.
    pub observer_buffer: usize,
    /// Finalized result channel capacity.
    pub result_buffer: usize,
}

impl Default for BattleConfigDefaults {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            event_queue: 1024,
            max_log_events: 10_000,
            observer_buffer: 100,
            result_buffer: 16,
        }
    }
}

impl BattleConfigDefaults {
    /// Tick interval as a [`Duration`].
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarConfig {
    /// Unit actor settings.
    pub units: UnitConfig,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Resource manager settings.
    pub resources: ResourceConfig,
    /// Battle simulator settings.
    pub battle: BattleConfigDefaults,
}

impl WarConfig {
    /// Parse from a RON string and validate.
    pub fn from_ron_str(ron_str: &str) -> Result<Self> {
        let config: Self = ron::from_str(ron_str).map_err(|e| WarError::DataParse {
            source_name: "config".into(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a RON file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| WarError::DataParse {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_ron_str(&contents)
    }

    /// Reject values that would wedge a component (zero capacities, no workers).
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("units.inbox_capacity", self.units.inbox_capacity),
            ("units.event_buffer", self.units.event_buffer),
            ("dispatcher.workers", self.dispatcher.workers),
            ("dispatcher.command_queue", self.dispatcher.command_queue),
            ("dispatcher.status_buffer", self.dispatcher.status_buffer),
            ("dispatcher.listener_buffer", self.dispatcher.listener_buffer),
            ("resources.transaction_queue", self.resources.transaction_queue),
            ("resources.listener_buffer", self.resources.listener_buffer),
            ("battle.event_queue", self.battle.event_queue),
            ("battle.max_log_events", self.battle.max_log_events),
            ("battle.observer_buffer", self.battle.observer_buffer),
            ("battle.result_buffer", self.battle.result_buffer),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, v)| *v == 0) {
            return Err(WarError::InvalidArgument(format!("{name} must be non-zero")));
        }
        if self.battle.tick_ms == 0 || self.resources.monitor_interval_ms == 0 {
            return Err(WarError::InvalidArgument(
                "tick and monitor intervals must be non-zero".into(),
            ));
        }
        if let Some(limit) = &self.resources.rate_limit {
            if limit.max_tokens == 0 || !(limit.refill_per_sec > 0.0) {
                return Err(WarError::InvalidArgument(
                    "rate_limit needs max_tokens > 0 and refill_per_sec > 0".into(),
                ));
            }
        }
        Ok(())
    }
}
