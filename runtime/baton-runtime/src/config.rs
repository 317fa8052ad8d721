///
/// # Scheduler Configuration
///
/// Tunables for a `Scheduler` instance. Every field has a default, so a
/// config file only needs the keys it changes.
///
/// ## Example baton.toml
///
/// ```toml
/// capacity = 101            # idle thread + 100 application threads
/// stack_size = 65536        # bytes per backing thread
/// idle_timeout_ms = 1000    # idle thread's timed baton wait
/// idle_pause_us = 10        # idle thread's pause before passing the baton
/// thread_name_prefix = "baton"
/// ```
///

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_CAPACITY: usize = 101;
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Total thread slots, including the idle thread.
    pub capacity: usize,
    pub stack_size: usize,
    pub idle_timeout_ms: u64,
    pub idle_pause_us: u64,
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
            idle_timeout_ms: 1000,
            idle_pause_us: 10,
            thread_name_prefix: "baton".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity < 2 {
            return Err(ConfigError::Invalid(format!(
                "capacity must be at least 2 (idle thread + one application thread), got {}",
                self.capacity
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_idle_pause(mut self, pause: Duration) -> Self {
        self.idle_pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_micros(self.idle_pause_us)
    }
}
