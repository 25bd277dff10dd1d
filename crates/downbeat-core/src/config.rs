//! Conductor configuration.
//!
//! The blocking heuristic has three knobs. None of them is a correctness
//! guarantee; they trade test latency against robustness to scheduler noise
//! and are meant to be tuned per environment (CI machines under load
//! typically want a longer poll period and deadlock window).

use std::time::Duration;

use crate::error::ConfigError;

/// Time between two monitor samples.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Consecutive non-runnable samples before a unit counts as blocked.
pub const DEFAULT_DEBOUNCE_SAMPLES: u32 = 2;

/// Time without progress before the scenario is declared deadlocked.
pub const DEFAULT_DEADLOCK_WINDOW: Duration = Duration::from_secs(5);

/// Environment variable overriding [`ConductorConfig::poll_period`], in ms.
pub const POLL_PERIOD_VAR: &str = "DOWNBEAT_POLL_PERIOD_MS";

/// Environment variable overriding [`ConductorConfig::debounce_samples`].
pub const DEBOUNCE_SAMPLES_VAR: &str = "DOWNBEAT_DEBOUNCE_SAMPLES";

/// Environment variable overriding [`ConductorConfig::deadlock_window`], in ms.
pub const DEADLOCK_WINDOW_VAR: &str = "DOWNBEAT_DEADLOCK_WINDOW_MS";

/// Conductor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConductorConfig {
    /// Monitor sampling period
    pub poll_period: Duration,
    /// Consecutive blocked samples required (at least 1)
    pub debounce_samples: u32,
    /// No-progress window before a deadlock failure (longer than poll period)
    pub deadlock_window: Duration,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            poll_period: DEFAULT_POLL_PERIOD,
            debounce_samples: DEFAULT_DEBOUNCE_SAMPLES,
            deadlock_window: DEFAULT_DEADLOCK_WINDOW,
        }
    }
}

impl ConductorConfig {
    /// Set the poll period.
    #[must_use]
    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    /// Set the debounce sample count.
    #[must_use]
    pub fn with_debounce_samples(mut self, debounce_samples: u32) -> Self {
        self.debounce_samples = debounce_samples;
        self
    }

    /// Set the deadlock window.
    #[must_use]
    pub fn with_deadlock_window(mut self, deadlock_window: Duration) -> Self {
        self.deadlock_window = deadlock_window;
        self
    }

    /// Defaults overridden by `DOWNBEAT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unset variables keep their default; set but unparsable ones are an
    /// error rather than silently ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var(&lookup, POLL_PERIOD_VAR)? {
            config.poll_period = Duration::from_millis(ms);
        }
        if let Some(samples) = parse_var(&lookup, DEBOUNCE_SAMPLES_VAR)? {
            config.debounce_samples = u32::try_from(samples).map_err(|_| ConfigError::Invalid {
                var: DEBOUNCE_SAMPLES_VAR,
                value: samples.to_string(),
            })?;
        }
        if let Some(ms) = parse_var(&lookup, DEADLOCK_WINDOW_VAR)? {
            config.deadlock_window = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the knobs describe a usable monitor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_period.is_zero() {
            return Err(ConfigError::ZeroPollPeriod);
        }
        if self.debounce_samples == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        if self.deadlock_window <= self.poll_period {
            return Err(ConfigError::WindowTooShort {
                window: self.deadlock_window,
                poll_period: self.poll_period,
            });
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let parsed = raw.trim().parse();
    parsed.map(Some).map_err(|_| ConfigError::Invalid { var, value: raw })
}
