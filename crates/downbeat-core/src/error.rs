//! Error types for the conductor.
//!
//! Failures are split by who caused them: a unit body ([`UnitFailure`],
//! aggregated into [`ConductorError::UnitsFailed`]), the post-condition, the
//! scenario as a whole (deadlock), or the test author calling the API in the
//! wrong phase ([`Misuse`]).
//!
//! Unit errors never cross between units. They are captured on the unit's
//! own thread, stored as values, and surface only through `conduct()`.

use std::{error::Error as StdError, fmt, io, sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::clock::Beat;

/// Why a single unit body failed.
#[derive(Debug, Clone)]
pub enum UnitError {
    /// Body panicked
    Panicked {
        /// Panic payload, if it was a string
        message: String,
    },
    /// Body returned an error
    Returned(Arc<dyn StdError + Send + Sync>),
}

impl UnitError {
    /// Wrap an error returned by a unit body or post-condition.
    pub fn returned<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Returned(Arc::from(error.into()))
    }

    /// Returned error downcast to a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Returned(error) => error.downcast_ref(),
            Self::Panicked { .. } => None,
        }
    }

    /// True if the body panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked { message } => write!(f, "panicked: {message}"),
            Self::Returned(error) => write!(f, "{error}"),
        }
    }
}

impl StdError for UnitError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Returned(error) => Some(&**error),
            Self::Panicked { .. } => None,
        }
    }
}

/// A unit's failure, stamped with the beat at which it was recorded.
#[derive(Error, Debug, Clone)]
#[error("unit `{unit}` failed at beat {beat}: {error}")]
pub struct UnitFailure {
    /// Unit name
    pub unit: String,
    /// Beat when the failure was recorded
    pub beat: Beat,
    /// What went wrong
    #[source]
    pub error: UnitError,
}

/// API called in the wrong phase or with inconsistent arguments.
///
/// These are programming errors in the test itself; they are reported
/// immediately and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Misuse {
    /// Unit registered once conducting has begun
    #[error("cannot register unit `{unit}` after conduct has started")]
    RegistrationAfterStart {
        /// Name of the rejected unit
        unit: String,
    },

    /// `conduct()` called a second time
    #[error("conduct was already called on this conductor")]
    AlreadyConducted,

    /// Unit name already taken
    #[error("a unit named `{0}` is already registered")]
    DuplicateUnitName(String),

    /// Unfreeze without a matching freeze
    #[error("unfreeze without a matching freeze")]
    FreezeUnderflow,

    /// Post-condition registered once conducting has finished
    #[error("cannot register a post-condition after conduct has finished")]
    PostConditionAfterFinish,
}

/// Invalid conductor configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Poll period of zero would spin
    #[error("poll period must be non-zero")]
    ZeroPollPeriod,

    /// At least one sample is needed to call a unit blocked
    #[error("debounce sample count must be at least 1")]
    ZeroDebounce,

    /// Window must cover at least one poll period
    #[error("deadlock window {window:?} must be longer than the poll period {poll_period:?}")]
    WindowTooShort {
        /// Configured deadlock window
        window: Duration,
        /// Configured poll period
        poll_period: Duration,
    },

    /// Environment variable set to something unparsable
    #[error("invalid value {value:?} for {var}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// What a unit was doing when the deadlock was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    /// Body returned or failed
    Finished,
    /// Parked in `wait_for_beat`
    WaitingForBeat {
        /// Beat it waits for
        target: Beat,
    },
    /// Released from a beat wait but not yet running
    Resuming,
    /// Not runnable in a conductor-unaware call
    Blocked,
    /// Runnable, or the probe could not tell
    Running,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "finished"),
            Self::WaitingForBeat { target } => write!(f, "waiting for beat {target}"),
            Self::Resuming => write!(f, "resuming"),
            Self::Blocked => write!(f, "blocked"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// One unit's line in a [`DeadlockReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    /// Unit name
    pub name: String,
    /// State at detection
    #[serde(flatten)]
    pub state: UnitState,
}

/// State of a scenario when the monitor gave up on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    /// Beat at detection
    pub beat: Beat,
    /// Time since the last observed progress
    pub stalled_for: Duration,
    /// Every unit in registration order
    pub units: Vec<UnitReport>,
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no progress for {:?} at beat {}", self.stalled_for, self.beat)?;
        for (i, unit) in self.units.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}`{}` {}", unit.name, unit.state)?;
        }
        Ok(())
    }
}

/// Errors raised by a conductor.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// At least one unit failed
    ///
    /// `primary` is the first failure in registration order; every other
    /// failing unit is listed in `auxiliary`.
    #[error("{primary}{}", auxiliary_suffix(.auxiliary))]
    UnitsFailed {
        /// First failing unit
        #[source]
        primary: UnitFailure,
        /// Remaining failing units
        auxiliary: Vec<UnitFailure>,
    },

    /// Post-condition returned an error
    #[error("post-condition failed: {0}")]
    PostCondition(#[source] UnitError),

    /// No progress within the deadlock window
    ///
    /// Attributed to the conductor. `failures` holds unit failures that were
    /// already recorded when the scenario stalled.
    #[error("deadlock detected, {report}")]
    Deadlock {
        /// Scenario state at detection
        report: DeadlockReport,
        /// Failures recorded before the stall
        failures: Vec<UnitFailure>,
    },

    /// API misuse
    #[error(transparent)]
    Misuse(#[from] Misuse),

    /// OS refused to spawn a unit or monitor thread
    #[error("failed to spawn thread `{thread}`")]
    Spawn {
        /// Thread name
        thread: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConductorError {
    /// Primary unit failure, if this error is an aggregate.
    pub fn primary(&self) -> Option<&UnitFailure> {
        match self {
            Self::UnitsFailed { primary, .. } => Some(primary),
            _ => None,
        }
    }

    /// Every unit failure carried by this error, primary first.
    pub fn failures(&self) -> Vec<&UnitFailure> {
        match self {
            Self::UnitsFailed { primary, auxiliary } => {
                std::iter::once(primary).chain(auxiliary).collect()
            },
            Self::Deadlock { failures, .. } => failures.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// True for a deadlock failure.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}

fn auxiliary_suffix(auxiliary: &[UnitFailure]) -> String {
    if auxiliary.is_empty() {
        return String::new();
    }
    let units: Vec<_> = auxiliary.iter().map(|f| format!("`{}`", f.unit)).collect();
    format!(" (also failed: {})", units.join(", "))
}
