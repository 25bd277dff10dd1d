//! Managed units: one conductor-tracked body of concurrent work each.
//!
//! A unit's outcome is written exactly once, by the unit's own thread, when
//! its body returns or unwinds. Everyone else only reads it.

use std::{
    any::Any,
    error::Error as StdError,
    sync::{Arc, Mutex, OnceLock},
    thread::ThreadId,
};

use crate::{
    conductor::Conductor,
    error::{UnitError, UnitFailure},
    probe::OsThread,
    sync::lock,
};

/// Value a unit body or post-condition may return.
///
/// Implemented for `()` and for `Result<(), E>` with any boxable error, so
/// bodies can use `?` or plain assertions.
pub trait UnitResult {
    /// Convert into the conductor's outcome representation.
    fn into_unit_result(self) -> Result<(), UnitError>;
}

impl UnitResult for () {
    fn into_unit_result(self) -> Result<(), UnitError> {
        Ok(())
    }
}

impl<E> UnitResult for Result<(), E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn into_unit_result(self) -> Result<(), UnitError> {
        self.map_err(UnitError::returned)
    }
}

/// Terminal (or not yet terminal) state of a unit.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    /// Not started or still running
    Pending,
    /// Body returned normally
    Succeeded,
    /// Body panicked or returned an error
    Failed(UnitFailure),
    /// Unwound out of a beat wait after the scenario deadlocked
    Aborted,
}

impl UnitOutcome {
    /// True once the body has finished, one way or another.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The recorded failure, if any.
    pub fn failure(&self) -> Option<&UnitFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Boxed unit body, type-erased over its return value.
pub(crate) type Body = Box<dyn FnOnce(&Conductor) -> Result<(), UnitError> + Send + 'static>;

/// Thread identity a unit reports before running its body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Identity {
    pub(crate) thread: ThreadId,
    pub(crate) os_thread: Option<OsThread>,
}

#[derive(Debug)]
pub(crate) struct UnitRecord {
    name: String,
    identity: OnceLock<Identity>,
    outcome: Mutex<UnitOutcome>,
}

impl UnitRecord {
    pub(crate) fn new(name: String) -> Self {
        Self { name, identity: OnceLock::new(), outcome: Mutex::new(UnitOutcome::Pending) }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn identity(&self) -> Option<Identity> {
        self.identity.get().copied()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        let fresh = self.identity.set(identity).is_ok();
        debug_assert!(fresh, "unit `{}` identified twice", self.name);
    }

    pub(crate) fn outcome(&self) -> UnitOutcome {
        lock(&self.outcome).clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        lock(&self.outcome).is_terminal()
    }

    pub(crate) fn finish(&self, outcome: UnitOutcome) {
        let mut slot = lock(&self.outcome);
        debug_assert!(!slot.is_terminal(), "unit `{}` finished twice", self.name);
        *slot = outcome;
    }
}

/// Handle to a registered unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    record: Arc<UnitRecord>,
}

impl UnitHandle {
    pub(crate) fn new(record: Arc<UnitRecord>) -> Self {
        Self { record }
    }

    /// Unit name, unique within its conductor.
    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Current outcome.
    pub fn outcome(&self) -> UnitOutcome {
        self.record.outcome()
    }

    /// True once the body has finished.
    pub fn is_finished(&self) -> bool {
        self.record.is_finished()
    }
}

/// Panic payload used to unwind a unit out of an aborted beat wait.
pub(crate) struct AbortUnwind;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, panic};

    use super::*;

    #[derive(Debug)]
    struct Overflow;

    impl fmt::Display for Overflow {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "counter overflowed")
        }
    }

    impl StdError for Overflow {}

    #[test]
    fn unit_and_ok_are_success() {
        assert!(().into_unit_result().is_ok());
        assert!(Ok::<(), Overflow>(()).into_unit_result().is_ok());
    }

    #[test]
    fn returned_error_is_preserved() {
        let err = Err::<(), _>(Overflow).into_unit_result().unwrap_err();
        assert_eq!(err.to_string(), "counter overflowed");
        assert!(err.downcast_ref::<Overflow>().is_some());
        assert!(!err.is_panic());
    }

    #[test]
    fn string_errors_convert() {
        let err = Err::<(), _>("buffer not empty").into_unit_result().unwrap_err();
        assert_eq!(err.to_string(), "buffer not empty");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| {
            panic::resume_unwind(Box::new("static message"));
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = panic::catch_unwind(|| {
            panic::resume_unwind(Box::new(format!("formatted {}", 42)));
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = panic::catch_unwind(|| {
            panic::resume_unwind(Box::new(7_u32));
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn outcome_is_recorded_once() {
        let record = Arc::new(UnitRecord::new("worker".to_string()));
        let handle = UnitHandle::new(Arc::clone(&record));

        assert!(!handle.is_finished());
        record.finish(UnitOutcome::Succeeded);

        assert!(handle.is_finished());
        assert!(matches!(handle.outcome(), UnitOutcome::Succeeded));
        assert_eq!(handle.name(), "worker");
    }
}
