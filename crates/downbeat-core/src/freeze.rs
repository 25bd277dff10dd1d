//! Reference-counted freeze gate.
//!
//! While any holder is inside a frozen section the monitor may not advance
//! the clock, even if every unit looks blocked. Several units may hold the
//! gate at once.
//!
//! Scoped holds ([`FreezeGate::hold`]) and explicit ones
//! ([`FreezeGate::enter`] / [`FreezeGate::exit`]) are counted apart, so an
//! unbalanced `exit` can never release a hold some guard still owns.

use std::sync::{Mutex, MutexGuard};

use crate::{
    error::{ConductorError, Misuse},
    sync::lock,
};

/// Hold counts behind the gate's lock.
#[derive(Debug, Default)]
pub(crate) struct Holds {
    /// Owned by live [`FreezeGuard`]s
    scoped: usize,
    /// Taken with `enter`, released with `exit`
    explicit: usize,
}

impl Holds {
    pub(crate) fn total(&self) -> usize {
        self.scoped + self.explicit
    }
}

/// Hold-counted gate suspending clock advancement.
#[derive(Debug, Default)]
pub struct FreezeGate {
    holds: Mutex<Holds>,
}

impl FreezeGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a frozen section.
    pub fn enter(&self) {
        let mut holds = lock(&self.holds);
        holds.explicit += 1;
        tracing::trace!(holds = holds.total(), "clock frozen");
    }

    /// Leave a frozen section entered with [`FreezeGate::enter`].
    ///
    /// # Errors
    ///
    /// - [`Misuse::FreezeUnderflow`] if there is no matching
    ///   [`FreezeGate::enter`]; holds owned by a [`FreezeGuard`] do not count
    pub fn exit(&self) -> Result<(), ConductorError> {
        let mut holds = lock(&self.holds);
        if holds.explicit == 0 {
            tracing::warn!(scoped = holds.scoped, "unfreeze without matching freeze");
            return Err(Misuse::FreezeUnderflow.into());
        }
        holds.explicit -= 1;
        tracing::trace!(holds = holds.total(), "clock unfrozen");
        Ok(())
    }

    /// Enter a frozen section that ends when the guard is dropped.
    #[must_use = "the clock unfreezes as soon as the guard is dropped"]
    pub fn hold(&self) -> FreezeGuard<'_> {
        let mut holds = lock(&self.holds);
        holds.scoped += 1;
        tracing::trace!(holds = holds.total(), "clock frozen");
        FreezeGuard { gate: self }
    }

    /// Whether at least one holder is inside a frozen section.
    pub fn is_frozen(&self) -> bool {
        self.holds() > 0
    }

    /// Current hold-count, scoped and explicit together.
    pub fn holds(&self) -> usize {
        lock(&self.holds).total()
    }

    /// Lock the hold counts; the clock keeps them locked across a tick.
    pub(crate) fn lock_holds(&self) -> MutexGuard<'_, Holds> {
        lock(&self.holds)
    }
}

/// Scoped hold on a [`FreezeGate`].
///
/// Releases its hold on drop, including while unwinding from a panic.
#[derive(Debug)]
pub struct FreezeGuard<'a> {
    gate: &'a FreezeGate,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        let mut holds = lock(&self.gate.holds);
        // Only this guard's constructor incremented `scoped`.
        holds.scoped -= 1;
        tracing::trace!(holds = holds.total(), "clock unfrozen");
    }
}
