//! Logical beat clock.
//!
//! The clock is the only total order the conductor promises. Units park in
//! [`Clock::wait_until`]; the monitor advances the beat through
//! [`Clock::try_advance`]. Both take the same mutex, so a unit can never
//! decide to block for beat N after the monitor has already decided that
//! everyone is blocked and advanced past it.
//!
//! # Waiter lifecycle
//!
//! ```text
//!  wait_until(n)        try_advance()          unit wakes
//! ──────────────> Parked ───────────> Resuming ──────────> removed
//!                (beat < n)          (beat >= n)
//! ```
//!
//! A released waiter keeps its entry until its own thread has woken up and
//! removed it. The monitor treats such an entry as "resuming", which keeps
//! a slow-to-wake unit from being mistaken for a blocked one.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
};

use thiserror::Error;

use crate::{
    freeze::FreezeGate,
    sync::{lock, wait},
};

/// Logical clock tick.
pub type Beat = u64;

/// The clock was aborted while a thread was parked on it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("clock aborted while waiting for beat {target}")]
pub struct ClockAborted {
    /// Beat the parked thread was waiting for
    pub target: Beat,
}

/// Result of a tick attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Beat was incremented
    Advanced {
        /// New beat
        beat: Beat,
        /// Waiters whose target is exactly the new beat
        released: usize,
    },
    /// Freeze gate is held; beat unchanged
    Frozen,
    /// Waiter table changed since it was sampled; beat unchanged
    Stale,
    /// Clock was aborted; beat unchanged
    Aborted,
}

/// Consistent view of the clock taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSnapshot {
    /// Current beat
    pub beat: Beat,
    /// Bumped every time a waiter parks or resumes
    pub generation: u64,
    /// Outstanding wait requests, keyed by the parked thread
    pub waiters: HashMap<ThreadId, Beat>,
}

impl ClockSnapshot {
    /// Target beat of the thread's outstanding wait request, if any.
    pub fn waiting_target(&self, thread: ThreadId) -> Option<Beat> {
        self.waiters.get(&thread).copied()
    }
}

#[derive(Debug, Default)]
struct ClockState {
    beat: Beat,
    waiters: HashMap<ThreadId, Beat>,
    generation: u64,
    aborted: bool,
}

/// Beat clock shared by one conductor's units and its monitor.
#[derive(Debug, Default)]
pub struct Clock {
    state: Mutex<ClockState>,
    released: Condvar,
}

impl Clock {
    /// Create a clock at beat 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current beat.
    pub fn current(&self) -> Beat {
        lock(&self.state).beat
    }

    /// Whether [`Clock::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        lock(&self.state).aborted
    }

    /// Park the calling thread until the beat reaches `target`.
    ///
    /// Returns immediately when the beat is already at or past `target`.
    /// Otherwise registers a wait request for the calling thread and blocks.
    /// The returned beat is read under the same lock that removes the wait
    /// request, so it is always `>= target`.
    ///
    /// # Errors
    ///
    /// - [`ClockAborted`] if the clock is aborted before `target` is reached
    pub fn wait_until(&self, target: Beat) -> Result<Beat, ClockAborted> {
        let mut state = lock(&self.state);
        if state.beat >= target {
            return Ok(state.beat);
        }
        if state.aborted {
            return Err(ClockAborted { target });
        }

        let me = thread::current().id();
        state.waiters.insert(me, target);
        state.generation += 1;
        tracing::trace!(target_beat = target, beat = state.beat, "parked");

        while state.beat < target && !state.aborted {
            state = wait(&self.released, state);
        }

        state.waiters.remove(&me);
        state.generation += 1;

        if state.beat >= target { Ok(state.beat) } else { Err(ClockAborted { target }) }
    }

    /// Advance the beat by one, unless frozen or stale.
    ///
    /// Lock order is freeze gate, then clock. Holding the gate's lock across
    /// the increment means a freeze entered concurrently either blocks this
    /// tick or starts strictly after it.
    ///
    /// `observed_generation` is the generation of the snapshot the caller
    /// based its quiescence decision on. If any thread parked or resumed
    /// since, the decision is outdated and the tick is refused.
    pub fn try_advance(&self, gate: &FreezeGate, observed_generation: u64) -> Advance {
        let holds = gate.lock_holds();
        if holds.total() > 0 {
            return Advance::Frozen;
        }

        let mut state = lock(&self.state);
        if state.aborted {
            return Advance::Aborted;
        }
        if state.generation != observed_generation {
            return Advance::Stale;
        }

        state.beat += 1;
        let beat = state.beat;
        let released = state.waiters.values().filter(|&&target| target == beat).count();
        drop(state);
        drop(holds);

        self.released.notify_all();
        Advance::Advanced { beat, released }
    }

    /// Abort the clock, waking every parked thread with [`ClockAborted`].
    pub fn abort(&self) {
        lock(&self.state).aborted = true;
        self.released.notify_all();
    }

    /// Take a consistent snapshot of beat, generation and waiters.
    pub fn snapshot(&self) -> ClockSnapshot {
        let state = lock(&self.state);
        ClockSnapshot {
            beat: state.beat,
            generation: state.generation,
            waiters: state.waiters.clone(),
        }
    }
}
