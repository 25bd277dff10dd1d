//! Quiescence monitor.
//!
//! Decides when the clock may tick. The decision logic is the pure state
//! machine [`Quiescence`]: it takes per-unit samples and the current time
//! and returns a [`MonitorAction`]. The loop in this module (run on the
//! conductor's control thread) only samples units and executes actions.
//!
//! # Blocking heuristic
//!
//! ```text
//!  Terminated ─────────────────────────────┐
//!  Parked (beat < target) ─────────────────┤
//!  Running(Blocked) x debounce_samples ────┴──> durably blocked
//!
//!  Resuming, Running(Runnable), Running(Unknown) ──> not blocked
//! ```
//!
//! Every unit durably blocked, at least one of them parked on a future beat
//! and the freeze gate open: tick. A tick with nobody parked could not wake
//! anyone, so it is not taken.
//!
//! A unit that the scheduler merely preempted is `R` in procfs, so it never
//! counts as blocked; a unit that was just woken can still read as sleeping
//! for a moment, which is what the debounce absorbs.
//!
//! # Deadlock
//!
//! Progress is a tick or a unit terminating. No progress for
//! `deadlock_window` is a deadlock: the clock is frozen under a parked
//! unit, or every unit is stuck in a conductor-unaware call.

use std::{
    ops::Sub,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    clock::{Advance, Beat, Clock, ClockSnapshot},
    config::ConductorConfig,
    error::{DeadlockReport, UnitReport, UnitState},
    freeze::FreezeGate,
    probe::{RunState, RunStateProbe},
    unit::UnitRecord,
};

/// What a unit looked like in one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    /// Body finished
    Terminated,
    /// Parked in a beat wait the clock has not reached yet
    Parked {
        /// Beat the unit waits for
        target: Beat,
    },
    /// Released from a beat wait, not yet running again
    Resuming,
    /// Outside any beat wait; run state as reported by the probe
    Running(RunState),
}

impl From<UnitStatus> for UnitState {
    fn from(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Terminated => Self::Finished,
            UnitStatus::Parked { target } => Self::WaitingForBeat { target },
            UnitStatus::Resuming => Self::Resuming,
            UnitStatus::Running(RunState::Blocked | RunState::Exited) => Self::Blocked,
            UnitStatus::Running(RunState::Runnable | RunState::Unknown) => Self::Running,
        }
    }
}

/// Action returned by [`Quiescence::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Keep sampling
    Wait,
    /// Every unit is durably blocked, one is parked and the clock is not
    /// frozen
    Tick,
    /// Every unit has terminated
    Finished,
    /// No progress within the deadlock window
    Deadlock {
        /// Time since the last progress
        stalled_for: Duration,
    },
}

/// Quiescence decision state machine.
///
/// Pure: no threads, no clock access, time passed in. Generic over the
/// instant type so tests can drive it with synthetic time.
#[derive(Debug, Clone)]
pub struct Quiescence<I = Instant>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    debounce_samples: u32,
    deadlock_window: Duration,
    /// Consecutive non-runnable samples per unit
    blocked_streak: Vec<u32>,
    /// Terminated units in the previous sample
    terminated: usize,
    last_progress: I,
}

impl<I> Quiescence<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a monitor for `units` units, starting the progress clock at
    /// `now`.
    pub fn new(units: usize, config: &ConductorConfig, now: I) -> Self {
        Self {
            debounce_samples: config.debounce_samples.max(1),
            deadlock_window: config.deadlock_window,
            blocked_streak: vec![0; units],
            terminated: 0,
            last_progress: now,
        }
    }

    /// Feed one sample of every unit, in registration order.
    pub fn observe(&mut self, now: I, statuses: &[UnitStatus], frozen: bool) -> MonitorAction {
        debug_assert_eq!(statuses.len(), self.blocked_streak.len());

        let terminated = statuses.iter().filter(|s| **s == UnitStatus::Terminated).count();
        if terminated == statuses.len() {
            return MonitorAction::Finished;
        }

        if terminated > self.terminated {
            self.last_progress = now;
        }
        self.terminated = terminated;

        let mut all_blocked = true;
        let mut any_parked = false;
        for (status, streak) in statuses.iter().zip(self.blocked_streak.iter_mut()) {
            let blocked = match status {
                UnitStatus::Terminated => {
                    *streak = 0;
                    true
                },
                UnitStatus::Parked { .. } => {
                    *streak = 0;
                    any_parked = true;
                    true
                },
                UnitStatus::Resuming
                | UnitStatus::Running(RunState::Runnable | RunState::Unknown) => {
                    *streak = 0;
                    false
                },
                UnitStatus::Running(RunState::Blocked | RunState::Exited) => {
                    *streak = streak.saturating_add(1);
                    *streak >= self.debounce_samples
                },
            };
            all_blocked &= blocked;
        }

        let stalled_for = now - self.last_progress;
        if stalled_for >= self.deadlock_window {
            return MonitorAction::Deadlock { stalled_for };
        }

        if all_blocked && any_parked && !frozen { MonitorAction::Tick } else { MonitorAction::Wait }
    }

    /// Record a tick that went through.
    ///
    /// Debounce streaks restart so the next tick needs fresh evidence.
    pub fn record_tick(&mut self, now: I) {
        self.blocked_streak.fill(0);
        self.last_progress = now;
    }
}

/// How the monitor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Every unit terminated
    Completed,
    /// Scenario stalled
    Deadlock(DeadlockReport),
}

/// Run the monitor loop until every unit terminates or the scenario stalls.
pub(crate) fn run(
    units: &[Arc<UnitRecord>],
    clock: &Clock,
    gate: &FreezeGate,
    probe: &dyn RunStateProbe,
    config: &ConductorConfig,
) -> Verdict {
    let mut quiescence = Quiescence::new(units.len(), config, Instant::now());

    loop {
        thread::sleep(config.poll_period);

        let snapshot = clock.snapshot();
        let statuses: Vec<_> = units.iter().map(|unit| classify(unit, &snapshot, probe)).collect();
        let now = Instant::now();

        match quiescence.observe(now, &statuses, gate.is_frozen()) {
            MonitorAction::Wait => {},
            MonitorAction::Tick => match clock.try_advance(gate, snapshot.generation) {
                Advance::Advanced { beat, released } => {
                    tracing::debug!(beat, released, "clock advanced");
                    quiescence.record_tick(now);
                },
                refused => tracing::trace!(?refused, "tick refused"),
            },
            MonitorAction::Finished => return Verdict::Completed,
            MonitorAction::Deadlock { stalled_for } => {
                let report = DeadlockReport {
                    beat: snapshot.beat,
                    stalled_for,
                    units: units
                        .iter()
                        .zip(statuses)
                        .map(|(unit, status)| UnitReport {
                            name: unit.name().to_string(),
                            state: status.into(),
                        })
                        .collect(),
                };
                tracing::warn!(%report, "deadlock detected");
                return Verdict::Deadlock(report);
            },
        }
    }
}

fn classify(unit: &UnitRecord, snapshot: &ClockSnapshot, probe: &dyn RunStateProbe) -> UnitStatus {
    if unit.is_finished() {
        return UnitStatus::Terminated;
    }
    let Some(identity) = unit.identity() else {
        return UnitStatus::Running(RunState::Unknown);
    };

    match snapshot.waiting_target(identity.thread) {
        Some(target) if target > snapshot.beat => UnitStatus::Parked { target },
        Some(_) => UnitStatus::Resuming,
        None => UnitStatus::Running(
            identity.os_thread.map_or(RunState::Unknown, |thread| probe.sample(thread)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKED: UnitStatus = UnitStatus::Running(RunState::Blocked);
    const RUNNABLE: UnitStatus = UnitStatus::Running(RunState::Runnable);
    const PARKED: UnitStatus = UnitStatus::Parked { target: 1 };

    fn config() -> ConductorConfig {
        ConductorConfig::default()
            .with_debounce_samples(2)
            .with_deadlock_window(Duration::from_millis(100))
    }

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn all_terminated_finishes() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [UnitStatus::Terminated, UnitStatus::Terminated];
        assert_eq!(q.observe(at(10), &statuses, false), MonitorAction::Finished);
    }

    #[test]
    fn parked_units_tick_without_debounce() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [PARKED, UnitStatus::Terminated];
        assert_eq!(q.observe(at(10), &statuses, false), MonitorAction::Tick);
    }

    #[test]
    fn opaque_block_needs_consecutive_samples() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [PARKED, BLOCKED];

        assert_eq!(q.observe(at(10), &statuses, false), MonitorAction::Wait);
        assert_eq!(q.observe(at(20), &statuses, false), MonitorAction::Tick);
    }

    #[test]
    fn runnable_sample_resets_debounce() {
        let mut q = Quiescence::new(2, &config(), at(0));

        assert_eq!(q.observe(at(10), &[PARKED, BLOCKED], false), MonitorAction::Wait);
        assert_eq!(q.observe(at(20), &[PARKED, RUNNABLE], false), MonitorAction::Wait);
        assert_eq!(q.observe(at(30), &[PARKED, BLOCKED], false), MonitorAction::Wait);
        assert_eq!(q.observe(at(40), &[PARKED, BLOCKED], false), MonitorAction::Tick);
    }

    #[test]
    fn resuming_unit_prevents_tick() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [UnitStatus::Resuming, UnitStatus::Parked { target: 2 }];

        assert_eq!(q.observe(at(10), &statuses, false), MonitorAction::Wait);
        assert_eq!(q.observe(at(20), &statuses, false), MonitorAction::Wait);
    }

    #[test]
    fn unknown_state_never_counts_as_blocked() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [PARKED, UnitStatus::Running(RunState::Unknown)];

        assert_eq!(q.observe(at(10), &statuses, false), MonitorAction::Wait);
        assert_eq!(q.observe(at(20), &statuses, false), MonitorAction::Wait);
    }

    #[test]
    fn frozen_clock_holds_tick() {
        let mut q = Quiescence::new(1, &config(), at(0));

        assert_eq!(q.observe(at(10), &[PARKED], true), MonitorAction::Wait);
        assert_eq!(q.observe(at(20), &[PARKED], false), MonitorAction::Tick);
    }

    #[test]
    fn tick_resets_debounce() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [PARKED, BLOCKED];

        q.observe(at(10), &statuses, false);
        assert_eq!(q.observe(at(20), &statuses, false), MonitorAction::Tick);
        q.record_tick(at(20));

        assert_eq!(q.observe(at(30), &statuses, false), MonitorAction::Wait);
        assert_eq!(q.observe(at(40), &statuses, false), MonitorAction::Tick);
    }

    #[test]
    fn no_tick_without_a_parked_unit() {
        let mut q = Quiescence::new(2, &config(), at(0));
        let statuses = [BLOCKED, UnitStatus::Terminated];

        for now in [10, 20, 30] {
            assert_eq!(q.observe(at(now), &statuses, false), MonitorAction::Wait);
        }
    }

    #[test]
    fn every_tick_counts_as_progress() {
        let mut q = Quiescence::new(1, &config(), at(0));
        let statuses = [UnitStatus::Parked { target: 1_000 }];

        // Far past the window: the clock keeps ticking toward the target.
        for now in (10..=1_000).step_by(10) {
            assert_eq!(q.observe(at(now), &statuses, false), MonitorAction::Tick);
            q.record_tick(at(now));
        }
    }

    #[test]
    fn frozen_parked_unit_deadlocks() {
        let mut q = Quiescence::new(1, &config(), at(0));

        assert_eq!(q.observe(at(90), &[PARKED], true), MonitorAction::Wait);
        assert_eq!(
            q.observe(at(100), &[PARKED], true),
            MonitorAction::Deadlock { stalled_for: at(100) }
        );
    }

    #[test]
    fn opaque_block_alone_deadlocks() {
        let mut q = Quiescence::new(1, &config(), at(0));

        let mut now = 0;
        let action = loop {
            now += 10;
            match q.observe(at(now), &[BLOCKED], false) {
                MonitorAction::Wait => {},
                other => break other,
            }
        };

        assert_eq!(action, MonitorAction::Deadlock { stalled_for: at(100) });
        assert_eq!(now, 100);
    }

    #[test]
    fn runnable_unit_is_not_progress() {
        let mut q = Quiescence::new(1, &config(), at(0));

        assert_eq!(q.observe(at(50), &[RUNNABLE], false), MonitorAction::Wait);
        assert_eq!(
            q.observe(at(100), &[RUNNABLE], false),
            MonitorAction::Deadlock { stalled_for: at(100) }
        );
    }

    #[test]
    fn termination_counts_as_progress() {
        let mut q = Quiescence::new(2, &config(), at(0));

        let waiting = [BLOCKED, BLOCKED];
        q.observe(at(10), &waiting, true);
        q.observe(at(60), &waiting, true);

        let one_done = [UnitStatus::Terminated, BLOCKED];
        assert_eq!(q.observe(at(90), &one_done, true), MonitorAction::Wait);
        assert_eq!(q.observe(at(180), &one_done, true), MonitorAction::Wait);
        assert_eq!(
            q.observe(at(190), &one_done, true),
            MonitorAction::Deadlock { stalled_for: at(100) }
        );
    }

    #[test]
    fn status_maps_to_report_state() {
        assert_eq!(UnitState::from(UnitStatus::Parked { target: 4 }), UnitState::WaitingForBeat {
            target: 4
        });
        assert_eq!(UnitState::from(BLOCKED), UnitState::Blocked);
        assert_eq!(UnitState::from(RUNNABLE), UnitState::Running);
        assert_eq!(UnitState::from(UnitStatus::Terminated), UnitState::Finished);
    }
}
