//! Conductor façade.
//!
//! Registers units, runs them behind a starting gate, drives the monitor and
//! turns the units' outcomes into a single result.
//!
//! # Phases
//!
//! ```text
//! ┌────────────┐  conduct()  ┌────────────┐  units joined  ┌──────────┐
//! │ NotStarted │────────────>│ Conducting │───────────────>│ Finished │
//! └────────────┘             └────────────┘                └──────────┘
//!   thread(..)                 when_finished(..)
//!   when_finished(..)
//! ```
//!
//! Transitions only go forward. A conductor conducts exactly once.

use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use crate::{
    clock::{Beat, Clock},
    config::ConductorConfig,
    error::{ConductorError, Misuse, UnitError, UnitFailure},
    freeze::FreezeGate,
    monitor::{self, Verdict},
    probe::{ProcfsProbe, RunStateProbe},
    sync::{lock, wait},
    unit::{
        AbortUnwind, Body, Identity, UnitHandle, UnitOutcome, UnitRecord, UnitResult,
        panic_message,
    },
};

/// Name of the monitor's control thread.
const MONITOR_THREAD: &str = "downbeat-monitor";

/// Conductor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting units
    NotStarted,
    /// Units running under the monitor
    Conducting,
    /// Every unit joined (or the scenario was abandoned)
    Finished,
}

type PostCondition = Box<dyn FnOnce() -> Result<(), UnitError> + Send + 'static>;

struct Roster {
    phase: Phase,
    units: Vec<Arc<UnitRecord>>,
    bodies: Vec<Body>,
    post_condition: Option<PostCondition>,
}

struct Inner {
    config: ConductorConfig,
    probe: Arc<dyn RunStateProbe>,
    clock: Clock,
    freeze: FreezeGate,
    roster: Mutex<Roster>,
}

/// Deterministic concurrency conductor.
///
/// Cheap to clone; clones share the same units and clock. Unit bodies
/// receive a `&Conductor` so they can read and wait on the beat.
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<Inner>,
}

impl Default for Conductor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Conductor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conductor")
            .field("phase", &self.phase())
            .field("beat", &self.beat())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Conductor {
    /// Create a conductor with the default configuration and procfs probe.
    pub fn new() -> Self {
        Self::build(ConductorConfig::default(), Arc::new(ProcfsProbe::new()))
    }

    /// Create a conductor with a custom configuration.
    pub fn with_config(config: ConductorConfig) -> Result<Self, ConductorError> {
        Self::with_probe(config, ProcfsProbe::new())
    }

    /// Create a conductor with a custom configuration and run-state probe.
    pub fn with_probe<P: RunStateProbe>(
        config: ConductorConfig,
        probe: P,
    ) -> Result<Self, ConductorError> {
        config.validate()?;
        Ok(Self::build(config, Arc::new(probe)))
    }

    fn build(config: ConductorConfig, probe: Arc<dyn RunStateProbe>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                clock: Clock::new(),
                freeze: FreezeGate::new(),
                roster: Mutex::new(Roster {
                    phase: Phase::NotStarted,
                    units: Vec::new(),
                    bodies: Vec::new(),
                    post_condition: None,
                }),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ConductorConfig {
        &self.inner.config
    }

    /// Register a named unit.
    ///
    /// The body runs on its own thread once [`Conductor::conduct`] opens the
    /// starting gate. Panics and returned errors are recorded as the unit's
    /// failure.
    ///
    /// # Errors
    ///
    /// - [`Misuse::RegistrationAfterStart`] once conducting has begun
    /// - [`Misuse::DuplicateUnitName`] if the name is taken
    pub fn thread<F, R>(&self, name: impl Into<String>, body: F) -> Result<UnitHandle, ConductorError>
    where
        F: FnOnce(&Conductor) -> R + Send + 'static,
        R: UnitResult,
    {
        self.register(Some(name.into()), Box::new(move |c: &Conductor| body(c).into_unit_result()))
    }

    /// Register a unit with a generated name (`unit-<n>`).
    pub fn unit<F, R>(&self, body: F) -> Result<UnitHandle, ConductorError>
    where
        F: FnOnce(&Conductor) -> R + Send + 'static,
        R: UnitResult,
    {
        self.register(None, Box::new(move |c: &Conductor| body(c).into_unit_result()))
    }

    fn register(&self, name: Option<String>, body: Body) -> Result<UnitHandle, ConductorError> {
        let mut roster = lock(&self.inner.roster);

        if roster.phase != Phase::NotStarted {
            let unit = name.unwrap_or_else(|| "<unnamed>".to_string());
            tracing::warn!(unit = %unit, phase = ?roster.phase, "unit registered after start");
            return Err(Misuse::RegistrationAfterStart { unit }.into());
        }

        let taken = |candidate: &str| roster.units.iter().any(|u| u.name() == candidate);
        let name = match name {
            Some(name) if taken(name.as_str()) => return Err(Misuse::DuplicateUnitName(name).into()),
            Some(name) => name,
            None => {
                let mut n = roster.units.len() + 1;
                loop {
                    let candidate = format!("unit-{n}");
                    if !taken(candidate.as_str()) {
                        break candidate;
                    }
                    n += 1;
                }
            },
        };

        let record = Arc::new(UnitRecord::new(name));
        roster.units.push(Arc::clone(&record));
        roster.bodies.push(body);
        Ok(UnitHandle::new(record))
    }

    /// Names of registered units, in registration order.
    pub fn unit_names(&self) -> Vec<String> {
        lock(&self.inner.roster).units.iter().map(|u| u.name().to_string()).collect()
    }

    /// Register the post-condition, run on the calling thread of
    /// [`Conductor::conduct`] after every unit succeeded.
    ///
    /// Registering again replaces the previous one.
    ///
    /// # Errors
    ///
    /// - [`Misuse::PostConditionAfterFinish`] once conducting has finished
    pub fn when_finished<F, R>(&self, post_condition: F) -> Result<(), ConductorError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: UnitResult,
    {
        let mut roster = lock(&self.inner.roster);
        if roster.phase == Phase::Finished {
            return Err(Misuse::PostConditionAfterFinish.into());
        }
        roster.post_condition = Some(Box::new(move || post_condition().into_unit_result()));
        Ok(())
    }

    /// Current beat.
    pub fn beat(&self) -> Beat {
        self.inner.clock.current()
    }

    /// Park the calling unit until the beat reaches `target`.
    ///
    /// Returns the beat at resumption, which is always `>= target`; units
    /// released by the same tick all observe the same value.
    ///
    /// Only unit threads are visible to the monitor. Calling this from any
    /// other thread (the test thread in particular) parks a thread the
    /// conductor cannot account for and can stall the scenario.
    pub fn wait_for_beat(&self, target: Beat) -> Beat {
        if self.beat() < target && !self.on_unit_thread() {
            tracing::warn!(target_beat = target, "wait_for_beat called outside a unit");
        }

        match self.inner.clock.wait_until(target) {
            Ok(beat) => beat,
            Err(aborted) => {
                tracing::debug!(%aborted, "unwinding parked unit");
                panic::resume_unwind(Box::new(AbortUnwind))
            },
        }
    }

    fn on_unit_thread(&self) -> bool {
        let me = thread::current().id();
        lock(&self.inner.roster)
            .units
            .iter()
            .any(|u| u.identity().is_some_and(|identity| identity.thread == me))
    }

    /// Run `f` with the clock frozen.
    ///
    /// The beat cannot change while `f` runs, even if every unit is blocked.
    /// The freeze is released when `f` returns or panics.
    pub fn with_frozen_clock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.freeze.hold();
        f()
    }

    /// Freeze the clock until a matching [`Conductor::unfreeze_clock`].
    pub fn freeze_clock(&self) {
        self.inner.freeze.enter();
    }

    /// Release one freeze taken with [`Conductor::freeze_clock`].
    ///
    /// # Errors
    ///
    /// - [`Misuse::FreezeUnderflow`] without a matching freeze
    pub fn unfreeze_clock(&self) -> Result<(), ConductorError> {
        self.inner.freeze.exit()
    }

    /// True while any freeze is held.
    pub fn is_frozen(&self) -> bool {
        self.inner.freeze.is_frozen()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        lock(&self.inner.roster).phase
    }

    /// True once [`Conductor::conduct`] has been called.
    pub fn has_conduct_begun(&self) -> bool {
        self.phase() != Phase::NotStarted
    }

    /// Run every registered unit to completion.
    ///
    /// Blocks the calling thread until all units have terminated or the
    /// scenario deadlocks. On success runs the post-condition, if any, on
    /// the calling thread. A panic in the post-condition propagates out of
    /// this call unchanged.
    ///
    /// # Errors
    ///
    /// - [`Misuse::AlreadyConducted`] on a second call
    /// - [`ConductorError::UnitsFailed`] if any unit failed
    /// - [`ConductorError::Deadlock`] if no progress was seen for the
    ///   configured window
    /// - [`ConductorError::PostCondition`] if the post-condition returned an
    ///   error
    /// - [`ConductorError::Spawn`] if a thread could not be spawned
    pub fn conduct(&self) -> Result<(), ConductorError> {
        let (units, bodies) = {
            let mut roster = lock(&self.inner.roster);
            if roster.phase != Phase::NotStarted {
                return Err(Misuse::AlreadyConducted.into());
            }
            roster.phase = Phase::Conducting;
            (roster.units.clone(), std::mem::take(&mut roster.bodies))
        };

        tracing::info!(units = units.len(), "conducting");

        let verdict = if units.is_empty() { Ok(Verdict::Completed) } else { self.perform(&units, bodies) };
        lock(&self.inner.roster).phase = Phase::Finished;

        let failures: Vec<UnitFailure> =
            units.iter().filter_map(|u| u.outcome().failure().cloned()).collect();

        if let Verdict::Deadlock(report) = verdict? {
            return Err(ConductorError::Deadlock { report, failures });
        }

        let mut failures = failures.into_iter();
        if let Some(primary) = failures.next() {
            let auxiliary: Vec<_> = failures.collect();
            tracing::info!(unit = %primary.unit, others = auxiliary.len(), "units failed");
            return Err(ConductorError::UnitsFailed { primary, auxiliary });
        }

        let post_condition = lock(&self.inner.roster).post_condition.take();
        if let Some(post_condition) = post_condition {
            post_condition().map_err(ConductorError::PostCondition)?;
        }

        tracing::info!(beat = self.beat(), "conduct finished");
        Ok(())
    }

    /// Spawn units and monitor, open the gate, wait for the verdict.
    fn perform(&self, units: &[Arc<UnitRecord>], bodies: Vec<Body>) -> Result<Verdict, ConductorError> {
        let gate = Arc::new(StartGate::default());
        let mut handles = Vec::with_capacity(units.len());

        for (record, body) in units.iter().zip(bodies) {
            match self.spawn_unit(Arc::clone(record), body, Arc::clone(&gate)) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    gate.cancel();
                    join_all(handles);
                    return Err(ConductorError::Spawn { thread: record.name().to_string(), source });
                },
            }
        }

        gate.await_arrivals(units.len());

        let monitor = {
            let conductor = self.clone();
            let units = units.to_vec();
            let gate = Arc::clone(&gate);
            thread::Builder::new()
                .name(MONITOR_THREAD.to_string())
                .spawn(move || conductor.monitor(&units, &gate))
        };
        let monitor = match monitor {
            Ok(monitor) => monitor,
            Err(source) => {
                gate.cancel();
                join_all(handles);
                return Err(ConductorError::Spawn { thread: MONITOR_THREAD.to_string(), source });
            },
        };

        gate.open();

        let verdict = match monitor.join() {
            Ok(verdict) => verdict,
            Err(payload) => {
                tracing::warn!("monitor panicked, abandoning units");
                self.inner.clock.abort();
                lock(&self.inner.roster).phase = Phase::Finished;
                panic::resume_unwind(payload)
            },
        };

        match verdict {
            Verdict::Completed => join_all(handles),
            Verdict::Deadlock(_) => {
                // Parked units unwind; units stuck in opaque calls stay
                // detached.
                self.inner.clock.abort();
                drop(handles);
            },
        }

        Ok(verdict)
    }

    fn spawn_unit(
        &self,
        record: Arc<UnitRecord>,
        body: Body,
        gate: Arc<StartGate>,
    ) -> io::Result<JoinHandle<()>> {
        let conductor = self.clone();
        let thread_name = record.name().replace('\0', "");

        thread::Builder::new().name(thread_name).spawn(move || {
            record.set_identity(Identity {
                thread: thread::current().id(),
                os_thread: conductor.inner.probe.identify(),
            });

            if !gate.arrive_and_wait() {
                return;
            }

            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&conductor))) {
                Ok(Ok(())) => UnitOutcome::Succeeded,
                Ok(Err(error)) => conductor.failed(&record, error),
                Err(payload) if payload.is::<AbortUnwind>() => UnitOutcome::Aborted,
                Err(payload) => conductor
                    .failed(&record, UnitError::Panicked { message: panic_message(payload.as_ref()) }),
            };

            tracing::debug!(unit = record.name(), beat = conductor.beat(), ?outcome, "unit finished");
            record.finish(outcome);
        })
    }

    fn failed(&self, record: &UnitRecord, error: UnitError) -> UnitOutcome {
        UnitOutcome::Failed(UnitFailure { unit: record.name().to_string(), beat: self.beat(), error })
    }

    fn monitor(&self, units: &[Arc<UnitRecord>], gate: &StartGate) -> Verdict {
        if !gate.wait_open() {
            return Verdict::Completed;
        }
        monitor::run(
            units,
            &self.inner.clock,
            &self.inner.freeze,
            self.inner.probe.as_ref(),
            &self.inner.config,
        )
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        // Bodies run under catch_unwind; a join error would be a bug in the
        // wrapper itself and carries nothing to report.
        let _ = handle.join();
    }
}

/// Starting gate: units report in, then all start at once.
#[derive(Default)]
struct StartGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    /// `Some(true)` open, `Some(false)` cancelled
    open: Option<bool>,
}

impl StartGate {
    /// Report in and wait. Returns false if the gate was cancelled.
    fn arrive_and_wait(&self) -> bool {
        let mut state = lock(&self.state);
        state.arrived += 1;
        self.changed.notify_all();
        while state.open.is_none() {
            state = wait(&self.changed, state);
        }
        state.open == Some(true)
    }

    fn wait_open(&self) -> bool {
        let mut state = lock(&self.state);
        while state.open.is_none() {
            state = wait(&self.changed, state);
        }
        state.open == Some(true)
    }

    fn await_arrivals(&self, expected: usize) {
        let mut state = lock(&self.state);
        while state.arrived < expected && state.open.is_none() {
            state = wait(&self.changed, state);
        }
    }

    fn open(&self) {
        lock(&self.state).open = Some(true);
        self.changed.notify_all();
    }

    fn cancel(&self) {
        lock(&self.state).open = Some(false);
        self.changed.notify_all();
    }
}
