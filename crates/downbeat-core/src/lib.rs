//! Deterministic concurrency conductor.
//!
//! Spawns named units of work on real OS threads and forces them into a
//! reproducible interleaving with a shared logical clock, the *beat*. A
//! background monitor samples every unit; when all of them are durably
//! blocked (parked on a beat, finished, or stuck in an opaque blocking call)
//! the clock advances by one and the units waiting for that beat resume.
//!
//! # Architecture
//!
//! ```text
//!  test thread            unit threads                 monitor thread
//!  ───────────            ────────────                 ──────────────
//!  thread(..) ─┐
//!  thread(..) ─┤
//!  conduct() ──┴──> StartGate ──> body(&Conductor)
//!     │                              │ wait_for_beat(n)
//!     │                              └───> Clock <──── try_advance()
//!     │                                     ▲              │
//!     │                                FreezeGate          │ Quiescence
//!     │                                                    │ (pure decisions)
//!     └──────────── join <──────── Verdict ◄───────────────┘
//! ```
//!
//! The quiescence decisions live in [`Quiescence`], a pure state machine that
//! takes samples and time as input and returns a [`MonitorAction`]. The
//! monitor loop only samples and executes those actions, so the blocking
//! heuristic is testable without threads.
//!
//! # Example
//!
//! ```no_run
//! use downbeat_core::Conductor;
//!
//! let conductor = Conductor::new();
//! conductor.thread("first", |c| {
//!     c.wait_for_beat(1);
//! })?;
//! conductor.thread("second", |c| {
//!     assert_eq!(c.beat(), 0);
//! })?;
//! conductor.conduct()?;
//! # Ok::<(), downbeat_core::ConductorError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod conductor;
pub mod config;
pub mod error;
pub mod freeze;
pub mod monitor;
pub mod probe;
mod sync;
pub mod unit;

pub use clock::{Advance, Beat, Clock, ClockSnapshot};
pub use conductor::{Conductor, Phase};
pub use config::ConductorConfig;
pub use error::{
    ConductorError, ConfigError, DeadlockReport, Misuse, UnitError, UnitFailure, UnitReport,
    UnitState,
};
pub use freeze::{FreezeGate, FreezeGuard};
pub use monitor::{MonitorAction, Quiescence, UnitStatus};
pub use probe::{OsThread, ProcfsProbe, RunState, RunStateProbe};
pub use unit::{UnitHandle, UnitOutcome, UnitResult};
