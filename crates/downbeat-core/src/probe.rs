//! Run-state abstraction for quiescence detection.
//!
//! Decouples the monitor from how a platform reports whether a thread is
//! running. The production probe reads Linux procfs; tests and other
//! platforms can supply their own.
//!
//! Sampling is a heuristic. A thread blocked inside a conductor-unaware call
//! (a mutex, a channel, socket I/O) looks exactly like one the scheduler has
//! not woken up yet, which is why the monitor debounces samples before
//! trusting them.

use std::{fs, io, path::Path};

/// Opaque OS-level identity of a unit's thread, as reported by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsThread(pub u64);

/// Scheduler state of a sampled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Running or waiting for a CPU
    Runnable,
    /// Sleeping, waiting on I/O or stopped
    Blocked,
    /// Thread no longer exists
    Exited,
    /// Probe cannot tell; treated as runnable
    Unknown,
}

/// Source of thread run states.
///
/// # Invariants
///
/// - [`RunStateProbe::identify`] is called on the thread being identified,
///   before that thread runs its unit body
/// - [`RunStateProbe::sample`] never blocks for long; it runs once per unit
///   per poll period on the monitor thread
/// - A probe that cannot answer returns [`RunState::Unknown`], never
///   [`RunState::Blocked`]
pub trait RunStateProbe: Send + Sync + 'static {
    /// Identify the calling thread. `None` if the platform has no handle for
    /// it; such units are always sampled as [`RunState::Unknown`].
    fn identify(&self) -> Option<OsThread>;

    /// Sample the run state of a previously identified thread.
    fn sample(&self, thread: OsThread) -> RunState;
}

/// Linux procfs probe.
///
/// Identifies threads through the `/proc/thread-self` link and samples the
/// state letter in `/proc/self/task/<tid>/stat`. `R` is runnable, a missing
/// task directory or `Z`/`X` is exited, every other letter is blocked.
/// Without procfs every thread is [`RunState::Unknown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProbe;

impl ProcfsProbe {
    /// Create a procfs probe.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RunStateProbe for ProcfsProbe {
    fn identify(&self) -> Option<OsThread> {
        let link = fs::read_link("/proc/thread-self").ok()?;
        parse_thread_self(&link)
    }

    fn sample(&self, thread: OsThread) -> RunState {
        match fs::read_to_string(format!("/proc/self/task/{}/stat", thread.0)) {
            Ok(stat) => parse_stat_state(&stat),
            Err(e) if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(ESRCH) => {
                RunState::Exited
            },
            Err(_) => RunState::Unknown,
        }
    }
}

/// Reading a task that exited mid-read fails with "no such process".
const ESRCH: i32 = 3;

/// `/proc/thread-self` points at `<pid>/task/<tid>`.
fn parse_thread_self(link: &Path) -> Option<OsThread> {
    link.file_name()?.to_str()?.parse().ok().map(OsThread)
}

/// The state letter follows the parenthesised command name, which may itself
/// contain spaces and parentheses, so scan from the last `)`.
fn parse_stat_state(stat: &str) -> RunState {
    let Some(close) = stat.rfind(')') else {
        return RunState::Unknown;
    };
    match stat[close + 1..].trim_start().chars().next() {
        Some('R') => RunState::Runnable,
        Some('Z' | 'X' | 'x') => RunState::Exited,
        Some(_) => RunState::Blocked,
        None => RunState::Unknown,
    }
}
