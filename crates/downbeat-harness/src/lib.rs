//! Test harness for conducted concurrency tests.
//!
//! Adapters and doubles for writing scenarios against
//! [`downbeat_core::Conductor`]:
//!
//! - [`fixture`]: one fresh conductor per test, conducted automatically if
//!   the test body did not do it itself
//! - [`buffer`]: a blocking bounded buffer, the classic subject of
//!   producer/consumer scenarios
//! - [`trace`]: a beat-stamped event log for asserting interleavings
//!
//! # Usage
//!
//! ```no_run
//! use downbeat_harness::{BeatTrace, conducted};
//!
//! conducted(|c| {
//!     let trace = BeatTrace::new();
//!     let t = trace.clone();
//!     c.thread("first", move |c| t.record(c, "first", "start"))?;
//!     let t = trace.clone();
//!     c.thread("second", move |c| {
//!         c.wait_for_beat(1);
//!         t.record(c, "second", "start");
//!     })?;
//!     Ok(())
//! })?;
//! # Ok::<(), downbeat_core::ConductorError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod fixture;
pub mod trace;

pub use buffer::BoundedBuffer;
pub use fixture::{ConductorFixture, conducted};
pub use trace::{BeatTrace, TraceEntry};
