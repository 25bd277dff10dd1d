//! Beat-stamped event trace.
//!
//! Units record what they did and the trace stamps each entry with the
//! beat at the time of recording. Tests then assert on the interleaving,
//! either directly or through a JSON snapshot of [`BeatTrace::entries`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use downbeat_core::{Beat, Conductor};
use serde::Serialize;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    /// Beat at recording time
    pub beat: Beat,
    /// Unit that recorded the event
    pub unit: String,
    /// What happened
    pub event: String,
}

/// Shared, append-only event log.
///
/// Cheap to clone; clones append to the same log. Entries keep recording
/// order, which within one beat is whatever order the units ran in.
#[derive(Debug, Clone, Default)]
pub struct BeatTrace {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl BeatTrace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` for `unit` at the conductor's current beat.
    pub fn record(&self, conductor: &Conductor, unit: &str, event: impl Into<String>) {
        self.record_at(conductor.beat(), unit, event);
    }

    /// Record `event` for `unit` at an explicit beat.
    pub fn record_at(&self, beat: Beat, unit: &str, event: impl Into<String>) {
        let entry = TraceEntry { beat, unit: unit.to_string(), event: event.into() };
        tracing::trace!(beat, unit, event = %entry.event, "trace entry");
        self.lock().push(entry);
    }

    /// All entries in recording order.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.lock().clone()
    }

    /// Events grouped by beat, each group in recording order.
    pub fn by_beat(&self) -> BTreeMap<Beat, Vec<(String, String)>> {
        let mut grouped: BTreeMap<Beat, Vec<(String, String)>> = BTreeMap::new();
        for entry in self.lock().iter() {
            grouped.entry(entry.beat).or_default().push((entry.unit.clone(), entry.event.clone()));
        }
        grouped
    }

    /// Events recorded by `unit`, in order.
    pub fn events_of(&self, unit: &str) -> Vec<String> {
        self.lock().iter().filter(|e| e.unit == unit).map(|e| e.event.clone()).collect()
    }

    /// Beat at which `unit` first recorded `event`.
    pub fn beat_of(&self, unit: &str, event: &str) -> Option<Beat> {
        self.lock().iter().find(|e| e.unit == unit && e.event == event).map(|e| e.beat)
    }

    /// True if the beats are non-decreasing in recording order.
    ///
    /// Entries recorded with [`BeatTrace::record`] always satisfy this; a
    /// violation means an entry was stamped with a stale beat.
    pub fn is_beat_ordered(&self) -> bool {
        self.lock().windows(2).all(|pair| pair[0].beat <= pair[1].beat)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TraceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;

    use super::*;

    #[test]
    fn groups_by_beat_in_recording_order() {
        let trace = BeatTrace::new();
        trace.record_at(0, "producer", "put 42");
        trace.record_at(1, "consumer", "take 42");
        trace.record_at(1, "producer", "put 17");

        let grouped = trace.by_beat();
        assert_eq!(grouped[&0], [("producer".to_string(), "put 42".to_string())]);
        assert_eq!(grouped[&1].len(), 2);
        assert_eq!(trace.events_of("producer"), ["put 42", "put 17"]);
        assert_eq!(trace.beat_of("consumer", "take 42"), Some(1));
        assert_eq!(trace.beat_of("consumer", "take 17"), None);
        assert!(trace.is_beat_ordered());
    }

    #[test]
    fn stale_stamp_breaks_ordering() {
        let trace = BeatTrace::new();
        trace.record_at(2, "a", "late");
        trace.record_at(1, "b", "stale");
        assert!(!trace.is_beat_ordered());
    }

    #[test]
    fn clones_share_the_log() {
        let trace = BeatTrace::new();
        let clone = trace.clone();
        clone.record_at(0, "a", "x");
        assert_eq!(trace.len(), 1);
        assert!(!trace.is_empty());
    }

    #[test]
    fn entries_serialize() {
        let trace = BeatTrace::new();
        trace.record_at(0, "first", "start");
        trace.record_at(1, "second", "start");

        assert_json_snapshot!(trace.entries(), @r#"
        [
          {
            "beat": 0,
            "unit": "first",
            "event": "start"
          },
          {
            "beat": 1,
            "unit": "second",
            "event": "start"
          }
        ]
        "#);
    }
}
