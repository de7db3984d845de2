//! Event, batch, and causal-clock value types shared by every layer.
//!
//! These are pure data: the event log, the index, and the storage backends
//! all depend on this module, and no I/O occurs here.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A causal clock: one counter per process (location) id.
///
/// Two clocks are comparable when one dominates the other pointwise;
/// otherwise the events they stamp are concurrent. Missing entries count
/// as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorTime {
    entries: HashMap<String, u64>,
}

impl VectorTime {
    /// Create an empty clock (zero at every process).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `process_id`, zero if absent.
    pub fn value_of(&self, process_id: &str) -> u64 {
        self.entries.get(process_id).copied().unwrap_or(0)
    }

    /// Set the counter for `process_id`.
    pub fn set(&mut self, process_id: impl Into<String>, value: u64) {
        self.entries.insert(process_id.into(), value);
    }

    /// Advance the counter for `process_id` by one and return the new value.
    pub fn increment(&mut self, process_id: &str) -> u64 {
        let value = self
            .entries
            .entry(process_id.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        *value
    }

    /// Pointwise maximum of two clocks.
    pub fn merge(&self, other: &VectorTime) -> VectorTime {
        let mut entries = self.entries.clone();
        for (process_id, value) in &other.entries {
            let slot = entries.entry(process_id.clone()).or_insert(0);
            *slot = (*slot).max(*value);
        }
        VectorTime { entries }
    }

    /// `true` if every counter in `self` is less than or equal to the
    /// corresponding counter in `other`.
    pub fn leq(&self, other: &VectorTime) -> bool {
        self.entries
            .iter()
            .all(|(process_id, value)| *value <= other.value_of(process_id))
    }

    /// `true` if neither clock dominates the other.
    pub fn concurrent(&self, other: &VectorTime) -> bool {
        !self.leq(other) && !other.leq(self)
    }
}

/// An immutable, causally-stamped unit of the log.
///
/// Provenance fields (`source_log_id`, `target_log_id` and their sequence
/// numbers) are rewritten on every hop: each time the event is persisted
/// into a log, whether originated locally or received via replication,
/// they record which log the event came from and which log it was just
/// written into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEvent {
    /// Opaque application data.
    pub payload: Value,
    /// Identity of the actor that created the event.
    pub emitter_id: String,
    /// Aggregate the event belongs to, if any.
    pub emitter_aggregate_id: Option<String>,
    /// Aggregate ids this event should additionally be routed to.
    pub custom_destination_aggregate_ids: HashSet<String>,
    /// Causal position of the event across all locations.
    pub vector_timestamp: VectorTime,
    /// Wall-clock hint in Unix epoch milliseconds. Not used for ordering.
    pub system_timestamp: u64,
    /// Id of the process (location) that created the event.
    pub process_id: String,
    /// Id of some log the event was written to, updated on every hop.
    pub local_log_id: String,
    /// Sequence number assigned by `local_log_id`.
    pub local_sequence_nr: u64,
    /// Log the event came from on its most recent hop.
    pub source_log_id: String,
    /// Log the event was most recently written into.
    pub target_log_id: String,
    /// Sequence number the event had in `source_log_id`.
    pub source_log_sequence_nr: u64,
    /// Sequence number assigned by `target_log_id`.
    pub target_log_sequence_nr: u64,
    /// Causal dependency marker for "persist on event" semantics, carried
    /// through unchanged.
    pub persist_on_event_sequence_nr: Option<u64>,
}

impl DurableEvent {
    /// Create an event with the given payload and emitter, all routing and
    /// provenance fields empty.
    ///
    /// The system timestamp is stamped from the wall clock; it is a hint
    /// only and carries no ordering guarantee.
    pub fn new(payload: Value, emitter_id: impl Into<String>) -> Self {
        let system_timestamp = SystemTime::UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            payload,
            emitter_id: emitter_id.into(),
            emitter_aggregate_id: None,
            custom_destination_aggregate_ids: HashSet::new(),
            vector_timestamp: VectorTime::new(),
            system_timestamp,
            process_id: String::new(),
            local_log_id: String::new(),
            local_sequence_nr: 0,
            source_log_id: String::new(),
            target_log_id: String::new(),
            source_log_sequence_nr: 0,
            target_log_sequence_nr: 0,
            persist_on_event_sequence_nr: None,
        }
    }

    /// Set the emitter's aggregate id.
    pub fn with_emitter_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.emitter_aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Add a custom routing destination.
    pub fn with_destination(mut self, aggregate_id: impl Into<String>) -> Self {
        self.custom_destination_aggregate_ids
            .insert(aggregate_id.into());
        self
    }

    /// Set the id of the creating process (location).
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    /// Set the causal clock.
    pub fn with_vector_timestamp(mut self, vector_timestamp: VectorTime) -> Self {
        self.vector_timestamp = vector_timestamp;
        self
    }

    /// The set of aggregates this event is of interest to: the custom
    /// destinations plus the emitter's aggregate, when present.
    pub fn routing_destinations(&self) -> HashSet<String> {
        let mut destinations = self.custom_destination_aggregate_ids.clone();
        if let Some(aggregate_id) = &self.emitter_aggregate_id {
            destinations.insert(aggregate_id.clone());
        }
        destinations
    }

    /// Stamp the event for a local write: it has no external provenance,
    /// so local, source, and target all point at this log and the newly
    /// assigned sequence number.
    pub(crate) fn stamped_local(mut self, log_id: &str, sequence_nr: u64) -> Self {
        self.local_log_id = log_id.to_string();
        self.local_sequence_nr = sequence_nr;
        self.source_log_id = log_id.to_string();
        self.source_log_sequence_nr = sequence_nr;
        self.target_log_id = log_id.to_string();
        self.target_log_sequence_nr = sequence_nr;
        self
    }

    /// Stamp the event for a replication write: the previous target pair
    /// becomes the source pair, and the target pair records this hop.
    pub(crate) fn stamped_replicated(mut self, log_id: &str, sequence_nr: u64) -> Self {
        self.source_log_id = std::mem::take(&mut self.target_log_id);
        self.source_log_sequence_nr = self.target_log_sequence_nr;
        self.local_log_id = log_id.to_string();
        self.local_sequence_nr = sequence_nr;
        self.target_log_id = log_id.to_string();
        self.target_log_sequence_nr = sequence_nr;
        self
    }
}

/// Replication progress: the highest sequence number read from a source
/// log by the read that produced a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProgress {
    /// The log the events were read from.
    pub source_log_id: String,
    /// Highest sequence number scanned in that log by the triggering read.
    pub last_read_sequence_nr: u64,
}

/// An ordered, non-empty sequence of events forming one physical write.
///
/// Batches produced by replication carry [`ReplicationProgress`] so the
/// store can record how far the source log has been read, atomically with
/// the events themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEventBatch {
    /// The events, in submission order.
    pub events: Vec<DurableEvent>,
    /// Replication provenance, absent for local writes.
    pub replication: Option<ReplicationProgress>,
}

impl DurableEventBatch {
    /// Batch originating from local writes.
    pub fn local(events: Vec<DurableEvent>) -> Self {
        debug_assert!(!events.is_empty(), "event batch must be non-empty");
        Self {
            events,
            replication: None,
        }
    }

    /// Batch originating from a replication read against `progress.source_log_id`.
    pub fn replicated(events: Vec<DurableEvent>, progress: ReplicationProgress) -> Self {
        debug_assert!(!events.is_empty(), "event batch must be non-empty");
        Self {
            events,
            replication: Some(progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routing_destinations_union_custom_and_emitter_aggregate() {
        let event = DurableEvent::new(json!({"n": 1}), "emitter-1")
            .with_emitter_aggregate_id("agg-1")
            .with_destination("agg-2")
            .with_destination("agg-3");

        let destinations = event.routing_destinations();
        assert_eq!(destinations.len(), 3);
        assert!(destinations.contains("agg-1"));
        assert!(destinations.contains("agg-2"));
        assert!(destinations.contains("agg-3"));
    }

    #[test]
    fn routing_destinations_empty_without_aggregate_or_custom() {
        let event = DurableEvent::new(json!(null), "emitter-1");
        assert!(event.routing_destinations().is_empty());
    }

    #[test]
    fn stamped_local_points_all_provenance_at_this_log() {
        let event = DurableEvent::new(json!("x"), "emitter-1").stamped_local("log-a", 7);

        assert_eq!(event.local_log_id, "log-a");
        assert_eq!(event.local_sequence_nr, 7);
        assert_eq!(event.source_log_id, "log-a");
        assert_eq!(event.source_log_sequence_nr, 7);
        assert_eq!(event.target_log_id, "log-a");
        assert_eq!(event.target_log_sequence_nr, 7);
    }

    #[test]
    fn stamped_replicated_shifts_target_pair_to_source_pair() {
        let event = DurableEvent::new(json!("x"), "emitter-1")
            .stamped_local("log-a", 3)
            .stamped_replicated("log-b", 9);

        assert_eq!(event.source_log_id, "log-a");
        assert_eq!(event.source_log_sequence_nr, 3);
        assert_eq!(event.target_log_id, "log-b");
        assert_eq!(event.target_log_sequence_nr, 9);
        assert_eq!(event.local_log_id, "log-b");
        assert_eq!(event.local_sequence_nr, 9);
    }

    #[test]
    fn persist_on_event_marker_survives_stamping() {
        let mut event = DurableEvent::new(json!("x"), "emitter-1");
        event.persist_on_event_sequence_nr = Some(42);

        let stamped = event.stamped_local("log-a", 1).stamped_replicated("log-b", 1);
        assert_eq!(stamped.persist_on_event_sequence_nr, Some(42));
    }

    #[test]
    fn vector_time_merge_takes_pointwise_max() {
        let mut a = VectorTime::new();
        a.set("p1", 3);
        a.set("p2", 1);

        let mut b = VectorTime::new();
        b.set("p2", 5);
        b.set("p3", 2);

        let merged = a.merge(&b);
        assert_eq!(merged.value_of("p1"), 3);
        assert_eq!(merged.value_of("p2"), 5);
        assert_eq!(merged.value_of("p3"), 2);
        assert_eq!(merged.value_of("p4"), 0, "absent entries count as zero");
    }

    #[test]
    fn vector_time_increment_starts_at_one() {
        let mut clock = VectorTime::new();
        assert_eq!(clock.increment("p1"), 1);
        assert_eq!(clock.increment("p1"), 2);
        assert_eq!(clock.value_of("p1"), 2);
    }

    #[test]
    fn vector_time_partial_order() {
        let mut earlier = VectorTime::new();
        earlier.set("p1", 1);

        let mut later = VectorTime::new();
        later.set("p1", 2);
        later.set("p2", 1);

        assert!(earlier.leq(&later));
        assert!(!later.leq(&earlier));
        assert!(!earlier.concurrent(&later));

        let mut sibling = VectorTime::new();
        sibling.set("p3", 1);
        assert!(later.concurrent(&sibling));
    }

    #[test]
    fn durable_event_serde_roundtrip() {
        let mut clock = VectorTime::new();
        clock.set("p1", 4);
        let event = DurableEvent::new(json!({"amount": 10}), "emitter-1")
            .with_emitter_aggregate_id("agg-1")
            .with_process_id("p1")
            .with_vector_timestamp(clock)
            .stamped_local("log-a", 12);

        let json = serde_json::to_string(&event).expect("serialize should succeed");
        let back: DurableEvent = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, event);
    }

    #[test]
    fn replicated_batch_carries_progress() {
        let event = DurableEvent::new(json!("x"), "emitter-1").stamped_local("log-a", 1);
        let batch = DurableEventBatch::replicated(
            vec![event],
            ReplicationProgress {
                source_log_id: "log-a".to_string(),
                last_read_sequence_nr: 17,
            },
        );

        let progress = batch.replication.expect("progress should be present");
        assert_eq!(progress.source_log_id, "log-a");
        assert_eq!(progress.last_read_sequence_nr, 17);
    }
}
