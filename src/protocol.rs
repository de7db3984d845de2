//! Message vocabulary spoken between the event log, its subscribers, the
//! batching layer, and replication peers.
//!
//! Requestors and registered subscribers receive [`Notification`]s through
//! an unbounded channel they own; request/response operations reply through
//! `oneshot` channels carried inside the request. Cross-cutting observers
//! listen to [`BusEvent`]s on the fire-and-forget notification stream.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::LogError;
use crate::event::DurableEvent;

/// Receiving side of a subscriber or requestor: any party interested in
/// replay, write results, or written-event notifications hands the log a
/// clone of its sender.
///
/// Channel identity doubles as subscriber identity: the log excludes a
/// write's requestor from its own `Written` fan-out by comparing channels,
/// and detects subscriber termination by watching for channel closure.
pub type EventSubscriber = mpsc::UnboundedSender<Notification>;

/// Messages delivered to requestors and registered subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    /// One replayed event, delivered in log order.
    Replaying {
        /// The replayed event.
        event: DurableEvent,
        /// Correlation id echoed from the `Replay` request.
        instance_id: u64,
    },

    /// Terminal: the replay scan completed.
    ReplaySuccess {
        /// Correlation id echoed from the `Replay` request.
        instance_id: u64,
    },

    /// Terminal: the replay scan failed. The caller is responsible for
    /// retrying; no partial delivery is rolled back.
    ReplayFailure {
        /// Why the scan failed.
        cause: LogError,
        /// Correlation id echoed from the `Replay` request.
        instance_id: u64,
    },

    /// One event of a write request was durably persisted.
    WriteSuccess {
        /// The event, with sequence number and provenance stamped.
        event: DurableEvent,
        /// Correlation id echoed from the write request.
        instance_id: u64,
    },

    /// One event of a write request could not be persisted. The sequence
    /// numbers consumed by the attempt are not reused.
    WriteFailure {
        /// The event as submitted for the failed attempt.
        event: DurableEvent,
        /// Why the physical write failed.
        cause: LogError,
        /// Correlation id echoed from the write request.
        instance_id: u64,
    },

    /// An event was written to the log, delivered to default subscribers
    /// and to aggregate subscribers named in the event's routing
    /// destinations.
    Written {
        /// The newly written event.
        event: DurableEvent,
    },
}

/// One local write request: events plus the channel that receives the
/// per-event results.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Events to persist, in order.
    pub events: Vec<DurableEvent>,
    /// Receives `WriteSuccess` / `WriteFailure` per event.
    pub requestor: EventSubscriber,
    /// Correlation id echoed in every reply.
    pub instance_id: u64,
}

/// Predicate applied to events during a replication read, e.g. to exclude
/// events already known to have reached the reading location.
pub type ReplicationFilter = Arc<dyn Fn(&DurableEvent) -> bool + Send + Sync>;

/// Filter that accepts every event.
pub fn accept_all() -> ReplicationFilter {
    Arc::new(|_| true)
}

/// Filter that rejects events created by the given process, preventing a
/// location's own events from being replicated back to it.
pub fn exclude_process(process_id: impl Into<String>) -> ReplicationFilter {
    let process_id = process_id.into();
    Arc::new(move |event| event.process_id != process_id)
}

/// Successful reply to a replication read.
#[derive(Debug, Clone)]
pub struct ReplicationReadSuccess {
    /// Matching events in non-decreasing target sequence number order.
    pub events: Vec<DurableEvent>,
    /// Highest sequence number actually scanned, matching or not; the
    /// caller resumes from `watermark + 1` on its next read.
    pub watermark: u64,
    /// The log the caller replicates into, echoed from the request.
    pub target_log_id: String,
}

/// Successful reply to a replication write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationWriteSuccess {
    /// Number of events persisted by this write.
    pub num: usize,
    /// The source-log read progress recorded with the write.
    pub stored_replication_progress: u64,
}

/// Process-wide, fire-and-forget notifications published on the log's
/// broadcast stream for metrics and cross-cutting listeners.
///
/// Publishing never blocks; subscribers that lag behind the stream's
/// buffer miss messages.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Events were durably written to this log (locally or via replication).
    Updated {
        /// The events of the physical write, in order.
        events: Vec<DurableEvent>,
    },

    /// A replication read request was accepted and is about to execute.
    ReplicationReadRequested {
        /// First sequence number the scan covers.
        from_sequence_nr: u64,
        /// Maximum number of matching events requested.
        max: usize,
        /// The log the caller replicates into.
        target_log_id: String,
    },

    /// A replication read completed.
    ReplicationReadSucceeded {
        /// The matching events returned to the caller.
        events: Vec<DurableEvent>,
        /// Highest sequence number scanned.
        watermark: u64,
        /// The log the caller replicates into.
        target_log_id: String,
    },

    /// A replication read failed.
    ReplicationReadFailed {
        /// Display form of the failure cause.
        message: String,
        /// The log the caller replicates into.
        target_log_id: String,
    },
}
