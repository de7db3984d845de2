//! In-process replication driver: pull events from a source log, push
//! them into a target log, resuming from the target's stored read
//! position.
//!
//! The driver speaks only the log protocol (`ReplicationRead`,
//! `ReplicationWrite`, read-position queries); carrying those messages
//! between processes is a transport concern outside this crate.

use crate::error::LogError;
use crate::log::EventLogHandle;
use crate::protocol::{ReplicationFilter, accept_all};

const DEFAULT_BATCH_SIZE: usize = 64;

/// Run one pull-push round from `source` into `target`.
///
/// Asks the target how far it has read from the source, pulls up to
/// `batch_size` events matching `filter` from there, and pushes them into
/// the target together with the new watermark. When the scan advanced past
/// events the filter rejected, the watermark is still recorded at the
/// target through a progress-only write, so the next round resumes past
/// them.
///
/// Returns the number of events replicated; zero means the target is
/// caught up with the source.
pub async fn replicate_once(
    source: &EventLogHandle,
    target: &EventLogHandle,
    batch_size: usize,
    filter: &ReplicationFilter,
) -> Result<usize, LogError> {
    let position = target.read_position(source.id()).await?;
    let read = source
        .replication_read(position + 1, batch_size, filter.clone(), target.id())
        .await?;

    if read.events.is_empty() {
        if read.watermark > position {
            target
                .replication_write(Vec::new(), source.id(), read.watermark)
                .await?;
        }
        return Ok(0);
    }

    let num = read.events.len();
    target
        .replication_write(read.events, source.id(), read.watermark)
        .await?;
    tracing::debug!(
        source_log_id = %source.id(),
        target_log_id = %target.id(),
        num_events = num,
        watermark = read.watermark,
        "replication round complete"
    );
    Ok(num)
}

/// A configured source-to-target replication connection.
pub struct Replicator {
    source: EventLogHandle,
    target: EventLogHandle,
    batch_size: usize,
    filter: ReplicationFilter,
}

impl Replicator {
    /// Connect `source` to `target` with the default batch size and an
    /// accept-all filter.
    pub fn new(source: EventLogHandle, target: EventLogHandle) -> Self {
        Self {
            source,
            target,
            batch_size: DEFAULT_BATCH_SIZE,
            filter: accept_all(),
        }
    }

    /// Set the maximum number of events pulled per round.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the read filter, e.g. [`exclude_process`](crate::exclude_process)
    /// to keep a location's own events from echoing back to it.
    pub fn with_filter(mut self, filter: ReplicationFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Repeat pull-push rounds until a round transfers nothing, returning
    /// the total number of events replicated.
    pub async fn run_until_idle(&self) -> Result<usize, LogError> {
        let mut total = 0;
        loop {
            let num =
                replicate_once(&self.source, &self.target, self.batch_size, &self.filter).await?;
            if num == 0 {
                return Ok(total);
            }
            total += num;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::config::LogConfig;
    use crate::event::DurableEvent;
    use crate::log::EventLog;
    use crate::protocol::{EventSubscriber, Notification, exclude_process};
    use crate::storage::MemoryStore;

    fn event(n: u64, process_id: &str) -> DurableEvent {
        DurableEvent::new(json!({"n": n}), format!("emitter-{process_id}"))
            .with_process_id(process_id)
    }

    fn subscriber() -> (EventSubscriber, UnboundedReceiver<Notification>) {
        mpsc::unbounded_channel()
    }

    async fn next(rx: &mut UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    fn spawn(id: &str) -> EventLogHandle {
        EventLog::spawn(id, Arc::new(MemoryStore::new()), LogConfig::default())
    }

    async fn write_events(log: &EventLogHandle, events: Vec<DurableEvent>) {
        let (tx, mut rx) = subscriber();
        let num = events.len();
        log.write(events, tx, 1).await.expect("write should be accepted");
        for _ in 0..num {
            match next(&mut rx).await {
                Notification::WriteSuccess { .. } => {}
                other => panic!("expected WriteSuccess, got {other:?}"),
            }
        }
    }

    async fn replay_all(log: &EventLogHandle) -> Vec<DurableEvent> {
        let (tx, mut rx) = subscriber();
        log.replay(0, tx, None, 1).await.expect("replay");
        let mut events = Vec::new();
        loop {
            match next(&mut rx).await {
                Notification::Replaying { event, .. } => events.push(event),
                Notification::ReplaySuccess { .. } => return events,
                other => panic!("unexpected notification: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn replicates_events_and_is_idle_when_caught_up() {
        let a = spawn("log-a");
        let b = spawn("log-b");
        write_events(&a, (1..=3).map(|n| event(n, "proc-a")).collect()).await;

        let replicator = Replicator::new(a.clone(), b.clone()).with_batch_size(2);
        assert_eq!(replicator.run_until_idle().await.expect("replication"), 3);
        assert_eq!(replicator.run_until_idle().await.expect("replication"), 0);

        let replicated = replay_all(&b).await;
        assert_eq!(replicated.len(), 3);
        for (i, event) in replicated.iter().enumerate() {
            assert_eq!(event.source_log_id, "log-a");
            assert_eq!(event.source_log_sequence_nr, i as u64 + 1);
            assert_eq!(event.target_log_id, "log-b");
            assert_eq!(event.target_log_sequence_nr, i as u64 + 1);
        }
        assert_eq!(b.read_position("log-a").await.expect("position"), 3);
    }

    #[tokio::test]
    async fn filtered_out_events_still_advance_the_read_position() {
        let a = spawn("log-a");
        let b = spawn("log-b");
        write_events(&a, (1..=4).map(|n| event(n, "proc-b")).collect()).await;

        let num = replicate_once(&a, &b, 10, &exclude_process("proc-b"))
            .await
            .expect("replication");
        assert_eq!(num, 0, "every event is filtered out");
        assert_eq!(
            b.read_position("log-a").await.expect("position"),
            4,
            "progress-only write must record the watermark"
        );
        assert!(replay_all(&b).await.is_empty());
    }

    #[tokio::test]
    async fn bidirectional_replication_does_not_echo_events_back() {
        let a = spawn("log-a");
        let b = spawn("log-b");
        write_events(&a, vec![event(1, "proc-a")]).await;
        write_events(&b, vec![event(2, "proc-b")]).await;

        let a_to_b = Replicator::new(a.clone(), b.clone()).with_filter(exclude_process("proc-b"));
        let b_to_a = Replicator::new(b.clone(), a.clone()).with_filter(exclude_process("proc-a"));

        for _ in 0..3 {
            a_to_b.run_until_idle().await.expect("replication");
            b_to_a.run_until_idle().await.expect("replication");
        }

        let in_a = replay_all(&a).await;
        let in_b = replay_all(&b).await;
        assert_eq!(in_a.len(), 2, "log-a holds its own event plus log-b's");
        assert_eq!(in_b.len(), 2, "log-b holds its own event plus log-a's");
    }
}
