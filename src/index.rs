//! Secondary index: aggregate-scoped event lookup and replication
//! read-position bookkeeping.
//!
//! The index is an independently scheduled task collaborating with the
//! event log over messages only. It maintains, in memory, a per-aggregate
//! list of events that carry routing destinations, built by incremental
//! scans of the store, plus a cache of replication read positions. The
//! aggregate lists are re-derived from the store after a restart; read
//! positions are durable in the store itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{LogError, StoreError};
use crate::event::DurableEvent;
use crate::protocol::{EventSubscriber, Notification, ReplicationWriteSuccess};
use crate::storage::EventStore;

/// Messages consumed by the index task.
pub(crate) enum IndexCommand {
    /// Catch up on events written since the last scan.
    Update,

    /// Aggregate-scoped replay, forwarded verbatim by the event log.
    Replay {
        from_sequence_nr: u64,
        requestor: EventSubscriber,
        aggregate_id: String,
        instance_id: u64,
    },

    /// How far has this log read from `source_log_id`?
    ReadPosition {
        source_log_id: String,
        reply: oneshot::Sender<u64>,
    },

    /// Progress-only replication write: record the position durably and
    /// acknowledge to the remote writer.
    Progress {
        source_log_id: String,
        last_read_sequence_nr: u64,
        reply: oneshot::Sender<Result<ReplicationWriteSuccess, LogError>>,
    },

    /// A position already persisted with an event batch; refresh the cache
    /// so queries see it before the next scan.
    ProgressWritten {
        source_log_id: String,
        last_read_sequence_nr: u64,
    },
}

/// Cheaply cloneable sender side of the index task.
#[derive(Clone)]
pub(crate) struct IndexHandle {
    tx: mpsc::UnboundedSender<IndexCommand>,
}

impl IndexHandle {
    pub fn update(&self) {
        let _ = self.tx.send(IndexCommand::Update);
    }

    pub fn replay(
        &self,
        from_sequence_nr: u64,
        requestor: EventSubscriber,
        aggregate_id: String,
        instance_id: u64,
    ) {
        let _ = self.tx.send(IndexCommand::Replay {
            from_sequence_nr,
            requestor,
            aggregate_id,
            instance_id,
        });
    }

    pub fn read_position(&self, source_log_id: String, reply: oneshot::Sender<u64>) {
        let _ = self.tx.send(IndexCommand::ReadPosition {
            source_log_id,
            reply,
        });
    }

    pub fn progress(
        &self,
        source_log_id: String,
        last_read_sequence_nr: u64,
        reply: oneshot::Sender<Result<ReplicationWriteSuccess, LogError>>,
    ) {
        let _ = self.tx.send(IndexCommand::Progress {
            source_log_id,
            last_read_sequence_nr,
            reply,
        });
    }

    pub fn progress_written(&self, source_log_id: String, last_read_sequence_nr: u64) {
        let _ = self.tx.send(IndexCommand::ProgressWritten {
            source_log_id,
            last_read_sequence_nr,
        });
    }
}

struct LogIndex {
    log_id: String,
    store: Arc<dyn EventStore>,
    chunk: usize,
    last_indexed_sequence_nr: u64,
    aggregates: HashMap<String, Vec<DurableEvent>>,
    progress: HashMap<String, u64>,
}

/// Start the index task for `log_id` over `store`.
pub(crate) fn spawn_index(
    log_id: String,
    store: Arc<dyn EventStore>,
    chunk: usize,
) -> IndexHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let progress = match store.replication_progresses() {
            Ok(progress) => progress,
            Err(e) => {
                tracing::warn!(log_id = %log_id, error = %e, "index: progress recovery failed");
                HashMap::new()
            }
        };
        let mut index = LogIndex {
            log_id,
            store,
            chunk,
            last_indexed_sequence_nr: 0,
            aggregates: HashMap::new(),
            progress,
        };
        while let Some(cmd) = rx.recv().await {
            index.handle(cmd);
        }
    });
    IndexHandle { tx }
}

impl LogIndex {
    fn handle(&mut self, cmd: IndexCommand) {
        match cmd {
            IndexCommand::Update => {
                if let Err(e) = self.update() {
                    tracing::error!(log_id = %self.log_id, error = %e, "index update failed");
                }
            }

            IndexCommand::Replay {
                from_sequence_nr,
                requestor,
                aggregate_id,
                instance_id,
            } => {
                // Catch up first so replay never misses events merely
                // because the refresh threshold hasn't been crossed yet.
                if let Err(e) = self.update() {
                    let _ = requestor.send(Notification::ReplayFailure {
                        cause: LogError::Store(e),
                        instance_id,
                    });
                    return;
                }
                let events = self.aggregates.get(&aggregate_id);
                for event in events.into_iter().flatten() {
                    if event.target_log_sequence_nr < from_sequence_nr {
                        continue;
                    }
                    let delivered = requestor.send(Notification::Replaying {
                        event: event.clone(),
                        instance_id,
                    });
                    if delivered.is_err() {
                        // Requestor gone mid-replay; no terminal message owed.
                        return;
                    }
                }
                let _ = requestor.send(Notification::ReplaySuccess { instance_id });
            }

            IndexCommand::ReadPosition {
                source_log_id,
                reply,
            } => {
                let position = self.progress.get(&source_log_id).copied().unwrap_or(0);
                let _ = reply.send(position);
            }

            IndexCommand::Progress {
                source_log_id,
                last_read_sequence_nr,
                reply,
            } => {
                let result = self
                    .store
                    .write_replication_progress(&source_log_id, last_read_sequence_nr);
                match result {
                    Ok(()) => {
                        self.progress.insert(source_log_id, last_read_sequence_nr);
                        let _ = reply.send(Ok(ReplicationWriteSuccess {
                            num: 0,
                            stored_replication_progress: last_read_sequence_nr,
                        }));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(LogError::Store(e)));
                    }
                }
            }

            IndexCommand::ProgressWritten {
                source_log_id,
                last_read_sequence_nr,
            } => {
                self.progress.insert(source_log_id, last_read_sequence_nr);
            }
        }
    }

    /// Incremental catch-up: scan the store from the last indexed sequence
    /// number and add every event carrying routing destinations. Redundant
    /// update requests degenerate to an empty scan, so queueing them is
    /// harmless in any order.
    fn update(&mut self) -> Result<(), StoreError> {
        loop {
            let batch = self
                .store
                .read(self.last_indexed_sequence_nr + 1, self.chunk)?;
            let exhausted = batch.len() < self.chunk;
            for event in batch {
                self.last_indexed_sequence_nr = event.target_log_sequence_nr;
                for destination in event.routing_destinations() {
                    self.aggregates
                        .entry(destination)
                        .or_default()
                        .push(event.clone());
                }
            }
            if exhausted {
                break;
            }
        }
        self.progress = self.store.replication_progresses()?;
        tracing::debug!(
            log_id = %self.log_id,
            last_indexed = self.last_indexed_sequence_nr,
            "index caught up"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DurableEventBatch;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn aggregate_event(n: u64, aggregate_id: &str) -> DurableEvent {
        DurableEvent::new(json!({"n": n}), "emitter-1")
            .with_emitter_aggregate_id(aggregate_id)
            .stamped_local("log-a", n)
    }

    async fn next(rx: &mut UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    fn store_with_events(events: Vec<DurableEvent>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .write(&DurableEventBatch::local(events))
            .expect("seed write should succeed");
        store
    }

    #[tokio::test]
    async fn replay_delivers_aggregate_events_in_log_order() {
        let store = store_with_events(vec![
            aggregate_event(1, "agg-1"),
            aggregate_event(2, "agg-2"),
            aggregate_event(3, "agg-1"),
        ]);
        let index = spawn_index("log-a".to_string(), store, 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        index.replay(0, tx, "agg-1".to_string(), 7);

        match next(&mut rx).await {
            Notification::Replaying { event, instance_id } => {
                assert_eq!(event.target_log_sequence_nr, 1);
                assert_eq!(instance_id, 7);
            }
            other => panic!("expected Replaying, got {other:?}"),
        }
        match next(&mut rx).await {
            Notification::Replaying { event, .. } => {
                assert_eq!(event.target_log_sequence_nr, 3);
            }
            other => panic!("expected Replaying, got {other:?}"),
        }
        assert!(matches!(
            next(&mut rx).await,
            Notification::ReplaySuccess { instance_id: 7 }
        ));
    }

    #[tokio::test]
    async fn replay_respects_starting_sequence_nr() {
        let store = store_with_events(vec![
            aggregate_event(1, "agg-1"),
            aggregate_event(2, "agg-1"),
            aggregate_event(3, "agg-1"),
        ]);
        let index = spawn_index("log-a".to_string(), store, 512);

        let (tx, mut rx) = mpsc::unbounded_channel();
        index.replay(3, tx, "agg-1".to_string(), 1);

        match next(&mut rx).await {
            Notification::Replaying { event, .. } => {
                assert_eq!(event.target_log_sequence_nr, 3);
            }
            other => panic!("expected Replaying, got {other:?}"),
        }
        assert!(matches!(
            next(&mut rx).await,
            Notification::ReplaySuccess { .. }
        ));
    }

    #[tokio::test]
    async fn replay_unknown_aggregate_terminates_immediately() {
        let store = store_with_events(vec![aggregate_event(1, "agg-1")]);
        let index = spawn_index("log-a".to_string(), store, 512);

        let (tx, mut rx) = mpsc::unbounded_channel();
        index.replay(0, tx, "agg-9".to_string(), 2);

        assert!(matches!(
            next(&mut rx).await,
            Notification::ReplaySuccess { instance_id: 2 }
        ));
    }

    #[tokio::test]
    async fn read_position_reflects_progress_messages() {
        let store = Arc::new(MemoryStore::new());
        let index = spawn_index("log-a".to_string(), store.clone(), 512);

        let (reply_tx, reply_rx) = oneshot::channel();
        index.read_position("log-b".to_string(), reply_tx);
        assert_eq!(reply_rx.await.expect("reply"), 0, "unknown source reads 0");

        let (progress_tx, progress_rx) = oneshot::channel();
        index.progress("log-b".to_string(), 23, progress_tx);
        let ack = progress_rx
            .await
            .expect("reply")
            .expect("progress write should succeed");
        assert_eq!(ack.num, 0);
        assert_eq!(ack.stored_replication_progress, 23);

        let (reply_tx, reply_rx) = oneshot::channel();
        index.read_position("log-b".to_string(), reply_tx);
        assert_eq!(reply_rx.await.expect("reply"), 23);

        // Written through to the store, not only cached.
        assert_eq!(store.replication_progress("log-b").expect("progress"), 23);
    }

    #[tokio::test]
    async fn progress_written_refreshes_cache_without_store_write() {
        let store = Arc::new(MemoryStore::new());
        let index = spawn_index("log-a".to_string(), store.clone(), 512);

        index.progress_written("log-b".to_string(), 11);

        let (reply_tx, reply_rx) = oneshot::channel();
        index.read_position("log-b".to_string(), reply_tx);
        assert_eq!(reply_rx.await.expect("reply"), 11);
    }

    #[tokio::test]
    async fn replay_to_dropped_requestor_does_not_wedge_index() {
        let store = store_with_events(vec![aggregate_event(1, "agg-1")]);
        let index = spawn_index("log-a".to_string(), store, 512);

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        index.replay(0, tx, "agg-1".to_string(), 3);

        let (reply_tx, reply_rx) = oneshot::channel();
        index.read_position("log-x".to_string(), reply_tx);
        assert_eq!(reply_rx.await.expect("reply"), 0, "index task still alive");
    }
}
