//! The event-log actor: single logical owner of one log's write path.
//!
//! Each log instance runs as one task that exclusively owns the sequence
//! counter, the subscriber registry, and the pending-index-update count,
//! processing one message to completion before the next. Physical writes
//! happen inside the message turn (the counter must reflect them before
//! the next message is handled); replay and replication-read scans run on
//! background tasks and never block the mailbox.
//!
//! Public API: [`EventLogHandle`] (cloneable async handle) and
//! [`EventLog::spawn`] (factory that starts the task and recovers the
//! sequence counter from the store).

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::config::LogConfig;
use crate::error::{LogError, StoreError};
use crate::event::{DurableEvent, DurableEventBatch, ReplicationProgress};
use crate::index::{IndexHandle, spawn_index};
use crate::protocol::{
    BusEvent, EventSubscriber, Notification, ReplicationFilter, ReplicationReadSuccess,
    ReplicationWriteSuccess, WriteRequest,
};
use crate::registry::{SubscriberId, SubscriberRegistry};
use crate::storage::EventStore;

/// Messages sent from [`EventLogHandle`] (and from the log's own
/// background tasks) to the log task.
pub(crate) enum LogCommand {
    /// Set the recovered sequence counter and leave the uninitialized
    /// state, replaying stashed commands in arrival order.
    Initialize { sequence_nr: u64 },

    /// Replay stored events to `requestor`, aggregate-scoped when
    /// `aggregate_id` is present.
    Replay {
        from_sequence_nr: u64,
        requestor: EventSubscriber,
        aggregate_id: Option<String>,
        instance_id: u64,
    },

    /// Persist locally emitted events and report per-event results to
    /// `requestor`.
    Write {
        events: Vec<DurableEvent>,
        requestor: EventSubscriber,
        instance_id: u64,
    },

    /// Persist several independent write requests as one physical write,
    /// acknowledging `completion` once the attempt has been dispatched.
    WriteBatch {
        writes: Vec<WriteRequest>,
        completion: oneshot::Sender<()>,
    },

    /// Scan events for a remote replicator.
    ReplicationRead {
        from_sequence_nr: u64,
        max: usize,
        filter: ReplicationFilter,
        target_log_id: String,
        reply: oneshot::Sender<Result<ReplicationReadSuccess, LogError>>,
    },

    /// Persist events pushed by a remote replicator, or record read
    /// progress only when `events` is empty.
    ReplicationWrite {
        events: Vec<DurableEvent>,
        source_log_id: String,
        last_read_sequence_nr: u64,
        reply: oneshot::Sender<Result<ReplicationWriteSuccess, LogError>>,
    },

    /// How far has this log read from `source_log_id`? Forwarded verbatim
    /// to the index.
    ReadPosition {
        source_log_id: String,
        reply: oneshot::Sender<u64>,
    },

    /// A registered subscriber's channel closed.
    SubscriberTerminated { id: SubscriberId },

    /// Completion of a background replication-read scan, delivered back
    /// into the log's own channel.
    ReplicationReadCompleted {
        result: Result<(Vec<DurableEvent>, u64), StoreError>,
        target_log_id: String,
        reply: oneshot::Sender<Result<ReplicationReadSuccess, LogError>>,
    },

    #[cfg(test)]
    SubscriberCount { reply: oneshot::Sender<usize> },
}

/// A single event log and the task that owns it.
///
/// Constructed only through [`EventLog::spawn`] or
/// [`EventLog::spawn_uninitialized`]; all interaction goes through the
/// returned [`EventLogHandle`].
pub struct EventLog {
    id: String,
    store: Arc<dyn EventStore>,
    config: LogConfig,
    registry: SubscriberRegistry,
    sequence_nr: u64,
    updates_since_refresh: u64,
    index: IndexHandle,
    bus: broadcast::Sender<BusEvent>,
    /// Weak self-sender for background tasks; weak so the task exits when
    /// the last external handle drops.
    tx: mpsc::WeakSender<LogCommand>,
}

impl EventLog {
    /// Start a log task and recover its sequence counter from the store.
    ///
    /// The task starts uninitialized: commands arriving before recovery
    /// completes are stashed and served, in order, once the counter is
    /// known. Recovery runs the store scan on a blocking thread.
    pub fn spawn(
        id: impl Into<String>,
        store: Arc<dyn EventStore>,
        config: LogConfig,
    ) -> EventLogHandle {
        let handle = Self::spawn_uninitialized(id, Arc::clone(&store), config);
        let h = handle.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || store.highest_sequence_nr()).await {
                Ok(Ok(sequence_nr)) => {
                    let _ = h.initialize(sequence_nr).await;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        log_id = %h.id(),
                        error = %e,
                        "sequence number recovery failed, log stays uninitialized"
                    );
                }
                Err(e) => {
                    tracing::error!(log_id = %h.id(), error = %e, "recovery task failed");
                }
            }
        });
        handle
    }

    /// Start a log task without recovering the sequence counter.
    ///
    /// The caller derives the starting counter elsewhere and supplies it
    /// via [`EventLogHandle::initialize`]; until then every other command
    /// is stashed.
    pub fn spawn_uninitialized(
        id: impl Into<String>,
        store: Arc<dyn EventStore>,
        config: LogConfig,
    ) -> EventLogHandle {
        let id = id.into();
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (bus, _) = broadcast::channel(config.bus_capacity);
        let index = spawn_index(id.clone(), Arc::clone(&store), config.read_chunk_size);

        let log = EventLog {
            id: id.clone(),
            store,
            config,
            registry: SubscriberRegistry::new(),
            sequence_nr: 0,
            updates_since_refresh: 0,
            index,
            bus: bus.clone(),
            tx: tx.downgrade(),
        };
        tokio::spawn(log.run(rx));

        EventLogHandle {
            id: Arc::from(id),
            tx,
            bus,
        }
    }

    /// The log task's main loop: stash until initialized, then serve.
    async fn run(mut self, mut rx: mpsc::Receiver<LogCommand>) {
        let mut stash: Vec<LogCommand> = Vec::new();
        let mut initialized = false;

        while let Some(cmd) = rx.recv().await {
            if initialized {
                self.handle(cmd);
                continue;
            }
            match cmd {
                LogCommand::Initialize { sequence_nr } => {
                    self.sequence_nr = sequence_nr;
                    initialized = true;
                    tracing::info!(
                        log_id = %self.id,
                        sequence_nr,
                        num_stashed = stash.len(),
                        "event log initialized"
                    );
                    for stashed in stash.drain(..) {
                        self.handle(stashed);
                    }
                }
                other => stash.push(other),
            }
        }
        tracing::debug!(log_id = %self.id, "event log stopped");
    }

    fn handle(&mut self, cmd: LogCommand) {
        match cmd {
            LogCommand::Initialize { sequence_nr } => {
                tracing::warn!(
                    log_id = %self.id,
                    sequence_nr,
                    "ignoring Initialize on an initialized log"
                );
            }

            LogCommand::Replay {
                from_sequence_nr,
                requestor,
                aggregate_id,
                instance_id,
            } => self.handle_replay(from_sequence_nr, requestor, aggregate_id, instance_id),

            LogCommand::Write {
                events,
                requestor,
                instance_id,
            } => {
                let write = WriteRequest {
                    events,
                    requestor,
                    instance_id,
                };
                self.handle_write(vec![write], None);
            }

            LogCommand::WriteBatch { writes, completion } => {
                self.handle_write(writes, Some(completion));
            }

            LogCommand::ReplicationRead {
                from_sequence_nr,
                max,
                filter,
                target_log_id,
                reply,
            } => self.handle_replication_read(from_sequence_nr, max, filter, target_log_id, reply),

            LogCommand::ReplicationWrite {
                events,
                source_log_id,
                last_read_sequence_nr,
                reply,
            } => self.handle_replication_write(events, source_log_id, last_read_sequence_nr, reply),

            LogCommand::ReadPosition {
                source_log_id,
                reply,
            } => self.index.read_position(source_log_id, reply),

            LogCommand::SubscriberTerminated { id } => {
                if self.registry.remove(id) {
                    tracing::debug!(log_id = %self.id, "terminated subscriber removed");
                }
            }

            LogCommand::ReplicationReadCompleted {
                result,
                target_log_id,
                reply,
            } => match result {
                Ok((events, watermark)) => {
                    let _ = self.bus.send(BusEvent::ReplicationReadSucceeded {
                        events: events.clone(),
                        watermark,
                        target_log_id: target_log_id.clone(),
                    });
                    let _ = reply.send(Ok(ReplicationReadSuccess {
                        events,
                        watermark,
                        target_log_id,
                    }));
                }
                Err(e) => {
                    tracing::error!(log_id = %self.id, error = %e, "replication read failed");
                    let _ = self.bus.send(BusEvent::ReplicationReadFailed {
                        message: e.to_string(),
                        target_log_id,
                    });
                    let _ = reply.send(Err(LogError::Store(e)));
                }
            },

            #[cfg(test)]
            LogCommand::SubscriberCount { reply } => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    /// Persist one or more write requests as a single physical write.
    ///
    /// Sequence numbers consumed by a failed attempt are never reused:
    /// the counter stays advanced so later writes skip over them.
    fn handle_write(&mut self, writes: Vec<WriteRequest>, completion: Option<oneshot::Sender<()>>) {
        let mut replies: Vec<(EventSubscriber, u64, std::ops::Range<usize>)> =
            Vec::with_capacity(writes.len());
        let mut all = Vec::new();
        for write in writes {
            let start = all.len();
            for event in write.events {
                self.sequence_nr += 1;
                all.push(event.stamped_local(&self.id, self.sequence_nr));
            }
            replies.push((write.requestor, write.instance_id, start..all.len()));
        }

        if all.is_empty() {
            if let Some(completion) = completion {
                let _ = completion.send(());
            }
            return;
        }

        let batch_id = Uuid::new_v4();
        let batch = DurableEventBatch::local(all);
        match self.store.write(&batch) {
            Ok(()) => {
                tracing::info!(
                    log_id = %self.id,
                    batch_id = %batch_id,
                    num_events = batch.events.len(),
                    "events written"
                );
                for (requestor, instance_id, range) in &replies {
                    for event in &batch.events[range.clone()] {
                        let _ = requestor.send(Notification::WriteSuccess {
                            event: event.clone(),
                            instance_id: *instance_id,
                        });
                    }
                    for event in &batch.events[range.clone()] {
                        self.notify_subscribers(event, Some(requestor));
                    }
                }
                let _ = self.bus.send(BusEvent::Updated {
                    events: batch.events.clone(),
                });
                self.bump_update_count(batch.events.len() as u64);
            }
            Err(e) => {
                tracing::error!(
                    log_id = %self.id,
                    batch_id = %batch_id,
                    error = %e,
                    "physical write failed"
                );
                for (requestor, instance_id, range) in &replies {
                    for event in &batch.events[range.clone()] {
                        let _ = requestor.send(Notification::WriteFailure {
                            event: event.clone(),
                            cause: LogError::Store(e.clone()),
                            instance_id: *instance_id,
                        });
                    }
                }
            }
        }

        if let Some(completion) = completion {
            let _ = completion.send(());
        }
    }

    fn handle_replication_write(
        &mut self,
        events: Vec<DurableEvent>,
        source_log_id: String,
        last_read_sequence_nr: u64,
        reply: oneshot::Sender<Result<ReplicationWriteSuccess, LogError>>,
    ) {
        if events.is_empty() {
            // Pure progress update; the counter is untouched.
            self.index.progress(source_log_id, last_read_sequence_nr, reply);
            return;
        }

        let snapshot = self.sequence_nr;
        let mut stamped = Vec::with_capacity(events.len());
        for event in events {
            self.sequence_nr += 1;
            stamped.push(event.stamped_replicated(&self.id, self.sequence_nr));
        }

        let batch = DurableEventBatch::replicated(
            stamped,
            ReplicationProgress {
                source_log_id: source_log_id.clone(),
                last_read_sequence_nr,
            },
        );
        match self.store.write(&batch) {
            Ok(()) => {
                let num = batch.events.len();
                tracing::info!(
                    log_id = %self.id,
                    source_log_id = %source_log_id,
                    num_events = num,
                    last_read_sequence_nr,
                    "replicated events written"
                );
                let _ = reply.send(Ok(ReplicationWriteSuccess {
                    num,
                    stored_replication_progress: last_read_sequence_nr,
                }));
                for event in &batch.events {
                    self.notify_subscribers(event, None);
                }
                let _ = self.bus.send(BusEvent::Updated {
                    events: batch.events.clone(),
                });
                self.index.progress_written(source_log_id, last_read_sequence_nr);
                self.bump_update_count(num as u64);
            }
            Err(e) => {
                // None of these sequence numbers were externally observed,
                // so the counter rolls back to its pre-write snapshot and a
                // retry from the same watermark reproduces identical numbers.
                self.sequence_nr = snapshot;
                tracing::error!(
                    log_id = %self.id,
                    source_log_id = %source_log_id,
                    error = %e,
                    "replication write failed"
                );
                let _ = reply.send(Err(LogError::Store(e)));
            }
        }
    }

    fn handle_replication_read(
        &mut self,
        from_sequence_nr: u64,
        max: usize,
        filter: ReplicationFilter,
        target_log_id: String,
        reply: oneshot::Sender<Result<ReplicationReadSuccess, LogError>>,
    ) {
        let _ = self.bus.send(BusEvent::ReplicationReadRequested {
            from_sequence_nr,
            max,
            target_log_id: target_log_id.clone(),
        });

        let store = Arc::clone(&self.store);
        let chunk = self.config.read_chunk_size;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let scan = tokio::task::spawn_blocking(move || {
                scan_filtered(store.as_ref(), from_sequence_nr, max, &filter, chunk)
            })
            .await;
            let result = match scan {
                Ok(result) => result,
                Err(e) => Err(StoreError::Io(format!("replication read task failed: {e}"))),
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(LogCommand::ReplicationReadCompleted {
                        result,
                        target_log_id,
                        reply,
                    })
                    .await;
            }
        });
    }

    fn handle_replay(
        &mut self,
        from_sequence_nr: u64,
        requestor: EventSubscriber,
        aggregate_id: Option<String>,
        instance_id: u64,
    ) {
        match aggregate_id {
            Some(aggregate_id) => {
                self.register_subscriber(&requestor, Some(aggregate_id.clone()));
                self.index
                    .replay(from_sequence_nr, requestor, aggregate_id, instance_id);
            }
            None => {
                self.register_subscriber(&requestor, None);
                let store = Arc::clone(&self.store);
                let chunk = self.config.read_chunk_size;
                tokio::task::spawn_blocking(move || {
                    replay_to(store.as_ref(), from_sequence_nr, chunk, &requestor, instance_id);
                });
            }
        }
    }

    /// Register a requestor in the appropriate registry and watch its
    /// channel for closure. Only a fresh registration spawns a watch.
    fn register_subscriber(&mut self, requestor: &EventSubscriber, aggregate_id: Option<String>) {
        let (id, fresh) = self.registry.register(requestor.clone(), aggregate_id);
        if !fresh {
            return;
        }
        let tx = self.tx.clone();
        let sender = requestor.clone();
        tokio::spawn(async move {
            sender.closed().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(LogCommand::SubscriberTerminated { id }).await;
            }
        });
    }

    /// Deliver `Written` to default subscribers and to aggregate
    /// subscribers named in the event's routing destinations, skipping
    /// the write's own requestor.
    fn notify_subscribers(&self, event: &DurableEvent, exclude: Option<&EventSubscriber>) {
        let excluded =
            |sender: &EventSubscriber| exclude.is_some_and(|requestor| sender.same_channel(requestor));

        for sender in self.registry.default_subscribers() {
            if excluded(sender) {
                continue;
            }
            let _ = sender.send(Notification::Written {
                event: event.clone(),
            });
        }
        for destination in event.routing_destinations() {
            for sender in self.registry.aggregate_subscribers(&destination) {
                if excluded(sender) {
                    continue;
                }
                let _ = sender.send(Notification::Written {
                    event: event.clone(),
                });
            }
        }
    }

    /// Count sequence advances and request an index refresh once the
    /// configured threshold is crossed, amortizing index maintenance.
    fn bump_update_count(&mut self, num: u64) {
        self.updates_since_refresh += num;
        if self.updates_since_refresh >= self.config.index_update_threshold {
            tracing::debug!(
                log_id = %self.id,
                pending = self.updates_since_refresh,
                "requesting index refresh"
            );
            self.updates_since_refresh = 0;
            self.index.update();
        }
    }
}

/// Chunked, filtered scan for a replication read.
///
/// Stops once `max` matching events are collected or the log is exhausted.
/// The returned watermark is the highest sequence number scanned, matching
/// or not, so the caller resumes past filtered-out events.
fn scan_filtered(
    store: &dyn EventStore,
    from_sequence_nr: u64,
    max: usize,
    filter: &ReplicationFilter,
    chunk: usize,
) -> Result<(Vec<DurableEvent>, u64), StoreError> {
    let mut matching = Vec::new();
    let mut watermark = from_sequence_nr.saturating_sub(1);
    if max == 0 {
        return Ok((matching, watermark));
    }

    let mut next = from_sequence_nr;
    loop {
        let batch = store.read(next, chunk)?;
        let exhausted = batch.len() < chunk;
        for event in batch {
            watermark = event.target_log_sequence_nr;
            next = watermark + 1;
            if filter(&event) {
                matching.push(event);
                if matching.len() == max {
                    return Ok((matching, watermark));
                }
            }
        }
        if exhausted {
            return Ok((matching, watermark));
        }
    }
}

/// Chunked default-scope replay: deliver each event as it is read, then
/// exactly one terminal message. Stops silently if the requestor is gone.
fn replay_to(
    store: &dyn EventStore,
    from_sequence_nr: u64,
    chunk: usize,
    requestor: &EventSubscriber,
    instance_id: u64,
) {
    let mut next = from_sequence_nr;
    loop {
        match store.read(next, chunk) {
            Ok(batch) => {
                let exhausted = batch.len() < chunk;
                for event in batch {
                    next = event.target_log_sequence_nr + 1;
                    let delivered = requestor.send(Notification::Replaying { event, instance_id });
                    if delivered.is_err() {
                        return;
                    }
                }
                if exhausted {
                    let _ = requestor.send(Notification::ReplaySuccess { instance_id });
                    return;
                }
            }
            Err(e) => {
                let _ = requestor.send(Notification::ReplayFailure {
                    cause: LogError::Store(e),
                    instance_id,
                });
                return;
            }
        }
    }
}

/// Async handle to a running event log.
///
/// Lightweight, cloneable, and `Send + Sync`; all methods enqueue a
/// command on the log's bounded channel. Dropping the last handle stops
/// the log task.
#[derive(Clone)]
pub struct EventLogHandle {
    id: Arc<str>,
    tx: mpsc::Sender<LogCommand>,
    bus: broadcast::Sender<BusEvent>,
}

impl EventLogHandle {
    /// This log's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Supply the recovered sequence counter to an uninitialized log.
    ///
    /// Sent automatically by [`EventLog::spawn`]; only callers using
    /// [`EventLog::spawn_uninitialized`] invoke this themselves.
    pub async fn initialize(&self, sequence_nr: u64) -> Result<(), LogError> {
        self.send(LogCommand::Initialize { sequence_nr }).await
    }

    /// Replay stored events to `requestor` starting at `from_sequence_nr`.
    ///
    /// With an aggregate id, the requestor is registered as an aggregate
    /// subscriber and the index serves the replay; without one, it is
    /// registered as a default subscriber and the whole log is scanned.
    /// The requestor receives `Replaying` per event, then exactly one
    /// `ReplaySuccess` or `ReplayFailure`.
    pub async fn replay(
        &self,
        from_sequence_nr: u64,
        requestor: EventSubscriber,
        aggregate_id: Option<&str>,
        instance_id: u64,
    ) -> Result<(), LogError> {
        self.send(LogCommand::Replay {
            from_sequence_nr,
            requestor,
            aggregate_id: aggregate_id.map(str::to_string),
            instance_id,
        })
        .await
    }

    /// Persist locally emitted events. Per-event `WriteSuccess` or
    /// `WriteFailure` results are delivered to `requestor`.
    pub async fn write(
        &self,
        events: Vec<DurableEvent>,
        requestor: EventSubscriber,
        instance_id: u64,
    ) -> Result<(), LogError> {
        self.send(LogCommand::Write {
            events,
            requestor,
            instance_id,
        })
        .await
    }

    /// Persist several independent write requests as one physical write,
    /// returning once the attempt (success or failure) has been
    /// dispatched. Used by the batching layer to pace coalescing rounds.
    pub async fn write_batch(&self, writes: Vec<WriteRequest>) -> Result<(), LogError> {
        let (completion, done) = oneshot::channel();
        self.send(LogCommand::WriteBatch { writes, completion })
            .await?;
        done.await.map_err(|_| LogError::Closed)
    }

    /// Scan up to `max` events matching `filter` starting at
    /// `from_sequence_nr`, on behalf of the replicator feeding
    /// `target_log_id`.
    pub async fn replication_read(
        &self,
        from_sequence_nr: u64,
        max: usize,
        filter: ReplicationFilter,
        target_log_id: impl Into<String>,
    ) -> Result<ReplicationReadSuccess, LogError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogCommand::ReplicationRead {
            from_sequence_nr,
            max,
            filter,
            target_log_id: target_log_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LogError::Closed)?
    }

    /// Persist events read from `source_log_id` by a remote replicator,
    /// recording `last_read_sequence_nr` as read progress. With no events
    /// this is a pure progress update.
    pub async fn replication_write(
        &self,
        events: Vec<DurableEvent>,
        source_log_id: impl Into<String>,
        last_read_sequence_nr: u64,
    ) -> Result<ReplicationWriteSuccess, LogError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogCommand::ReplicationWrite {
            events,
            source_log_id: source_log_id.into(),
            last_read_sequence_nr,
            reply,
        })
        .await?;
        rx.await.map_err(|_| LogError::Closed)?
    }

    /// Highest sequence number this log has read from `source_log_id`,
    /// zero if never read from. Answered by the index.
    pub async fn read_position(
        &self,
        source_log_id: impl Into<String>,
    ) -> Result<u64, LogError> {
        let (reply, rx) = oneshot::channel();
        self.send(LogCommand::ReadPosition {
            source_log_id: source_log_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LogError::Closed)
    }

    /// Subscribe to the process-wide notification stream of this log.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    async fn send(&self, cmd: LogCommand) -> Result<(), LogError> {
        self.tx.send(cmd).await.map_err(|_| LogError::Closed)
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LogCommand::SubscriberCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
