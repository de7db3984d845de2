//! Batching layer: coalesces concurrently submitted write requests into
//! one physical write.
//!
//! At most one physical write is in flight at a time. While the log
//! processes a batch, newly arriving requests queue in the batcher's
//! channel; when the completion for the previous batch arrives they are
//! drained, up to `batch_max` sub-writes, into the next one. The layer is
//! transparent to callers: per-event success and failure results still
//! flow to each original requestor.

use tokio::sync::mpsc;

use crate::config::LogConfig;
use crate::error::LogError;
use crate::event::DurableEvent;
use crate::log::EventLogHandle;
use crate::protocol::{EventSubscriber, WriteRequest};

/// Async handle to the batching layer in front of an event log.
///
/// Cheap to clone; dropping the last handle stops the batcher task (the
/// log itself keeps running as long as other handles to it exist).
#[derive(Clone)]
pub struct WriteBatcher {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteBatcher {
    /// Start a batcher in front of `log`.
    pub fn spawn(log: EventLogHandle, config: &LogConfig) -> WriteBatcher {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(config.channel_capacity);
        let batch_max = config.batch_max.max(1);

        tokio::spawn(async move {
            let mut buf: Vec<WriteRequest> = Vec::with_capacity(batch_max);
            loop {
                buf.clear();
                // Waits for the first request, then drains whatever else
                // already queued up, bounded by batch_max.
                let num = rx.recv_many(&mut buf, batch_max).await;
                if num == 0 {
                    break;
                }
                let writes: Vec<WriteRequest> = buf.drain(..).collect();
                tracing::debug!(
                    log_id = %log.id(),
                    num_writes = writes.len(),
                    "dispatching coalesced write batch"
                );
                // write_batch resolves once the physical write attempt has
                // been dispatched, which paces the next coalescing round.
                if log.write_batch(writes).await.is_err() {
                    tracing::error!(log_id = %log.id(), "event log gone, batching layer stopping");
                    break;
                }
            }
        });

        WriteBatcher { tx }
    }

    /// Submit a write request. Per-event results are delivered to
    /// `requestor` exactly as with a direct log write.
    pub async fn write(
        &self,
        events: Vec<DurableEvent>,
        requestor: EventSubscriber,
        instance_id: u64,
    ) -> Result<(), LogError> {
        self.tx
            .send(WriteRequest {
                events,
                requestor,
                instance_id,
            })
            .await
            .map_err(|_| LogError::Closed)
    }
}
