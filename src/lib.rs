//! Durable, replicated event log: actor-owned write paths, pull/push
//! replication between locations, and aggregate-routed subscriber fan-out.

mod batcher;
pub use batcher::WriteBatcher;
mod config;
pub use config::LogConfig;
mod error;
pub use error::{LogError, StoreError};
mod event;
pub use event::{DurableEvent, DurableEventBatch, ReplicationProgress, VectorTime};
mod index;
mod log;
pub use log::{EventLog, EventLogHandle};
mod protocol;
pub use protocol::{
    BusEvent, EventSubscriber, Notification, ReplicationFilter, ReplicationReadSuccess,
    ReplicationWriteSuccess, WriteRequest, accept_all, exclude_process,
};
mod registry;
mod replication;
pub use replication::{Replicator, replicate_once};
mod storage;
pub use storage::{EventStore, JsonlStore, MemoryStore};
