//! Event storage trait and built-in backends.
//!
//! The store is append-only and addressed by target sequence number.
//! Writes are synchronous from the log actor's point of view and complete
//! within one message turn; reads run on background tasks holding an
//! `Arc<dyn EventStore>`, so backends must be `Send + Sync`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::event::{DurableEvent, DurableEventBatch};

/// Append-only, sequence-addressed storage for one log.
pub trait EventStore: Send + Sync + 'static {
    /// Persist a batch as one atomic physical write. When the batch carries
    /// replication provenance, the source-log read progress is recorded
    /// with the same write.
    fn write(&self, batch: &DurableEventBatch) -> Result<(), StoreError>;

    /// Read up to `max` events with target sequence number `>=
    /// from_sequence_nr`, in ascending order.
    fn read(&self, from_sequence_nr: u64, max: usize) -> Result<Vec<DurableEvent>, StoreError>;

    /// Highest target sequence number ever written, zero for an empty log.
    /// Used to recover the sequence counter at startup.
    fn highest_sequence_nr(&self) -> Result<u64, StoreError>;

    /// Highest sequence number read from `source_log_id`, zero if that
    /// source was never read from.
    fn replication_progress(&self, source_log_id: &str) -> Result<u64, StoreError>;

    /// All recorded replication read positions, keyed by source log id.
    fn replication_progresses(&self) -> Result<HashMap<String, u64>, StoreError>;

    /// Record a read position without writing events (progress-only
    /// replication writes).
    fn write_replication_progress(
        &self,
        source_log_id: &str,
        last_read_sequence_nr: u64,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    events: BTreeMap<u64, DurableEvent>,
    progress: HashMap<String, u64>,
    fail_writes: bool,
    write_count: u64,
}

/// Heap-backed store used by tests and ephemeral logs.
///
/// Carries two test-facing knobs: [`fail_writes`](MemoryStore::fail_writes)
/// makes every subsequent write fail, and
/// [`write_count`](MemoryStore::write_count) counts physical write calls
/// (batching behavior is observable through it).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated write failures.
    pub fn fail_writes(&self, fail: bool) {
        self.lock_inner().fail_writes = fail;
    }

    /// Number of physical write calls accepted or rejected so far.
    pub fn write_count(&self) -> u64 {
        self.lock_inner().write_count
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock means a panic mid-write in another test thread;
        // the data is plain values, so continue with what is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventStore for MemoryStore {
    fn write(&self, batch: &DurableEventBatch) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        inner.write_count += 1;
        if inner.fail_writes {
            return Err(StoreError::Io("simulated write failure".to_string()));
        }
        for event in &batch.events {
            inner.events.insert(event.target_log_sequence_nr, event.clone());
        }
        if let Some(progress) = &batch.replication {
            inner.progress.insert(
                progress.source_log_id.clone(),
                progress.last_read_sequence_nr,
            );
        }
        Ok(())
    }

    fn read(&self, from_sequence_nr: u64, max: usize) -> Result<Vec<DurableEvent>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner
            .events
            .range(from_sequence_nr..)
            .take(max)
            .map(|(_, event)| event.clone())
            .collect())
    }

    fn highest_sequence_nr(&self) -> Result<u64, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.events.keys().next_back().copied().unwrap_or(0))
    }

    fn replication_progress(&self, source_log_id: &str) -> Result<u64, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.progress.get(source_log_id).copied().unwrap_or(0))
    }

    fn replication_progresses(&self) -> Result<HashMap<String, u64>, StoreError> {
        Ok(self.lock_inner().progress.clone())
    }

    fn write_replication_progress(
        &self,
        source_log_id: &str,
        last_read_sequence_nr: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if inner.fail_writes {
            return Err(StoreError::Io("simulated write failure".to_string()));
        }
        inner
            .progress
            .insert(source_log_id.to_string(), last_read_sequence_nr);
        Ok(())
    }
}

struct JsonlInner {
    events: BTreeMap<u64, DurableEvent>,
    progress: HashMap<String, u64>,
}

/// File-backed store: one JSON event per line in `events.jsonl`, plus a
/// `progress.json` document holding replication read positions.
///
/// The full event map is kept in memory and mirrored to disk on write, so
/// reads never touch the filesystem. `progress.json` is replaced through a
/// temp file and rename, keeping it readable after a crash mid-update.
pub struct JsonlStore {
    dir: PathBuf,
    inner: Mutex<JsonlInner>,
}

impl JsonlStore {
    /// Open (or create) a store rooted at `dir`, loading any existing
    /// events and progress.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut events = BTreeMap::new();
        let events_path = dir.join("events.jsonl");
        if events_path.exists() {
            let file = fs::File::open(&events_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let event: DurableEvent = serde_json::from_str(&line)?;
                events.insert(event.target_log_sequence_nr, event);
            }
        }

        let progress_path = dir.join("progress.json");
        let progress = if progress_path.exists() {
            serde_json::from_str(&fs::read_to_string(&progress_path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            dir,
            inner: Mutex::new(JsonlInner { events, progress }),
        })
    }

    /// Root directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, JsonlInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Io("store lock poisoned".to_string()))
    }

    fn append_events(&self, events: &[DurableEvent]) -> Result<(), StoreError> {
        let mut lines = String::new();
        for event in events {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("events.jsonl"))?;
        file.write_all(lines.as_bytes())?;
        Ok(())
    }

    fn save_progress(&self, progress: &HashMap<String, u64>) -> Result<(), StoreError> {
        let tmp = self.dir.join("progress.json.tmp");
        fs::write(&tmp, serde_json::to_string(progress)?)?;
        fs::rename(&tmp, self.dir.join("progress.json"))?;
        Ok(())
    }
}

impl EventStore for JsonlStore {
    fn write(&self, batch: &DurableEventBatch) -> Result<(), StoreError> {
        let mut inner = self.lock_inner()?;
        self.append_events(&batch.events)?;
        if let Some(progress) = &batch.replication {
            inner.progress.insert(
                progress.source_log_id.clone(),
                progress.last_read_sequence_nr,
            );
            self.save_progress(&inner.progress)?;
        }
        for event in &batch.events {
            inner.events.insert(event.target_log_sequence_nr, event.clone());
        }
        Ok(())
    }

    fn read(&self, from_sequence_nr: u64, max: usize) -> Result<Vec<DurableEvent>, StoreError> {
        let inner = self.lock_inner()?;
        Ok(inner
            .events
            .range(from_sequence_nr..)
            .take(max)
            .map(|(_, event)| event.clone())
            .collect())
    }

    fn highest_sequence_nr(&self) -> Result<u64, StoreError> {
        let inner = self.lock_inner()?;
        Ok(inner.events.keys().next_back().copied().unwrap_or(0))
    }

    fn replication_progress(&self, source_log_id: &str) -> Result<u64, StoreError> {
        let inner = self.lock_inner()?;
        Ok(inner.progress.get(source_log_id).copied().unwrap_or(0))
    }

    fn replication_progresses(&self) -> Result<HashMap<String, u64>, StoreError> {
        Ok(self.lock_inner()?.progress.clone())
    }

    fn write_replication_progress(
        &self,
        source_log_id: &str,
        last_read_sequence_nr: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner()?;
        inner
            .progress
            .insert(source_log_id.to_string(), last_read_sequence_nr);
        self.save_progress(&inner.progress)
    }
}
