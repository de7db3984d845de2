//! Crate-level error types for the storage boundary and the log protocol.

/// Error raised by an [`EventStore`](crate::EventStore) backend.
///
/// Cloneable by design: a single failed physical write is reported once per
/// event in the batch, so the cause travels inside several
/// [`Notification::WriteFailure`](crate::Notification::WriteFailure)
/// messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failure (filesystem, simulated fault, lock poisoning).
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored data could not be encoded or decoded.
    #[error("storage data error: {0}")]
    Data(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Data(e.to_string())
    }
}

/// Error returned by [`EventLogHandle`](crate::EventLogHandle) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// The physical store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event log task exited, so no further requests can be processed.
    ///
    /// Raised when the inbound channel or a reply channel is closed. The
    /// durable log state survives; respawning the log recovers it.
    #[error("event log is no longer running")]
    Closed,
}
