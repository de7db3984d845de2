//! Tunables for the event log, its secondary index, and the batching layer.

/// Configuration for a single event log instance.
///
/// All fields have sensible defaults accessible via [`LogConfig::default()`].
/// Pass to [`EventLog::spawn`](crate::EventLog::spawn) and
/// [`WriteBatcher::spawn`](crate::WriteBatcher::spawn) to customize.
///
/// # Examples
///
/// ```
/// use logmesh::LogConfig;
///
/// let config = LogConfig {
///     index_update_threshold: 16,
///     ..LogConfig::default()
/// };
/// assert_eq!(config.index_update_threshold, 16);
/// assert_eq!(config.batch_max, 64);
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Number of sequence-number advances between index refresh requests.
    ///
    /// The log counts how many events it has written since the last refresh
    /// and asks the index to catch up once the count crosses this threshold,
    /// amortizing index maintenance over many writes. A smaller value keeps
    /// aggregate replay cheaper at the cost of more refresh traffic.
    ///
    /// Default: 64.
    pub index_update_threshold: u64,

    /// Maximum number of write requests coalesced into one physical write
    /// by the batching layer.
    ///
    /// Default: 64.
    pub batch_max: usize,

    /// Capacity of the bounded inbound channels feeding the log and the
    /// batching layer.
    ///
    /// Default: 128.
    pub channel_capacity: usize,

    /// Number of events fetched per store round-trip by background scans
    /// (replay and replication reads).
    ///
    /// Default: 512.
    pub read_chunk_size: usize,

    /// Buffer size of the process-wide notification stream.
    ///
    /// The stream is fire-and-forget; subscribers that lag more than this
    /// many messages behind miss the overwritten ones.
    ///
    /// Default: 128.
    pub bus_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            index_update_threshold: 64,
            batch_max: 64,
            channel_capacity: 128,
            read_chunk_size: 512,
            bus_capacity: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = LogConfig::default();
        assert_eq!(config.index_update_threshold, 64);
        assert_eq!(config.batch_max, 64);
        assert_eq!(config.channel_capacity, 128);
        assert_eq!(config.read_chunk_size, 512);
        assert_eq!(config.bus_capacity, 128);
    }

    #[test]
    fn struct_update_syntax_overrides_single_field() {
        let config = LogConfig {
            read_chunk_size: 8,
            ..LogConfig::default()
        };
        assert_eq!(config.read_chunk_size, 8);
        assert_eq!(config.channel_capacity, 128);
    }
}
