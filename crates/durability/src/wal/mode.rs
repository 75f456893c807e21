//! Durability / fsync scheduling modes.

/// How aggressively the WAL fsyncs after an append. Corresponds to the
/// `wal_sync_mode` catalog config field (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every commit record. Strongest durability, highest
    /// latency.
    Sync,
    /// Batch concurrent commit-record appends into a single fsync
    /// (group commit). Default for production use.
    Group,
    /// Never block on fsync; the OS page cache may still hold dirty
    /// pages across a crash. Suitable for ephemeral/test databases.
    Async,
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Group
    }
}
