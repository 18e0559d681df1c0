use std::fmt::Display;

use uuid::Uuid;

/// A specialized error type for storage engine operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Lookup of an undefined keyspace.
    #[error("no such keyspace: {0}")]
    NoSuchKeyspace(String),
    /// Lookup of an undefined table.
    #[error("no such column family: {0}")]
    NoSuchColumnFamily(String),
    /// Configuration value was invalid (bad strategy option, malformed
    /// replication factor, unrecognized option).
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
    /// Corruption detected while probing or reading an sstable.
    #[error("malformed sstable {file}: {reason}")]
    MalformedSstable { file: String, reason: String },
    /// A write arrived carrying a replay position below the highest position
    /// already flushed. Recovered by retrying the whole apply.
    #[error("replay position reordered")]
    ReplayPositionReordered,
    /// The read-concurrency queue exceeded its cap.
    #[error("read queue overloaded")]
    Overloaded,
    /// A read waited longer than the configured request timeout.
    #[error("request timed out")]
    Timeout,
    /// An atomic sstable deletion was aborted because a peer's delete
    /// failed. Logged by callers, never fatal.
    #[error("atomic deletion cancelled: {0}")]
    AtomicDeletionCancelled(String),
    /// A requested flush failed; the memtable remains in place.
    #[error("flush failed: {0}")]
    FlushFailed(String),
    /// Mutation used a schema version the registry has not synced.
    #[error("schema not synced for {ks}.{cf} version {version}")]
    SchemaNotSynced { ks: String, cf: String, version: Uuid },
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The engine is shutting down.
    #[error("shutting down")]
    Shutdown,
}

impl StoreError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::ConfigurationInvalid(msg.to_string())
    }

    /// Create a malformed-sstable error naming the offending file.
    pub fn malformed_sstable<F, R>(file: F, reason: R) -> Self
    where
        F: Display,
        R: Display,
    {
        Self::MalformedSstable {
            file: file.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a serialization error from a displayable value.
    pub fn serialization<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Serialization(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for storage engine operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = StoreError::invalid_config("rf must be numeric");
        assert!(matches!(err, StoreError::ConfigurationInvalid(msg) if msg == "rf must be numeric"));
    }

    #[test]
    fn malformed_sstable_names_the_file() {
        let err = StoreError::malformed_sstable("ks-cf-rs1-5-Data.db", "bad checksum");
        let printed = err.to_string();
        assert!(printed.contains("ks-cf-rs1-5-Data.db"));
        assert!(printed.contains("bad checksum"));
    }
}
