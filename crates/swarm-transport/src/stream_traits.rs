//! Stream storage trait definitions
//!
//! A stream is an append-only, ordered log identified by a [`StreamKey`].
//! Entries receive a monotonically increasing [`StreamOffset`] at append
//! time. Consumers persist their read position per stream as a cursor so a
//! restarted reader resumes where it last acknowledged.
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; `SurrealStreamStore` is the durable implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for stream operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// StreamKey
// ---------------------------------------------------------------------------

/// Name of a stream.
///
/// The inner field is private so a key is always non-empty and free of
/// whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    /// Validate and wrap a stream name.
    pub fn new(key: impl Into<String>) -> StorageResult<Self> {
        let key = key.into();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(StorageError::InvalidStreamKey { key });
        }
        Ok(StreamKey(key))
    }

    /// Return the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StreamOffset / StreamEntry
// ---------------------------------------------------------------------------

/// Position of an entry within one stream (1-based, strictly increasing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamOffset(pub u64);

impl StreamOffset {
    /// The offset that follows this one.
    pub fn next(self) -> Self {
        StreamOffset(self.0 + 1)
    }
}

impl std::fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single appended entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Position within the stream
    pub offset: StreamOffset,
    /// Opaque JSON payload
    pub payload: serde_json::Value,
    /// When the store accepted the entry
    pub appended_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StreamStore
// ---------------------------------------------------------------------------

/// Durable, ordered stream storage.
///
/// Guarantees:
/// - `append` assigns offsets 1, 2, 3, ... per stream with no gaps and no
///   reuse; entries are returned in offset order.
/// - Ordering holds within one stream only.
/// - Cursors are stored per `(consumer, stream)` and only move when
///   committed.
/// - After `close()` every operation fails with `StorageError::Closed`.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append a payload and return its offset.
    async fn append(&self, key: &StreamKey, payload: serde_json::Value)
        -> StorageResult<StreamOffset>;

    /// Read up to `limit` entries strictly after `after` (from the start when `None`).
    async fn read_after(
        &self,
        key: &StreamKey,
        after: Option<StreamOffset>,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>>;

    /// Read the newest `limit` entries, returned oldest first.
    async fn read_last(&self, key: &StreamKey, limit: usize) -> StorageResult<Vec<StreamEntry>>;

    /// Number of entries in a stream (0 for an unknown stream).
    async fn len(&self, key: &StreamKey) -> StorageResult<u64>;

    /// Last committed position of `consumer` on `key`, if any.
    async fn load_cursor(&self, consumer: &str, key: &StreamKey)
        -> StorageResult<Option<StreamOffset>>;

    /// Persist the position of `consumer` on `key`.
    async fn commit_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
        offset: StreamOffset,
    ) -> StorageResult<()>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_rejects_empty_and_whitespace() {
        assert!(StreamKey::new("").is_err());
        assert!(StreamKey::new("swarm:inbox:a b").is_err());
        assert_eq!(
            StreamKey::new("swarm:global").unwrap().as_str(),
            "swarm:global"
        );
    }

    #[test]
    fn offset_next_increments() {
        assert_eq!(StreamOffset(4).next(), StreamOffset(5));
        assert!(StreamOffset(1) < StreamOffset(2));
    }
}
