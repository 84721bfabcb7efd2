//! SurrealDB-backed StreamStore implementation
//!
//! Uses `schema::StreamEntryRecord` and `schema::CursorRecord` for
//! persistence, converting to/from `stream_traits` types at the boundary.
//!
//! Appends to one stream are serialised through an in-process lock that
//! caches the stream head; the `(stream, seq)` unique index rejects a
//! conflicting writer from another process instead of reordering entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::handle::{ConnectOptions, SurrealHandle};
use crate::schema::{CursorRecord, SeqRow, StreamEntryRecord};
use crate::stream_traits::{StorageResult, StreamEntry, StreamKey, StreamOffset, StreamStore};

type HeadLock = Arc<tokio::sync::Mutex<Option<u64>>>;

/// SurrealDB-backed implementation of [`StreamStore`].
pub struct SurrealStreamStore {
    handle: SurrealHandle,
    heads: Mutex<HashMap<String, HeadLock>>,
    closed: AtomicBool,
}

impl SurrealStreamStore {
    /// Wrap an already-connected handle.
    pub fn new(handle: SurrealHandle) -> Self {
        Self {
            handle,
            heads: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::in_memory().await?))
    }

    /// Connect to the given endpoint URL.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::connect(url).await?))
    }

    /// Connect with explicit namespace, database and credentials.
    pub async fn open(options: &ConnectOptions) -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::open(options).await?))
    }

    /// Create from environment variables (see [`ConnectOptions::from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::from_env().await?))
    }

    // -- private helpers -----------------------------------------------------

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn head_lock(&self, key: &StreamKey) -> StorageResult<HeadLock> {
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| StorageError::Backend("stream head map poisoned".to_string()))?;
        Ok(Arc::clone(
            heads.entry(key.as_str().to_string()).or_default(),
        ))
    }

    /// Highest sequence stored for a stream (0 when empty).
    async fn max_seq(&self, key: &StreamKey) -> StorageResult<u64> {
        let mut res = self
            .handle
            .db()
            .query("SELECT seq FROM stream_entries WHERE stream = $stream ORDER BY seq DESC LIMIT 1")
            .bind(("stream", key.as_str().to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<SeqRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.first().map(|r| r.seq).unwrap_or(0))
    }

    /// Convert a `schema::StreamEntryRecord` (DB row) into a `StreamEntry`.
    fn db_entry_to_entry(row: StreamEntryRecord) -> StreamEntry {
        StreamEntry {
            offset: StreamOffset(row.seq),
            payload: row.payload,
            appended_at: row.appended_at,
        }
    }
}

#[async_trait]
impl StreamStore for SurrealStreamStore {
    async fn append(
        &self,
        key: &StreamKey,
        payload: serde_json::Value,
    ) -> StorageResult<StreamOffset> {
        self.ensure_open()?;

        let lock = self.head_lock(key)?;
        let mut head = lock.lock().await;
        let current = match *head {
            Some(seq) => seq,
            None => self.max_seq(key).await?,
        };
        let seq = current + 1;

        let row = StreamEntryRecord::new(key.as_str().to_string(), seq, payload);
        let created: Result<Option<StreamEntryRecord>, surrealdb::Error> =
            self.handle.db().create("stream_entries").content(row).await;

        match created {
            Ok(_) => {
                *head = Some(seq);
                debug!(stream = %key, seq, "appended stream entry");
                Ok(StreamOffset(seq))
            }
            Err(e) => {
                // Forget the cached head: another writer may own this sequence.
                *head = None;
                let msg = e.to_string();
                warn!(stream = %key, seq, error = %msg, "stream append failed");
                if msg.contains("already contains") {
                    return Err(StorageError::SequenceConflict {
                        stream: key.as_str().to_string(),
                        offset: seq,
                    });
                }
                Err(StorageError::Backend(msg))
            }
        }
    }

    async fn read_after(
        &self,
        key: &StreamKey,
        after: Option<StreamOffset>,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>> {
        self.ensure_open()?;

        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * FROM stream_entries WHERE stream = $stream AND seq > $after \
                 ORDER BY seq ASC LIMIT $limit",
            )
            .bind(("stream", key.as_str().to_string()))
            .bind(("after", after.map(|o| o.0).unwrap_or(0)))
            .bind(("limit", limit as u64))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<StreamEntryRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(Self::db_entry_to_entry).collect())
    }

    async fn read_last(&self, key: &StreamKey, limit: usize) -> StorageResult<Vec<StreamEntry>> {
        self.ensure_open()?;

        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM stream_entries WHERE stream = $stream ORDER BY seq DESC LIMIT $limit")
            .bind(("stream", key.as_str().to_string()))
            .bind(("limit", limit as u64))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<StreamEntryRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut entries: Vec<StreamEntry> = rows.into_iter().map(Self::db_entry_to_entry).collect();
        entries.reverse();
        Ok(entries)
    }

    async fn len(&self, key: &StreamKey) -> StorageResult<u64> {
        self.ensure_open()?;
        // Sequences are gapless, so the head doubles as the length.
        self.max_seq(key).await
    }

    async fn load_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
    ) -> StorageResult<Option<StreamOffset>> {
        self.ensure_open()?;

        let mut res = self
            .handle
            .db()
            .query(
                "SELECT consumer, stream, position FROM stream_cursors \
                 WHERE consumer = $consumer AND stream = $stream",
            )
            .bind(("consumer", consumer.to_string()))
            .bind(("stream", key.as_str().to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<CursorRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.first().map(|r| StreamOffset(r.position)))
    }

    async fn commit_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
        offset: StreamOffset,
    ) -> StorageResult<()> {
        self.ensure_open()?;

        let cursor_id = format!("{consumer}|{}", key.as_str());
        self.handle
            .db()
            .query(
                "UPSERT type::thing('stream_cursors', $cid) \
                 SET consumer = $consumer, stream = $stream, position = $position",
            )
            .bind(("cid", cursor_id))
            .bind(("consumer", consumer.to_string()))
            .bind(("stream", key.as_str().to_string()))
            .bind(("position", offset.0))
            .await
            .and_then(|r| r.check())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
