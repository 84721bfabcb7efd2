//! In-memory fake for the stream store
//!
//! `MemoryStreamStore` satisfies the [`StreamStore`] contract without any
//! external dependency. Used by unit tests and by embedders that do not
//! need durability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::stream_traits::*;

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, Vec<StreamEntry>>,
    cursors: HashMap<(String, String), StreamOffset>,
}

/// In-memory stream store backed by a `HashMap<stream, Vec<entry>>`.
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(
        &self,
        key: &StreamKey,
        payload: serde_json::Value,
    ) -> StorageResult<StreamOffset> {
        let mut inner = self.open()?;
        let entries = inner.streams.entry(key.as_str().to_string()).or_default();
        let offset = StreamOffset(entries.len() as u64 + 1);
        entries.push(StreamEntry {
            offset,
            payload,
            appended_at: Utc::now(),
        });
        Ok(offset)
    }

    async fn read_after(
        &self,
        key: &StreamKey,
        after: Option<StreamOffset>,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>> {
        let inner = self.open()?;
        let Some(entries) = inner.streams.get(key.as_str()) else {
            return Ok(Vec::new());
        };
        // Offsets are 1-based and gapless, so the offset doubles as a slice index.
        let start = after.map(|o| o.0 as usize).unwrap_or(0).min(entries.len());
        Ok(entries[start..].iter().take(limit).cloned().collect())
    }

    async fn read_last(&self, key: &StreamKey, limit: usize) -> StorageResult<Vec<StreamEntry>> {
        let inner = self.open()?;
        let Some(entries) = inner.streams.get(key.as_str()) else {
            return Ok(Vec::new());
        };
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    async fn len(&self, key: &StreamKey) -> StorageResult<u64> {
        let inner = self.open()?;
        Ok(inner
            .streams
            .get(key.as_str())
            .map(|e| e.len() as u64)
            .unwrap_or(0))
    }

    async fn load_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
    ) -> StorageResult<Option<StreamOffset>> {
        let inner = self.open()?;
        Ok(inner
            .cursors
            .get(&(consumer.to_string(), key.as_str().to_string()))
            .copied())
    }

    async fn commit_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
        offset: StreamOffset,
    ) -> StorageResult<()> {
        let mut inner = self.open()?;
        inner
            .cursors
            .insert((consumer.to_string(), key.as_str().to_string()), offset);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
