//! Schema definitions for the SurrealDB stream tables
//!
//! Tables:
//! - stream_entries: one row per appended entry, keyed by (stream, seq)
//! - stream_cursors: one row per (consumer, stream) read position

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Stream entry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntryRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Stream key
    pub stream: String,
    /// Append sequence within the stream (1-indexed)
    pub seq: u64,
    /// Entry payload (JSON)
    pub payload: serde_json::Value,
    /// Append timestamp
    #[serde(with = "surreal_datetime")]
    pub appended_at: DateTime<Utc>,
}

impl StreamEntryRecord {
    /// Create a new entry row stamped with the current time
    pub fn new(stream: String, seq: u64, payload: serde_json::Value) -> Self {
        StreamEntryRecord {
            id: None,
            stream,
            seq,
            payload,
            appended_at: Utc::now(),
        }
    }
}

/// Consumer cursor row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorRecord {
    /// Consumer name (agent id)
    pub consumer: String,
    /// Stream key
    pub stream: String,
    /// Last acknowledged sequence
    pub position: u64,
}

/// Projection used when only the newest sequence of a stream is needed
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SeqRow {
    pub seq: u64,
}
