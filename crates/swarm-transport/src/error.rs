//! Error types for swarm-transport

use thiserror::Error;

/// Errors that can occur while connecting to or preparing the backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors produced by [`crate::StreamStore`] operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store was closed; no further reads or writes are accepted
    #[error("stream store is closed")]
    Closed,

    /// Stream key failed validation
    #[error("invalid stream key: {key:?}")]
    InvalidStreamKey { key: String },

    /// Another writer already claimed this sequence number
    #[error("sequence conflict on stream {stream} at offset {offset}")]
    SequenceConflict { stream: String, offset: u64 },

    /// Payload could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend-specific failure (query error, lost connection, ...)
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
