//! Swarm Transport: durable streams for the swarm message bus
//!
//! This crate provides the persistence layer underneath the message bus.
//! It handles all I/O with the stream backend and exposes one abstraction,
//! [`StreamStore`], that the bus builds its global, thread and inbox
//! streams on.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append ordering, durable consumer cursors, replay.
//!
//! ## Key Components
//!
//! - `StreamStore`: append / read / cursor contract
//! - `MemoryStreamStore`: in-memory fake (tests, ephemeral runs)
//! - `SurrealStreamStore`: SurrealDB-backed durable implementation
//! - `SurrealHandle`: shared connection, one per coordinator process

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod stream_traits;
pub mod surreal_streams;

pub use error::{StateError, StorageError};
pub use fakes::MemoryStreamStore;
pub use handle::{AuthLevel, ConnectOptions, Credentials, SurrealHandle};
pub use schema::{CursorRecord, StreamEntryRecord};
pub use stream_traits::{
    StorageResult, StreamEntry, StreamKey, StreamOffset, StreamStore,
};
pub use surreal_streams::SurrealStreamStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
