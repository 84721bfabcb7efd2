//! SurrealDB schema migrations and initialization
//!
//! Sets up the stream tables with the uniqueness constraints the ordering
//! guarantees rely on. Safe to call multiple times (idempotent).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all stream tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing swarm stream schema");

    init_stream_entries_table(db).await?;
    init_stream_cursors_table(db).await?;

    info!("Swarm stream schema initialization complete");
    Ok(())
}

/// Initialize `stream_entries` table
///
/// Schema:
/// ```text
/// TABLE stream_entries {
///   stream:       STRING
///   seq:          INT (1-indexed, gapless within a stream)
///   payload:      OBJECT
///   appended_at:  DATETIME
/// }
/// ```
///
/// Constraints:
/// - `(stream, seq)` is unique; a second writer claiming the same sequence
///   is rejected instead of silently reordering the stream
/// - entries are immutable (no update/delete permissions)
async fn init_stream_entries_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing stream_entries table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS stream_entries AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_stream_seq ON TABLE stream_entries COLUMNS stream, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_stream ON TABLE stream_entries COLUMNS stream;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("stream_entries table initialized");
    Ok(())
}

/// Initialize `stream_cursors` table
///
/// Schema:
/// ```text
/// TABLE stream_cursors {
///   consumer:  STRING
///   stream:    STRING
///   position:  INT
/// }
/// ```
async fn init_stream_cursors_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing stream_cursors table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS stream_cursors AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_consumer_stream ON TABLE stream_cursors COLUMNS consumer, stream UNIQUE;
    "#;

    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("stream_cursors table initialized");
    Ok(())
}
