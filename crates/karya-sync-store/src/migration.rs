//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use karya_sync_core::Timestamp;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{} is newer than this build (v{})",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, Timestamp::now().as_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated sync schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Syncable rows of every table, stored as JSON
        CREATE TABLE records (
            table_name TEXT NOT NULL,
            id TEXT NOT NULL,
            last_updated_at INTEGER NOT NULL,  -- Unix ms, the watermark key
            data TEXT NOT NULL,                -- the full row as a JSON object
            PRIMARY KEY (table_name, id)
        );

        -- Per peer, per table, per direction watermarks
        CREATE TABLE checkpoints (
            peer_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            direction TEXT NOT NULL,           -- 'sent' | 'received'
            watermark INTEGER NOT NULL,        -- Unix ms
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (peer_id, table_name, direction)
        );

        -- Registered peers
        CREATE TABLE peers (
            peer_id TEXT PRIMARY KEY,
            tier TEXT NOT NULL,
            base_url TEXT NOT NULL,
            token TEXT,
            token_expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX idx_records_watermark ON records(table_name, last_updated_at, id);
        "#,
    )?;

    Ok(())
}
