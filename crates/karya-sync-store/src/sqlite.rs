//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend on every tier. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking. Rows are kept
//! as JSON text next to the two columns the engine queries on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use karya_sync_core::{FileRecord, PeerId, Record, TableName, Tier, Timestamp};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{Checkpoint, Direction, FileFilter, RecordScope, Store, SyncPeer};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn decode_record(data: &str) -> Result<Record> {
    Ok(serde_json::from_str(data)?)
}

/// Scope filter over the JSON row; a NULL path disables it.
fn scope_clause(path: usize, value: usize) -> String {
    format!(
        "(?{p} IS NULL OR json_extract(data, ?{p}) IS NULL OR json_extract(data, ?{p}) = ?{v})",
        p = path,
        v = value
    )
}

fn scope_params(scope: Option<&RecordScope>) -> (Option<String>, Option<String>) {
    match scope {
        Some(scope) => (Some(scope.json_path()), Some(scope.value.clone())),
        None => (None, None),
    }
}

fn decode_records(rows: Vec<String>) -> Result<Vec<Record>> {
    rows.iter().map(|data| decode_record(data)).collect()
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncPeer> {
    let id: String = row.get("peer_id")?;
    let tier: String = row.get("tier")?;
    let tier: Tier = tier.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let expires: Option<i64> = row.get("token_expires_at")?;

    Ok(SyncPeer {
        id: PeerId::new(id),
        tier,
        base_url: row.get("base_url")?,
        token: row.get("token")?,
        token_expires_at: expires.map(Timestamp::from_millis),
    })
}

fn file_filter_sql(filter: FileFilter) -> &'static str {
    match filter {
        FileFilter::All => "1",
        FileFilter::PendingUpload => {
            "COALESCE(json_extract(data, '$.present_locally'), 0) = 1
             AND COALESCE(json_extract(data, '$.present_remotely'), 0) = 0"
        }
        FileFilter::NeedsUrl => {
            "COALESCE(json_extract(data, '$.present_remotely'), 0) = 1
             AND COALESCE(json_extract(data, '$.present_locally'), 0) = 0
             AND json_extract(data, '$.url') IS NULL"
        }
        FileFilter::PendingDownload => {
            "json_extract(data, '$.url') IS NOT NULL
             AND COALESCE(json_extract(data, '$.present_locally'), 0) = 0"
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_record(&self, table: &TableName, id: &str) -> Result<Option<Record>> {
        let table = table.clone();
        let id = id.to_string();

        self.blocking(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM records WHERE table_name = ?1 AND id = ?2",
                    params![table.as_str(), id],
                    |row| row.get(0),
                )
                .optional()?;

            data.as_deref().map(decode_record).transpose()
        })
        .await
    }

    async fn put_record(&self, table: &TableName, record: &Record) -> Result<()> {
        let id = record.id()?.to_string();
        let last_updated_at = record.last_updated_at()?;
        let data = serde_json::to_string(record)?;
        let table = table.clone();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO records (table_name, id, last_updated_at, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(table_name, id) DO UPDATE SET
                    last_updated_at = excluded.last_updated_at,
                    data = excluded.data",
                params![table.as_str(), id, last_updated_at.as_millis(), data],
            )?;
            Ok(())
        })
        .await
    }

    async fn records_since(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let table = table.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let (path, value) = scope_params(scope);

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT data FROM records
                 WHERE table_name = ?1 AND last_updated_at > ?2 AND last_updated_at <= ?3
                   AND {}
                 ORDER BY last_updated_at, id
                 LIMIT ?4",
                scope_clause(5, 6)
            ))?;

            let rows = stmt
                .query_map(
                    params![table.as_str(), since.as_millis(), until.as_millis(), limit, path, value],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            decode_records(rows)
        })
        .await
    }

    async fn records_at(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        at: Timestamp,
        after_id: &str,
    ) -> Result<Vec<Record>> {
        let table = table.clone();
        let after_id = after_id.to_string();
        let (path, value) = scope_params(scope);

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT data FROM records
                 WHERE table_name = ?1 AND last_updated_at = ?2 AND id > ?3
                   AND {}
                 ORDER BY id",
                scope_clause(4, 5)
            ))?;

            let rows = stmt
                .query_map(
                    params![table.as_str(), at.as_millis(), after_id, path, value],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            decode_records(rows)
        })
        .await
    }

    async fn count_records(&self, table: &TableName) -> Result<usize> {
        let table = table.clone();

        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE table_name = ?1",
                params![table.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn get_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
    ) -> Result<Timestamp> {
        let peer = peer.clone();
        let table = table.clone();

        self.blocking(move |conn| {
            let watermark: Option<i64> = conn
                .query_row(
                    "SELECT watermark FROM checkpoints
                     WHERE peer_id = ?1 AND table_name = ?2 AND direction = ?3",
                    params![peer.as_str(), table.as_str(), direction.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(watermark.map(Timestamp::from_millis).unwrap_or(Timestamp::EPOCH))
        })
        .await
    }

    async fn advance_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
        to: Timestamp,
    ) -> Result<Timestamp> {
        let peer = peer.clone();
        let table = table.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO checkpoints (peer_id, table_name, direction, watermark, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(peer_id, table_name, direction) DO UPDATE SET
                    watermark = MAX(watermark, excluded.watermark),
                    updated_at = excluded.updated_at",
                params![
                    peer.as_str(),
                    table.as_str(),
                    direction.as_str(),
                    to.as_millis(),
                    Timestamp::now().as_millis(),
                ],
            )?;
            let stored: i64 = tx.query_row(
                "SELECT watermark FROM checkpoints
                 WHERE peer_id = ?1 AND table_name = ?2 AND direction = ?3",
                params![peer.as_str(), table.as_str(), direction.as_str()],
                |row| row.get(0),
            )?;
            tx.commit()?;

            Ok(Timestamp::from_millis(stored))
        })
        .await
    }

    async fn list_checkpoints(&self, peer: &PeerId) -> Result<Vec<Checkpoint>> {
        let peer = peer.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT table_name, direction, watermark FROM checkpoints
                 WHERE peer_id = ?1 ORDER BY table_name, direction",
            )?;

            let rows = stmt
                .query_map(params![peer.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(table, direction, watermark)| {
                    let direction = match direction.as_str() {
                        "sent" => Direction::Sent,
                        "received" => Direction::Received,
                        other => {
                            return Err(StoreError::InvalidData(format!(
                                "unknown checkpoint direction '{}'",
                                other
                            )))
                        }
                    };
                    Ok(Checkpoint {
                        peer: peer.clone(),
                        table: TableName::new(table),
                        direction,
                        watermark: Timestamp::from_millis(watermark),
                    })
                })
                .collect()
        })
        .await
    }

    async fn get_peer(&self, id: &PeerId) -> Result<Option<SyncPeer>> {
        let id = id.clone();

        self.blocking(move |conn| {
            conn.query_row(
                "SELECT peer_id, tier, base_url, token, token_expires_at
                 FROM peers WHERE peer_id = ?1",
                params![id.as_str()],
                row_to_peer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn upsert_peer(&self, peer: &SyncPeer) -> Result<()> {
        let peer = peer.clone();

        self.blocking(move |conn| {
            let now = Timestamp::now().as_millis();
            conn.execute(
                "INSERT INTO peers (peer_id, tier, base_url, token, token_expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(peer_id) DO UPDATE SET
                    tier = excluded.tier,
                    base_url = excluded.base_url,
                    token = excluded.token,
                    token_expires_at = excluded.token_expires_at,
                    updated_at = excluded.updated_at",
                params![
                    peer.id.as_str(),
                    peer.tier.as_str(),
                    peer.base_url,
                    peer.token,
                    peer.token_expires_at.map(|t| t.as_millis()),
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_peers(&self) -> Result<Vec<SyncPeer>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT peer_id, tier, base_url, token, token_expires_at
                 FROM peers ORDER BY peer_id",
            )?;
            let peers = stmt
                .query_map([], row_to_peer)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(peers)
        })
        .await
    }

    async fn list_files(&self, filter: FileFilter) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT id, data FROM records WHERE table_name = ?1 AND {} ORDER BY id",
            file_filter_sql(filter)
        );

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![TableName::KARYA_FILE.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut files = Vec::with_capacity(rows.len());
            for (id, data) in rows {
                match decode_record(&data).and_then(|r| Ok(FileRecord::try_from(r)?)) {
                    Ok(file) => files.push(file),
                    Err(e) => tracing::warn!(file_id = %id, "skipping unreadable file row: {}", e),
                }
            }
            Ok(files)
        })
        .await
    }
}
