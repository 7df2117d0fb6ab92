//! Store trait: the abstract interface for sync persistence.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use karya_sync_core::{FileRecord, PeerId, Record, TableName, Tier, Timestamp};

use crate::error::Result;

/// Which of a peer's two watermarks for a table is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `last_sent_at`: newest local change the peer has accepted.
    Sent,
    /// `last_received_at`: newest remote change durably applied here.
    Received,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub peer: PeerId,
    pub table: TableName,
    pub direction: Direction,
    pub watermark: Timestamp,
}

/// A registered remote peer.
///
/// Watermarks are not part of this struct; they live in the checkpoint
/// table keyed by `(peer, table, direction)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPeer {
    pub id: PeerId,
    pub tier: Tier,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<Timestamp>,
}

impl SyncPeer {
    pub fn new(id: PeerId, tier: Tier, base_url: impl Into<String>) -> Self {
        Self {
            id,
            tier,
            base_url: base_url.into(),
            token: None,
            token_expires_at: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Debug for SyncPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPeer")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}

/// Presence-flag queries over `karya_file` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFilter {
    All,
    /// Held here but not yet by the peer.
    PendingUpload,
    /// Held by the peer only, with no download URL yet.
    NeedsUrl,
    /// Has a download URL and is not yet held here.
    PendingDownload,
}

impl FileFilter {
    pub fn matches(&self, file: &FileRecord) -> bool {
        match self {
            FileFilter::All => true,
            FileFilter::PendingUpload => file.present_locally && !file.present_remotely,
            FileFilter::NeedsUrl => {
                file.present_remotely && !file.present_locally && file.url.is_none()
            }
            FileFilter::PendingDownload => file.url.is_some() && !file.present_locally,
        }
    }
}

/// Restricts a scan to the rows one peer may see.
///
/// A row is in scope when `column` is missing or null, or holds `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordScope {
    pub column: String,
    pub value: String,
}

impl RecordScope {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match record.get(&self.column) {
            None | Some(Value::Null) => true,
            Some(Value::String(v)) => *v == self.value,
            Some(_) => false,
        }
    }

    /// JSON path of the column, as SQLite's `json_extract` expects it.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.column)
    }
}

/// The Store trait: async interface for sync persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a row by primary id.
    async fn get_record(&self, table: &TableName, id: &str) -> Result<Option<Record>>;

    /// Insert or replace a row.
    ///
    /// Fails with `InvalidRecord` if the row has no `id` or no valid
    /// `last_updated_at`.
    async fn put_record(&self, table: &TableName, record: &Record) -> Result<()>;

    /// Rows with `since < last_updated_at <= until`, ordered by
    /// `(last_updated_at, id)`, at most `limit` of them.
    ///
    /// With a scope, rows outside it are skipped before the limit applies.
    async fn records_since(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Rows with `last_updated_at == at` and `id > after_id`, ordered by id.
    async fn records_at(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        at: Timestamp,
        after_id: &str,
    ) -> Result<Vec<Record>>;

    /// Number of rows in a table.
    async fn count_records(&self, table: &TableName) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// The stored watermark, or [`Timestamp::EPOCH`] if none.
    async fn get_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
    ) -> Result<Timestamp>;

    /// Raise a watermark to `to`. Never lowers it.
    ///
    /// Returns the watermark now stored.
    async fn advance_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
        to: Timestamp,
    ) -> Result<Timestamp>;

    /// All watermarks stored for a peer.
    async fn list_checkpoints(&self, peer: &PeerId) -> Result<Vec<Checkpoint>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Peer Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_peer(&self, id: &PeerId) -> Result<Option<SyncPeer>>;

    async fn upsert_peer(&self, peer: &SyncPeer) -> Result<()>;

    async fn list_peers(&self) -> Result<Vec<SyncPeer>>;

    // ─────────────────────────────────────────────────────────────────────────
    // File Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// `karya_file` rows matching a presence filter, ordered by id.
    ///
    /// Rows that do not parse as a [`FileRecord`] are skipped.
    async fn list_files(&self, filter: FileFilter) -> Result<Vec<FileRecord>>;

    async fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        match self.get_record(&TableName::KARYA_FILE, id).await? {
            Some(record) => Ok(Some(FileRecord::try_from(record)?)),
            None => Ok(None),
        }
    }

    async fn put_file(&self, file: &FileRecord) -> Result<()> {
        let record = file.to_record()?;
        self.put_record(&TableName::KARYA_FILE, &record).await
    }
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Watermarks for several tables at once, in the order given.
    fn watermarks(
        &self,
        peer: &PeerId,
        tables: &[TableName],
        direction: Direction,
    ) -> impl std::future::Future<Output = Result<Vec<(TableName, Timestamp)>>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn watermarks(
        &self,
        peer: &PeerId,
        tables: &[TableName],
        direction: Direction,
    ) -> Result<Vec<(TableName, Timestamp)>> {
        let mut out = Vec::with_capacity(tables.len());
        for table in tables {
            let watermark = self.get_checkpoint(peer, table, direction).await?;
            out.push((table.clone(), watermark));
        }
        Ok(out)
    }
}
