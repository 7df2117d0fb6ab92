//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use karya_sync_core::{FileRecord, PeerId, Record, TableName, Timestamp};

use crate::error::{Result, StoreError};
use crate::traits::{Checkpoint, Direction, FileFilter, RecordScope, Store, SyncPeer};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Rows per table, keyed by id.
    records: HashMap<TableName, BTreeMap<String, Record>>,

    /// Watermarks keyed by (peer, table, direction).
    checkpoints: BTreeMap<(PeerId, TableName, Direction), Timestamp>,

    /// Registered peers.
    peers: BTreeMap<PeerId, SyncPeer>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_record(&self, table: &TableName, id: &str) -> Result<Option<Record>> {
        let inner = self.read()?;
        Ok(inner.records.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn put_record(&self, table: &TableName, record: &Record) -> Result<()> {
        let id = record.id()?.to_string();
        record.last_updated_at()?;

        let mut inner = self.write()?;
        inner
            .records
            .entry(table.clone())
            .or_default()
            .insert(id, record.clone());
        Ok(())
    }

    async fn records_since(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let inner = self.read()?;
        let Some(rows) = inner.records.get(table) else {
            return Ok(Vec::new());
        };

        let mut keyed: Vec<(Timestamp, &String, &Record)> = rows
            .iter()
            .filter(|(_, r)| scope.map_or(true, |s| s.matches(r)))
            .filter_map(|(id, r)| r.last_updated_at().ok().map(|ts| (ts, id, r)))
            .filter(|(ts, _, _)| *ts > since && *ts <= until)
            .collect();

        keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(keyed.into_iter().take(limit).map(|(_, _, r)| r.clone()).collect())
    }

    async fn records_at(
        &self,
        table: &TableName,
        scope: Option<&RecordScope>,
        at: Timestamp,
        after_id: &str,
    ) -> Result<Vec<Record>> {
        let inner = self.read()?;
        let Some(rows) = inner.records.get(table) else {
            return Ok(Vec::new());
        };

        // BTreeMap iteration is already ordered by id
        Ok(rows
            .iter()
            .filter(|(id, r)| id.as_str() > after_id && r.last_updated_at().ok() == Some(at))
            .filter(|(_, r)| scope.map_or(true, |s| s.matches(r)))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn count_records(&self, table: &TableName) -> Result<usize> {
        let inner = self.read()?;
        Ok(inner.records.get(table).map(BTreeMap::len).unwrap_or(0))
    }

    async fn get_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
    ) -> Result<Timestamp> {
        let inner = self.read()?;
        Ok(inner
            .checkpoints
            .get(&(peer.clone(), table.clone(), direction))
            .copied()
            .unwrap_or(Timestamp::EPOCH))
    }

    async fn advance_checkpoint(
        &self,
        peer: &PeerId,
        table: &TableName,
        direction: Direction,
        to: Timestamp,
    ) -> Result<Timestamp> {
        let mut inner = self.write()?;
        let slot = inner
            .checkpoints
            .entry((peer.clone(), table.clone(), direction))
            .or_insert(to);
        if to > *slot {
            *slot = to;
        }
        Ok(*slot)
    }

    async fn list_checkpoints(&self, peer: &PeerId) -> Result<Vec<Checkpoint>> {
        let inner = self.read()?;
        Ok(inner
            .checkpoints
            .iter()
            .filter(|((p, _, _), _)| p == peer)
            .map(|((p, table, direction), watermark)| Checkpoint {
                peer: p.clone(),
                table: table.clone(),
                direction: *direction,
                watermark: *watermark,
            })
            .collect())
    }

    async fn get_peer(&self, id: &PeerId) -> Result<Option<SyncPeer>> {
        let inner = self.read()?;
        Ok(inner.peers.get(id).cloned())
    }

    async fn upsert_peer(&self, peer: &SyncPeer) -> Result<()> {
        let mut inner = self.write()?;
        inner.peers.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<SyncPeer>> {
        let inner = self.read()?;
        Ok(inner.peers.values().cloned().collect())
    }

    async fn list_files(&self, filter: FileFilter) -> Result<Vec<FileRecord>> {
        let inner = self.read()?;
        let Some(rows) = inner.records.get(&TableName::KARYA_FILE) else {
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        for (id, record) in rows {
            match FileRecord::try_from(record) {
                Ok(file) if filter.matches(&file) => files.push(file),
                Ok(_) => {}
                Err(e) => tracing::warn!(file_id = %id, "skipping unreadable file row: {}", e),
            }
        }
        Ok(files)
    }
}
