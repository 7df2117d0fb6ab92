//! # Karya Sync Store
//!
//! Storage abstraction for the Karya sync engine. Provides a trait-based
//! interface for record, checkpoint and peer persistence with SQLite and
//! in-memory implementations.
//!
//! ## Overview
//!
//! The engine never talks to a database directly. Everything it needs, from
//! watermark-ordered record scans to per-peer checkpoints, goes through the
//! [`Store`] trait. The primary implementation is [`SqliteStore`], with
//! [`MemoryStore`] for tests.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`SyncPeer`] - A registered remote peer and its credential
//! - [`Direction`] - Which watermark of a peer/table pair is meant
//! - [`FileFilter`] - Presence-flag queries over `karya_file` rows
//! - [`RecordScope`] - Restricts a scan to the rows one peer may see
//!
//! ## Usage
//!
//! ```rust,no_run
//! use karya_sync_core::{PeerId, Record, TableName, Timestamp};
//! use karya_sync_store::{Direction, SqliteStore, Store};
//!
//! async fn example() -> karya_sync_store::Result<()> {
//!     let store = SqliteStore::open("box.db")?;
//!
//!     let row = Record::new("t-1", Timestamp::from_millis(1_000));
//!     store.put_record(&TableName::TASK, &row).await?;
//!
//!     let peer = PeerId::new("central");
//!     let since = store
//!         .get_checkpoint(&peer, &TableName::TASK, Direction::Sent)
//!         .await?;
//!     let rows = store
//!         .records_since(&TableName::TASK, None, since, Timestamp::now(), 500)
//!         .await?;
//!     assert_eq!(rows.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent upserts**: `put_record` replaces any row with the same id
//! - **Watermark order**: scans are ordered by `(last_updated_at, id)`
//! - **Monotonic checkpoints**: `advance_checkpoint` never moves a watermark back

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Checkpoint, Direction, FileFilter, RecordScope, Store, StoreExt, SyncPeer};
