//! # Karya Sync Core
//!
//! Core primitives shared by every tier of the Karya sync engine.
//!
//! ## Overview
//!
//! Records move between the mobile client, the edge box and the central
//! server as batches of JSON rows grouped by table. This crate defines the
//! types those batches are made of and the wire codec that carries them.
//!
//! ## Key Types
//!
//! - [`Timestamp`] - UTC millisecond timestamp used as the sync watermark
//! - [`Record`] - A single row with an `id` and a `last_updated_at`
//! - [`ChangeBatch`] - `{ tableName, rows }`, the unit of transmission
//! - [`FileRecord`] - Typed view over a `karya_file` row
//! - [`Checksum`] - Algorithm-tagged, normalized hex digest
//!
//! ## Wire Format
//!
//! ```text
//! gzip( json( [ { "tableName": "task", "rows": [ {...}, ... ] }, ... ] ) )
//! ```
//!
//! ```rust
//! use karya_sync_core::{codec, ChangeBatch, Record, TableName, Timestamp};
//!
//! let row = Record::new("t-1", Timestamp::from_millis(1_000));
//! let batches = vec![ChangeBatch::new(TableName::TASK, vec![row])];
//!
//! let bytes = codec::encode(&batches).unwrap();
//! assert_eq!(codec::decode(&bytes).unwrap(), batches);
//! ```

pub mod checksum;
pub mod codec;
pub mod error;
pub mod file;
pub mod record;
pub mod types;

pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumHasher};
pub use codec::{decode, decode_with_limit, encode, MAX_DECODED_BYTES};
pub use error::{CodecError, CoreError};
pub use file::{FileRecord, FileSidecar};
pub use record::{AssignmentStatus, ChangeBatch, Record};
pub use types::{PeerId, TableName, Tier, Timestamp};
