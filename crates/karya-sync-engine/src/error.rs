//! Error types for the sync engine.

use thiserror::Error;

use karya_sync_core::{CodecError, CoreError};
use karya_sync_store::StoreError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer could not be reached.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// A request did not complete within the configured timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A payload could not be decoded. Raised before any store access.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A payload could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Bytes did not hash to the declared checksum.
    #[error("checksum mismatch for file {file_id}: declared {declared}, computed {computed}")]
    ChecksumMismatch {
        file_id: String,
        declared: String,
        computed: String,
    },

    /// The peer answered with a non-success status.
    #[error("rejected by peer ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The peer refused our credential.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A batch named a table missing from the registry.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A file name would escape the storage root.
    #[error("invalid file path: {0}")]
    InvalidPath(String),

    /// A record or one of its fields is malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] CoreError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the failure came from the network rather than from data.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_) | SyncError::Timeout(_))
    }
}

impl From<CodecError> for SyncError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MalformedPayload(msg) => SyncError::MalformedPayload(msg),
            CodecError::Encoding(msg) => SyncError::Encoding(msg),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
