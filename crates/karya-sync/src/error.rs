//! Error types for a sync node.

use karya_sync_engine::SyncError;
use karya_sync_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while setting up or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
