//! Error types for Karya Sync Core.

use thiserror::Error;

/// Errors raised while interpreting records and their fields.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unknown checksum algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("unknown assignment status: {0}")]
    UnknownStatus(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the batch codec.
///
/// A `MalformedPayload` is always produced before any store is touched, so
/// a rejected payload never partially mutates local state.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}
