//! Typed view over `karya_file` rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checksum::{Checksum, ChecksumAlgorithm};
use crate::error::CoreError;
use crate::record::Record;
use crate::types::Timestamp;

/// Metadata for a binary attachment.
///
/// Presence flags are relative to the tier holding the record:
/// `present_locally` means the bytes are on this tier's disk and have been
/// verified against `checksum`; `present_remotely` means the peer holds them.
/// Any other columns of the row are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub container_name: String,
    pub name: String,
    pub checksum: String,
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub present_locally: bool,
    #[serde(default)]
    pub present_remotely: bool,
    pub last_updated_at: Timestamp,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileRecord {
    pub fn new(
        id: impl Into<String>,
        container_name: impl Into<String>,
        name: impl Into<String>,
        checksum: &Checksum,
        last_updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            container_name: container_name.into(),
            name: name.into(),
            checksum: checksum.as_hex().to_string(),
            algorithm: checksum.algorithm(),
            url: None,
            present_locally: false,
            present_remotely: false,
            last_updated_at,
            extra: Map::new(),
        }
    }

    /// The declared checksum, normalized.
    pub fn declared_checksum(&self) -> Result<Checksum, CoreError> {
        Checksum::parse(self.algorithm, &self.checksum)
    }

    pub fn sidecar(&self) -> FileSidecar {
        FileSidecar {
            id: self.id.clone(),
            container_name: self.container_name.clone(),
            name: self.name.clone(),
            checksum: self.checksum.clone(),
            algorithm: self.algorithm,
        }
    }

    pub fn to_record(&self) -> Result<Record, CoreError> {
        Record::from_value(serde_json::to_value(self)?)
    }
}

impl TryFrom<&Record> for FileRecord {
    type Error = CoreError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(Value::Object(record.as_map().clone()))?)
    }
}

impl TryFrom<Record> for FileRecord {
    type Error = CoreError;

    fn try_from(record: Record) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(record.into_value())?)
    }
}

/// Metadata sent alongside the bytes of an upload (the `data` part of the
/// multipart body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSidecar {
    pub id: String,
    pub container_name: String,
    pub name: String,
    pub checksum: String,
    pub algorithm: ChecksumAlgorithm,
}

impl FileSidecar {
    pub fn declared_checksum(&self) -> Result<Checksum, CoreError> {
        Checksum::parse(self.algorithm, &self.checksum)
    }
}
