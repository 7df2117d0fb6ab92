//! Syncable records and change batches.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{TableName, Timestamp};

/// Field holding a row's primary identifier.
pub const ID_FIELD: &str = "id";
/// Field holding a row's watermark key.
pub const LAST_UPDATED_AT_FIELD: &str = "last_updated_at";

/// A single syncable row.
///
/// Rows are schemaless JSON objects. The sync engine only relies on two
/// fields: a string `id` and a `last_updated_at` timestamp. Everything else
/// is carried through untouched and interpreted by table handlers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create a record with just an id and a timestamp.
    pub fn new(id: impl Into<String>, last_updated_at: Timestamp) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.into(), Value::String(id.into()));
        map.insert(
            LAST_UPDATED_AT_FIELD.into(),
            Value::String(last_updated_at.to_rfc3339()),
        );
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build from an arbitrary JSON value; fails unless it is an object.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::InvalidField {
                field: "row",
                reason: format!("expected object, got {other}"),
            }),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The row's primary identifier.
    pub fn id(&self) -> Result<&str, CoreError> {
        match self.0.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => Ok(id),
            Some(_) => Err(CoreError::InvalidField {
                field: ID_FIELD,
                reason: "expected non-empty string".into(),
            }),
            None => Err(CoreError::MissingField(ID_FIELD)),
        }
    }

    /// The row's watermark key.
    pub fn last_updated_at(&self) -> Result<Timestamp, CoreError> {
        self.timestamp(LAST_UPDATED_AT_FIELD)?
            .ok_or(CoreError::MissingField(LAST_UPDATED_AT_FIELD))
    }

    pub fn set_last_updated_at(&mut self, ts: Timestamp) {
        self.set(LAST_UPDATED_AT_FIELD, Value::String(ts.to_rfc3339()));
    }

    /// Equal in every field except `last_updated_at`.
    pub fn same_content(&self, other: &Record) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .filter(|(k, _)| k.as_str() != LAST_UPDATED_AT_FIELD)
                .all(|(k, v)| other.0.get(k) == Some(v))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.0.get(field).and_then(Value::as_bool)
    }

    /// Read an optional timestamp field. `null` and absent both map to `None`.
    pub fn timestamp(&self, field: &'static str) -> Result<Option<Timestamp>, CoreError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| CoreError::InvalidField {
                    field,
                    reason: e.to_string(),
                }),
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Assignment status, if the row has one.
    pub fn status(&self) -> Result<Option<AssignmentStatus>, CoreError> {
        match self.get_str("status") {
            Some(s) => s.parse().map(Some),
            None => Ok(None),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A batch of rows for one table: the unit of transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(rename = "tableName")]
    pub table_name: TableName,
    pub rows: Vec<Record>,
}

impl ChangeBatch {
    pub fn new(table_name: TableName, rows: Vec<Record>) -> Self {
        Self { table_name, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Highest `last_updated_at` in the batch, ignoring rows without one.
    pub fn max_last_updated_at(&self) -> Option<Timestamp> {
        self.rows
            .iter()
            .filter_map(|r| r.last_updated_at().ok())
            .max()
    }
}

/// Lifecycle of a microtask (group) assignment.
///
/// The order of variants is the order in which an assignment progresses.
/// `Verified`, `Skipped` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Completed,
    Submitted,
    Verified,
    Skipped,
    Expired,
}

impl AssignmentStatus {
    /// Progress rank used to decide whether a transition moves backward.
    pub const fn rank(&self) -> u8 {
        match self {
            AssignmentStatus::Assigned => 0,
            AssignmentStatus::Completed => 1,
            AssignmentStatus::Submitted => 2,
            AssignmentStatus::Verified
            | AssignmentStatus::Skipped
            | AssignmentStatus::Expired => 3,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssignmentStatus::Verified | AssignmentStatus::Skipped | AssignmentStatus::Expired
        )
    }

    /// Whether moving from `self` to `next` would retrogress.
    pub fn regresses_to(&self, next: AssignmentStatus) -> bool {
        if self.is_terminal() {
            return *self != next;
        }
        next.rank() < self.rank()
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Submitted => "submitted",
            AssignmentStatus::Verified => "verified",
            AssignmentStatus::Skipped => "skipped",
            AssignmentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "completed" => Ok(AssignmentStatus::Completed),
            "submitted" => Ok(AssignmentStatus::Submitted),
            "verified" => Ok(AssignmentStatus::Verified),
            "skipped" => Ok(AssignmentStatus::Skipped),
            "expired" => Ok(AssignmentStatus::Expired),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}
