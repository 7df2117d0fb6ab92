//! Strong type definitions for Karya sync.
//!
//! Identifiers and timestamps are newtypes so that a table name can never be
//! passed where a peer id is expected, and watermarks always carry the same
//! precision.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// A UTC timestamp with millisecond precision.
///
/// Stored as Unix milliseconds. On the wire it is an RFC 3339 string with
/// exactly three fractional digits, e.g. `2021-04-01T10:00:00.000Z`.
/// Deserialization also accepts integer milliseconds.
///
/// All watermark comparisons are strict: a row is newer than a watermark
/// when `row.last_updated_at > watermark`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The initial watermark for a peer that has never synced.
    pub const EPOCH: Self = Self(0);

    /// Create from Unix milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Unix milliseconds.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Convert to a chrono UTC datetime.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.0)
    }

    /// Format as RFC 3339 with millisecond precision.
    pub fn to_rfc3339(&self) -> String {
        match self.to_datetime() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }

    /// Parse an RFC 3339 string. Sub-millisecond digits are truncated.
    pub fn parse_rfc3339(s: &str) -> Result<Self, CoreError> {
        DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| CoreError::InvalidTimestamp(format!("{s}: {e}")))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(ms) => Ok(Self(ms)),
            Err(_) => Self::parse_rfc3339(s),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an RFC 3339 string or integer milliseconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                Timestamp::parse_rfc3339(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
                Ok(Timestamp(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
                i64::try_from(v)
                    .map(Timestamp)
                    .map_err(|_| E::custom("timestamp out of range"))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

/// Identity of a sync peer (an edge box, the central server, or a worker
/// device as seen from the box).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 128-bit peer id, hex encoded.
    pub fn random() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a syncable table.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(Cow<'static, str>);

impl TableName {
    pub const WORKER: Self = Self::from_static("worker");
    pub const KARYA_FILE: Self = Self::from_static("karya_file");
    pub const TASK: Self = Self::from_static("task");
    pub const TASK_ASSIGNMENT: Self = Self::from_static("task_assignment");
    pub const MICROTASK_GROUP: Self = Self::from_static("microtask_group");
    pub const MICROTASK: Self = Self::from_static("microtask");
    pub const MICROTASK_GROUP_ASSIGNMENT: Self = Self::from_static("microtask_group_assignment");
    pub const MICROTASK_ASSIGNMENT: Self = Self::from_static("microtask_assignment");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableName({})", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A tier of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The central server.
    Central,
    /// An offline-capable edge box.
    Edge,
    /// A worker's mobile client.
    Client,
}

impl Tier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Central => "central",
            Tier::Edge => "edge",
            Tier::Client => "client",
        }
    }

    const fn level(&self) -> u8 {
        match self {
            Tier::Central => 2,
            Tier::Edge => 1,
            Tier::Client => 0,
        }
    }

    /// Whether `self` sits upstream of `other` (central above edge above client).
    pub const fn is_above(&self, other: Tier) -> bool {
        self.level() > other.level()
    }

    /// The tier whose nodes sync against nodes of this one.
    pub const fn below(&self) -> Option<Tier> {
        match self {
            Tier::Central => Some(Tier::Edge),
            Tier::Edge => Some(Tier::Client),
            Tier::Client => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "central" | "server" => Ok(Tier::Central),
            "edge" | "box" => Ok(Tier::Edge),
            "client" => Ok(Tier::Client),
            other => Err(CoreError::InvalidField {
                field: "tier",
                reason: format!("unknown tier '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_below() {
        assert_eq!(Tier::Central.below(), Some(Tier::Edge));
        assert_eq!(Tier::Edge.below(), Some(Tier::Client));
        assert_eq!(Tier::Client.below(), None);
        assert!(Tier::Central.is_above(Tier::Edge));
    }

    #[test]
    fn test_timestamp_rfc3339_roundtrip() {
        let ts = Timestamp::from_millis(1_617_271_200_123);
        let s = ts.to_rfc3339();
        assert_eq!(s, "2021-04-01T10:00:00.123Z");
        assert_eq!(Timestamp::parse_rfc3339(&s).unwrap(), ts);
    }

    #[test]
    fn test_timestamp_accepts_offsets_and_millis() {
        let a: Timestamp = "2021-04-01T15:30:00.123+05:30".parse().unwrap();
        let b: Timestamp = "1617271200123".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamp_serde_forms() {
        let ts: Timestamp = serde_json::from_str("\"1970-01-01T00:00:01.000Z\"").unwrap();
        assert_eq!(ts.as_millis(), 1000);

        let ts: Timestamp = serde_json::from_str("2500").unwrap();
        assert_eq!(ts.as_millis(), 2500);

        assert_eq!(
            serde_json::to_string(&Timestamp::EPOCH).unwrap(),
            "\"1970-01-01T00:00:00.000Z\""
        );
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        assert!("yesterday".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_tier_aliases() {
        assert_eq!("box".parse::<Tier>().unwrap(), Tier::Edge);
        assert_eq!("Server".parse::<Tier>().unwrap(), Tier::Central);
        assert!("moon".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_order() {
        assert!(Tier::Central.is_above(Tier::Edge));
        assert!(Tier::Edge.is_above(Tier::Client));
        assert!(!Tier::Edge.is_above(Tier::Edge));
        assert!(!Tier::Client.is_above(Tier::Central));
    }

    #[test]
    fn test_random_peer_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
        assert_eq!(PeerId::random().as_str().len(), 32);
    }
}
