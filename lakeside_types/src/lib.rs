//! The data model shared by every Lakeside crate: the shapes that get
//! serialized to the object store (`TransactionEntry`, `FileAction`,
//! `CoordinatorState`) and the error taxonomy that every fallible operation
//! in the core eventually resolves to.

mod error;

pub use error::LakesideError;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Hive-style partition key, `<field>=<value>`, extracted from a staging
/// object's path. Opaque beyond string equality, per spec.
pub type PartitionKey = String;

/// `data/<partition>/<uuid>.<ext>` — a staging object awaiting compaction.
/// The key alone identifies it; content is read on demand during §4.4 step 4.
pub type StagingKey = String;

/// `parquet/<partition>/part-<ts>.<ext>` — a compacted artifact's key.
pub type ArtifactKey = String;

/// A single decoded record: a JSON object with string keys, the unit the
/// encoder and schema validator both operate on.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A log-embedded descriptor of one file becoming live (`add`) or no longer
/// live (`remove`). `size`/`row_count`/`partition` are populated for `add`
/// actions and absent for `remove` actions, matching the bit-exact log JSON
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAction {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "rowCount", skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionKey>,
}

impl FileAction {
    /// An `add` action describing a newly published artifact.
    pub fn add(path: impl Into<String>, size: u64, row_count: u64, partition: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: Some(size),
            row_count: Some(row_count),
            partition: Some(partition.into()),
        }
    }

    /// A `remove` action naming a staging key that is no longer live.
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            row_count: None,
            partition: None,
        }
    }
}

/// The kind of event a [`TransactionEntry`] records. `SchemaChange` and
/// `Cleanup` are reserved for future use (§9 open question): `read_all`
/// returns them unchanged and `replay`'s fold tolerates them because their
/// `add`/`remove` lists are simply empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Compact,
    SchemaChange,
    Cleanup,
}

/// `chrono::DateTime<Utc>`'s default `Serialize` impl renders `+00:00`
/// rather than the `Z`-suffixed, millisecond-precision form the log JSON
/// shape requires (`2025-11-23T19:30:45.000Z`), so the timestamp field uses
/// this module instead.
mod timestamp_rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// One immutable, numbered record of file-set changes. Persisted at
/// `_log/<version:08d>.json`. See spec §3 and §6 for the invariants and the
/// bit-exact JSON shape this type's `Serialize` impl must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub version: u64,
    #[serde(with = "timestamp_rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub add: Vec<FileAction>,
    pub remove: Vec<FileAction>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TransactionEntry {
    /// The `_log/<version:08d>.json` key this entry is persisted under.
    pub fn log_key(version: u64) -> String {
        format!("_log/{version:08}.json")
    }
}

/// The coordinator's durable state. `busy=false` implies `batch` and
/// `started_at` are both absent (spec §3 invariant).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<Vec<StagingKey>>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

impl CoordinatorState {
    pub const KEY: &'static str = "_coordinator/state.json";

    pub fn idle() -> Self {
        Self::default()
    }

    pub fn held(batch: Vec<StagingKey>, started_at: i64) -> Self {
        Self {
            busy: true,
            batch: Some(batch),
            started_at: Some(started_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_entry_serializes_to_the_bit_exact_shape() {
        let entry = TransactionEntry {
            version: 0,
            timestamp: Utc.with_ymd_and_hms(2025, 11, 23, 19, 30, 45).unwrap(),
            operation: Operation::Compact,
            add: vec![FileAction::add(
                "parquet/order_ts_hour=2025-11-23T19/part-2025-11-23T19-30-45.parquet",
                245000,
                1500,
                "order_ts_hour=2025-11-23T19",
            )],
            remove: vec![FileAction::remove("data/order_ts_hour=2025-11-23T19/abc.json")],
            metadata: BTreeMap::from([
                ("partitionCount".to_string(), serde_json::json!(1)),
                ("totalRows".to_string(), serde_json::json!(1500)),
            ]),
        };

        let value: serde_json::Value = serde_json::to_value(&entry).unwrap();
        let expected = serde_json::json!({
            "version": 0,
            "timestamp": "2025-11-23T19:30:45.000Z",
            "operation": "compact",
            "add": [{
                "path": "parquet/order_ts_hour=2025-11-23T19/part-2025-11-23T19-30-45.parquet",
                "size": 245000,
                "rowCount": 1500,
                "partition": "order_ts_hour=2025-11-23T19",
            }],
            "remove": [{"path": "data/order_ts_hour=2025-11-23T19/abc.json"}],
            "metadata": {"partitionCount": 1, "totalRows": 1500},
        });
        assert_eq!(value, expected);
    }

    #[test]
    fn coordinator_state_idle_has_no_batch_or_started_at() {
        let state = CoordinatorState::idle();
        assert!(!state.busy);
        assert!(state.batch.is_none());
        assert!(state.started_at.is_none());
    }

    #[test]
    fn log_key_is_zero_padded_to_eight_digits() {
        assert_eq!(TransactionEntry::log_key(0), "_log/00000000.json");
        assert_eq!(TransactionEntry::log_key(42), "_log/00000042.json");
    }
}
