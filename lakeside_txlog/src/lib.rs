//! The append-only transaction log (C2): `next_version`, `append`,
//! `read_all`, `replay`. The log's compare-and-swap append is a safety net
//! against coordinator bypass, not the primary exclusion mechanism — see
//! `lakeside_coordinator` for the coarse exclusion that makes CAS retries
//! rare in practice.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use lakeside_store::{ObjectStore, StoreError};
use lakeside_time::TimeProvider;
use lakeside_types::{FileAction, LakesideError, Operation, TransactionEntry};
use metric::{Registry, U64Counter};
use observability_deps::tracing::{debug, warn};
use thiserror::Error;

const LOG_PREFIX: &str = "_log/";

/// Bound on CAS-contention retries in [`TransactionLog::append`]. Spec §4.2
/// requires only "a small constant"; under the coordinator's coarse
/// exclusion this path almost never retries at all.
const MAX_APPEND_ATTEMPTS: u32 = 8;

#[derive(Debug, Error)]
pub enum TxLogError {
    #[error("log append contended past the retry budget ({attempts} attempts)")]
    LogContention { attempts: u32 },

    #[error("failed to decode log entry {key}: {source}")]
    Decode { key: String, source: serde_json::Error },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TxLogError> for LakesideError {
    fn from(err: TxLogError) -> Self {
        match err {
            TxLogError::LogContention { attempts } => LakesideError::LogContention { attempts },
            // Decode/store faults against `_log/` have no dedicated taxonomy
            // entry; fold them into `LogContention` after logging the real
            // cause, since both ultimately mean "the commit didn't happen".
            other => {
                warn!(error = %other, "transaction log operation failed");
                LakesideError::LogContention { attempts: 0 }
            }
        }
    }
}

/// The caller-supplied half of a [`TransactionEntry`]; `version` is
/// assigned by [`TransactionLog::append`].
#[derive(Debug, Clone)]
pub struct NewTransactionEntry {
    pub operation: Operation,
    pub add: Vec<FileAction>,
    pub remove: Vec<FileAction>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewTransactionEntry {
    pub fn compact(add: Vec<FileAction>, remove: Vec<FileAction>, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            operation: Operation::Compact,
            add,
            remove,
            metadata,
        }
    }
}

/// `read_all`'s result: the ordered entries actually present, plus any
/// version numbers missing from the dense `0..=max` sequence (spec §4.2,
/// §7 "Log gap detection").
#[derive(Debug, Clone, Default)]
pub struct ReadAllResult {
    pub entries: Vec<TransactionEntry>,
    pub missing_versions: Vec<u64>,
}

/// `replay`'s result: the derived live/removed sets after folding every
/// entry in version order.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    pub live_artifacts: BTreeSet<String>,
    pub removed_staging: BTreeSet<String>,
}

#[derive(Debug)]
struct LogMetrics {
    append_total: U64Counter,
    cas_retry_total: U64Counter,
}

/// The transaction log, backed by any [`ObjectStore`] implementor.
pub struct TransactionLog<S, T> {
    store: S,
    time_provider: T,
    metrics: LogMetrics,
}

impl<S: ObjectStore, T: TimeProvider> TransactionLog<S, T> {
    pub fn new(store: S, time_provider: T, registry: &Registry) -> Self {
        let append_total = registry
            .register_metric::<U64Counter>("lakeside_txlog_append_total", "committed transaction log entries")
            .recorder(&[][..]);
        let cas_retry_total = registry
            .register_metric::<U64Counter>("lakeside_txlog_cas_retry_total", "CAS collisions on log append")
            .recorder(&[][..]);
        Self {
            store,
            time_provider,
            metrics: LogMetrics {
                append_total,
                cas_retry_total,
            },
        }
    }

    /// Advisory only: never the source of exclusivity. [`Self::append`]
    /// recomputes this on every CAS retry rather than trusting a cached
    /// value.
    pub async fn next_version(&self) -> Result<u64, TxLogError> {
        let keys = self.store.list(LOG_PREFIX).await?;
        let max = keys.iter().filter_map(|k| parse_log_version(k)).max();
        Ok(max.map(|v| v + 1).unwrap_or(0))
    }

    /// Assigns a version, serializes the entry to canonical JSON, and
    /// writes it under a compare-and-swap precondition (the key must not
    /// already exist). Retries with a freshly recomputed version on CAS
    /// collision, up to [`MAX_APPEND_ATTEMPTS`].
    pub async fn append(&self, entry: NewTransactionEntry) -> Result<u64, TxLogError> {
        for attempt in 0..MAX_APPEND_ATTEMPTS {
            let version = self.next_version().await?;
            let full_entry = TransactionEntry {
                version,
                timestamp: self.time_provider.now(),
                operation: entry.operation,
                add: entry.add.clone(),
                remove: entry.remove.clone(),
                metadata: entry.metadata.clone(),
            };
            let bytes = Bytes::from(serde_json::to_vec(&full_entry).expect("TransactionEntry always serializes"));
            let key = TransactionEntry::log_key(version);

            debug!(version, attempt, "attempting log append");
            match self.store.put_if_absent(&key, bytes).await {
                Ok(()) => {
                    self.metrics.append_total.inc(1);
                    return Ok(version);
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    self.metrics.cas_retry_total.inc(1);
                    warn!(version, attempt, "log append CAS collision, retrying");
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(TxLogError::LogContention {
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    /// Lists and fetches every entry under `_log/`, sorted by version, and
    /// reports any gap in the dense `0..=max` sequence. A gap is
    /// operator-visible but must not prevent replay of the versions that
    /// do exist.
    pub async fn read_all(&self) -> Result<ReadAllResult, TxLogError> {
        let keys = self.store.list(LOG_PREFIX).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if parse_log_version(&key).is_none() {
                continue;
            }
            let bytes = self.store.get(&key).await?;
            let entry: TransactionEntry =
                serde_json::from_slice(&bytes).map_err(|source| TxLogError::Decode { key: key.clone(), source })?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.version);

        let missing_versions = match entries.last() {
            Some(last) => {
                let present: BTreeSet<u64> = entries.iter().map(|e| e.version).collect();
                (0..=last.version).filter(|v| !present.contains(v)).collect()
            }
            None => Vec::new(),
        };

        Ok(ReadAllResult {
            entries,
            missing_versions,
        })
    }

    /// Folds every entry in version order. `SchemaChange`/`Cleanup` entries
    /// carry empty `add`/`remove` lists today, so no special-casing by
    /// `operation` is needed for them to be tolerated correctly.
    pub async fn replay(&self) -> Result<ReplayResult, TxLogError> {
        let read = self.read_all().await?;
        let mut result = ReplayResult::default();
        for entry in read.entries {
            for added in entry.add {
                result.live_artifacts.insert(added.path);
            }
            for removed in entry.remove {
                result.removed_staging.insert(removed.path);
            }
        }
        Ok(result)
    }
}

fn parse_log_version(key: &str) -> Option<u64> {
    let name = key.strip_prefix(LOG_PREFIX)?;
    let digits = name.strip_suffix(".json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeside_store::BackedStore;
    use lakeside_time::MockProvider;
    use std::sync::Arc;

    fn log() -> TransactionLog<BackedStore, MockProvider> {
        let store = BackedStore::new(Arc::new(object_store::memory::InMemory::new()));
        let time = MockProvider::new(chrono::Utc::now());
        TransactionLog::new(store, time, &Registry::new())
    }

    #[tokio::test]
    async fn next_version_starts_at_zero() {
        let log = log();
        assert_eq!(log.next_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_assigns_dense_versions() {
        let log = log();
        let v0 = log
            .append(NewTransactionEntry::compact(vec![], vec![], BTreeMap::new()))
            .await
            .unwrap();
        let v1 = log
            .append(NewTransactionEntry::compact(vec![], vec![], BTreeMap::new()))
            .await
            .unwrap();
        assert_eq!(v0, 0);
        assert_eq!(v1, 1);
    }

    #[tokio::test]
    async fn read_all_sorts_and_reports_no_gaps_when_dense() {
        let log = log();
        for _ in 0..3 {
            log.append(NewTransactionEntry::compact(vec![], vec![], BTreeMap::new()))
                .await
                .unwrap();
        }
        let read = log.read_all().await.unwrap();
        assert_eq!(read.entries.iter().map(|e| e.version).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(read.missing_versions.is_empty());
    }

    #[tokio::test]
    async fn read_all_detects_gaps() {
        let log = log();
        // Simulate a hole by writing version 2 directly, skipping 0 and 1.
        let entry = TransactionEntry {
            version: 2,
            timestamp: chrono::Utc::now(),
            operation: Operation::Compact,
            add: vec![],
            remove: vec![],
            metadata: BTreeMap::new(),
        };
        log.store
            .put(
                &TransactionEntry::log_key(2),
                Bytes::from(serde_json::to_vec(&entry).unwrap()),
            )
            .await
            .unwrap();

        let read = log.read_all().await.unwrap();
        assert_eq!(read.missing_versions, vec![0, 1]);
    }

    #[tokio::test]
    async fn replay_folds_add_and_remove_across_entries() {
        let log = log();
        log.append(NewTransactionEntry::compact(
            vec![FileAction::add("parquet/p=a/part-1.parquet", 10, 1, "p=a")],
            vec![FileAction::remove("data/p=a/1.json")],
            BTreeMap::new(),
        ))
        .await
        .unwrap();

        let replay = log.replay().await.unwrap();
        assert!(replay.live_artifacts.contains("parquet/p=a/part-1.parquet"));
        assert!(replay.removed_staging.contains("data/p=a/1.json"));
    }

    #[tokio::test]
    async fn replay_tolerates_schema_change_and_cleanup_operations() {
        let log = log();
        let reserved = TransactionEntry {
            version: 0,
            timestamp: chrono::Utc::now(),
            operation: Operation::SchemaChange,
            add: vec![],
            remove: vec![],
            metadata: BTreeMap::new(),
        };
        log.store
            .put(
                &TransactionEntry::log_key(0),
                Bytes::from(serde_json::to_vec(&reserved).unwrap()),
            )
            .await
            .unwrap();

        let replay = log.replay().await.unwrap();
        assert!(replay.live_artifacts.is_empty());
        assert!(replay.removed_staging.is_empty());
    }

    #[test]
    fn parses_well_formed_log_keys_only() {
        assert_eq!(parse_log_version("_log/00000042.json"), Some(42));
        assert_eq!(parse_log_version("_log/not-a-number.json"), None);
        assert_eq!(parse_log_version("data/p=a/1.json"), None);
    }
}
