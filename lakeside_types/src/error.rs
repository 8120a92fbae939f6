use thiserror::Error;

/// The core's error taxonomy (spec §7), one variant per table row. Each
/// carries the context an operator needs to act on it without reading logs.
#[derive(Debug, Error)]
pub enum LakesideError {
    #[error("schema unavailable: {reason}")]
    SchemaUnavailable { reason: String },

    #[error("coordinator busy: batch of {batch_size} keys started {age_ms}ms ago")]
    Busy { batch_size: usize, age_ms: i64 },

    #[error("failed to read staging object {key}: {reason}")]
    PartitionReadFailed { key: String, reason: String },

    #[error("encoder rejected partition {partition}: {reason}")]
    EncodeFailed { partition: String, reason: String },

    #[error("log append contended past retry budget ({attempts} attempts)")]
    LogContention { attempts: u32 },

    /// Post-commit: the transaction entry is durable, publish of one or more
    /// artifacts failed. Never surfaced as an HTTP failure — logged only.
    #[error("transaction {version} committed but publish of {path} failed: {reason}")]
    PublishDeferred {
        version: u64,
        path: String,
        reason: String,
    },

    /// Post-commit: entry durable, artifacts published, one or more staging
    /// deletes failed. Never surfaced as an HTTP failure — logged only.
    #[error("transaction {version} committed but reclaim of {path} failed: {reason}")]
    ReclaimDeferred {
        version: u64,
        path: String,
        reason: String,
    },
}

impl LakesideError {
    /// Whether this error represents work that already committed to the
    /// log. Per spec §7's propagation policy, these must never be surfaced
    /// as a failure response — only `error`/`warn`-logged.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, Self::PublishDeferred { .. } | Self::ReclaimDeferred { .. })
    }
}
