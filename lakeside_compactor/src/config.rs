//! Runtime configuration for the compaction service, following the
//! teacher's convention of `clap`-derived config structs with every
//! tunable settable by CLI flag or environment variable.

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct CompactorConfig {
    /// Address the HTTP service binds to.
    #[clap(long = "bind-address", env = "LAKESIDE_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,

    /// Directory backing the object store. Unset runs against an in-memory
    /// store, useful for local development and the test suite.
    #[clap(long = "data-dir", env = "LAKESIDE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of partitions encoded concurrently during one
    /// compaction.
    #[clap(long = "partition-concurrency", env = "LAKESIDE_PARTITION_CONCURRENCY", default_value_t = 8)]
    pub partition_concurrency: u32,

    /// How long a held compaction lock may sit idle before the next
    /// instance load recovers it automatically.
    #[clap(long = "stale-lock-ms", env = "LAKESIDE_STALE_LOCK_MS", default_value_t = 10 * 60 * 1000)]
    pub stale_lock_ms: i64,

    /// The Hive partition field name the gateway folds the ingest hour
    /// into (`<field>=<YYYY-MM-DDTHH>`).
    #[clap(long = "partition-field", env = "LAKESIDE_PARTITION_FIELD", default_value = "order_ts_hour")]
    pub partition_field: String,

    /// File extension written for compacted artifacts.
    #[clap(long = "artifact-extension", env = "LAKESIDE_ARTIFACT_EXTENSION", default_value = "parquet")]
    pub artifact_extension: String,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".parse().unwrap(),
            data_dir: None,
            partition_concurrency: 8,
            stale_lock_ms: 10 * 60 * 1000,
            partition_field: "order_ts_hour".to_string(),
            artifact_extension: "parquet".to_string(),
        }
    }
}
