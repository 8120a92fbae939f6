//! The compaction service: partition grouping (C1), orchestration (C4), and
//! the runtime config shared by the binary that drives them over HTTP.

pub mod config;
pub mod orchestrator;
pub mod partition;

pub use config::CompactorConfig;
pub use orchestrator::{CleanupReport, CompactionOutcome, CompactionResult, Orchestrator, ReconcileReport};
pub use partition::group_by_partition;
