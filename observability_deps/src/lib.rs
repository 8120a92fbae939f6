//! A crate that re-exports the tracing ecosystem used across Lakeside, so
//! every crate pulls in the same version rather than independently choosing
//! (and potentially mismatching) their own.
//!
//! Crates in this workspace should `use observability_deps::tracing::{...}`
//! rather than depending on `tracing` directly.

pub use tracing;
