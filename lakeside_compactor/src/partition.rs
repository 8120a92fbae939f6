//! The partition grouper (C1): a pure function from a snapshot of staging
//! keys to a partition-ordered grouping. Cannot fail — malformed keys are
//! silently dropped rather than rejected, since they live outside the
//! staging namespace and must not be touched.

use indexmap::IndexMap;

/// Groups `keys` by their Hive partition segment, preserving each group's
/// input order. Keys not matching `^data/([^/]+)/` (or with an empty
/// partition segment) are dropped.
pub fn group_by_partition(keys: &[String]) -> IndexMap<String, Vec<String>> {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for key in keys {
        if let Some(partition) = partition_of(key) {
            groups.entry(partition).or_default().push(key.clone());
        }
    }
    groups
}

fn partition_of(key: &str) -> Option<String> {
    let rest = key.strip_prefix("data/")?;
    let (partition, remainder) = rest.split_once('/')?;
    if partition.is_empty() || remainder.is_empty() {
        return None;
    }
    Some(partition.to_string())
}
