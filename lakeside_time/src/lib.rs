//! A small clock abstraction so that staleness checks (the coordinator's
//! `STALE_MS` guard) and artifact timestamps can be driven deterministically
//! in tests, instead of racing the wall clock.

use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Milliseconds since the Unix epoch. Matches spec.md's `epoch-ms` for
/// `Coordinator State.startedAt`.
pub type EpochMillis = i64;

pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// [`Self::now`] rendered as milliseconds since the epoch, for
    /// durable storage of `startedAt`.
    fn now_millis(&self) -> EpochMillis {
        self.now().timestamp_millis()
    }
}

/// The production [`TimeProvider`]: reads the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] whose value is set explicitly, for deterministic
/// tests of staleness/expiry logic (e.g. spec.md §8 scenario 4: "force-set
/// coordinator state `startedAt = now - 11min`").
#[derive(Debug, Clone)]
pub struct MockProvider {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl MockProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.write() = time;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Render an instant in the path-safe form spec.md §4.4 step 4 requires for
/// artifact keys: colons replaced, sub-second precision dropped.
/// `2025-11-23T19:30:45Z` -> `2025-11-23T19-30-45`.
pub fn path_safe_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mock_provider_is_controllable() {
        let start = Utc.with_ymd_and_hms(2025, 11, 23, 19, 30, 45).unwrap();
        let mock = MockProvider::new(start);
        assert_eq!(mock.now(), start);

        mock.advance(chrono::Duration::minutes(11));
        assert_eq!(mock.now(), start + chrono::Duration::minutes(11));
    }

    #[test]
    fn path_safe_timestamp_strips_colons_and_subseconds() {
        let t = Utc.with_ymd_and_hms(2025, 11, 23, 19, 30, 45).unwrap();
        assert_eq!(path_safe_timestamp(t), "2025-11-23T19-30-45");
    }
}
