//! An async semaphore that reports how many permits are held and how many
//! waiters are queued, so the orchestrator can log and meter concurrency
//! pressure rather than flying blind.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use metric::{Registry, U64Counter};
use tokio::sync::{Semaphore, SemaphorePermit};

/// A [`Semaphore`] wrapper that tracks acquired/pending permits as both
/// live counters (for `holders_acquired`/`holders_pending`) and cumulative
/// metrics (for external observability).
#[derive(Debug)]
pub struct InstrumentedAsyncSemaphore {
    semaphore: Semaphore,
    total_permits: u32,
    holders: AtomicU32,
    pending: AtomicU32,
    permits_acquired: AtomicU32,
    acquired_total: U64Counter,
}

impl InstrumentedAsyncSemaphore {
    pub fn new(total_permits: u32, registry: &Registry) -> Self {
        let acquired_total =
            registry.register_metric::<U64Counter>("semaphore_permits_acquired", "cumulative permits acquired");
        Self {
            semaphore: Semaphore::new(total_permits as usize),
            total_permits,
            holders: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            permits_acquired: AtomicU32::new(0),
            acquired_total: acquired_total.recorder(&[][..]),
        }
    }

    /// The semaphore's fixed capacity.
    pub fn total_permits(&self) -> u32 {
        self.total_permits
    }

    /// Number of callers currently holding at least one permit.
    pub fn holders_acquired(&self) -> u32 {
        self.holders.load(Ordering::Relaxed)
    }

    /// Number of callers blocked in [`Self::acquire_many`].
    pub fn holders_pending(&self) -> u32 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Total permits currently checked out, across all holders.
    pub fn permits_acquired(&self) -> u32 {
        self.permits_acquired.load(Ordering::Relaxed)
    }

    /// Total permits being waited on by not-yet-granted callers.
    pub fn permits_pending(&self) -> u32 {
        // Each pending holder is waiting for exactly the number of permits
        // it last requested; we don't track the per-waiter amount here, so
        // approximate with a lower bound of one per waiter. Callers use
        // this for logging pressure, not for exact accounting.
        self.pending.load(Ordering::Relaxed)
    }

    /// Acquire `n` permits, waiting indefinitely (a `None` timeout, matching
    /// the orchestrator's own retry-by-doubling loop which never wants the
    /// acquire itself to time out).
    pub async fn acquire_many(
        &self,
        n: u32,
        _timeout: Option<std::time::Duration>,
    ) -> Result<InstrumentedAsyncPermit<'_>, tokio::sync::AcquireError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let permit = self.semaphore.acquire_many(n).await;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        let permit = permit?;

        self.holders.fetch_add(1, Ordering::Relaxed);
        self.permits_acquired.fetch_add(n, Ordering::Relaxed);
        self.acquired_total.inc(n as u64);

        Ok(InstrumentedAsyncPermit {
            parent: self,
            n,
            _permit: permit,
        })
    }
}

/// RAII guard returned by [`InstrumentedAsyncSemaphore::acquire_many`].
/// Dropping it releases the permits and updates the holder/permit counts.
pub struct InstrumentedAsyncPermit<'a> {
    parent: &'a InstrumentedAsyncSemaphore,
    n: u32,
    _permit: SemaphorePermit<'a>,
}

impl Drop for InstrumentedAsyncPermit<'_> {
    fn drop(&mut self) {
        self.parent.holders.fetch_sub(1, Ordering::Relaxed);
        self.parent.permits_acquired.fetch_sub(self.n, Ordering::Relaxed);
    }
}

/// Convenience wrapper for sharing a semaphore between orchestrator tasks.
pub fn shared(total_permits: u32, registry: &Registry) -> Arc<InstrumentedAsyncSemaphore> {
    Arc::new(InstrumentedAsyncSemaphore::new(total_permits, registry))
}
