//! A helper for retrying idempotent, fallible async operations with
//! exponential backoff and jitter.
//!
//! Per the "Retry with exponential backoff" design note: `delay =
//! min(initial * multiplier^attempt, max_delay)`, plus up to 1/3 jitter so
//! that concurrent retriers don't all wake up in lockstep. This helper is
//! only ever used for operations that are safe to re-run (gets, plain puts,
//! deletes) — the transaction log's compare-and-swap append loop has its
//! own bounded retry and must not be routed through here.

use std::{future::Future, ops::ControlFlow, time::Duration};

use observability_deps::tracing::{info, warn};
use rand::Rng;
use snafu::Snafu;

/// Tuning knobs for [`Backoff`]. Defaults follow the reference values used
/// throughout the codebase: a 100ms initial delay, doubling each attempt, up
/// to a 30s ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
    /// If set, `retry_with_backoff`/`retry_all_errors` give up once the
    /// cumulative wall-clock time spent retrying exceeds this and return
    /// [`BackoffError::DeadlineExceeded`]. `None` means retry forever.
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 2.0,
            deadline: None,
        }
    }
}

/// The error surfaced when a retry loop gives up.
#[derive(Debug, Snafu)]
pub enum BackoffError<E> {
    #[snafu(display("gave up retrying '{name}' after {elapsed:?}: {source}"))]
    DeadlineExceeded {
        name: String,
        elapsed: Duration,
        source: E,
    },
}

/// Drives one retry loop. Each call to `retry_with_backoff`/
/// `retry_all_errors` starts a fresh attempt counter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self { config: *config }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scale = self.config.base.powi(attempt as i32);
        let nominal = self.config.init_backoff.mul_f64(scale).min(self.config.max_backoff);
        let jitter_frac = rand::thread_rng().gen_range(0.0..=0.33);
        nominal.mul_f64(1.0 + jitter_frac).min(self.config.max_backoff)
    }

    /// Retry `f` until it returns [`ControlFlow::Break`], backing off
    /// between attempts that return [`ControlFlow::Continue`]. Useful when
    /// some errors are terminal (break immediately, possibly with an `Err`)
    /// and others are transient (keep going).
    pub async fn retry_with_backoff<T, E, F, Fut>(
        &self,
        name: &str,
        mut f: F,
    ) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControlFlow<T, E>>,
    {
        let start = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            match f().await {
                ControlFlow::Break(value) => return Ok(value),
                ControlFlow::Continue(err) => {
                    if let Some(deadline) = self.config.deadline {
                        if start.elapsed() > deadline {
                            return Err(BackoffError::DeadlineExceeded {
                                name: name.to_string(),
                                elapsed: start.elapsed(),
                                source: err,
                            });
                        }
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(name, attempt, ?delay, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Retry `f` until it returns `Ok`, treating every `Err` as transient.
    pub async fn retry_all_errors<T, E, F, Fut>(&self, name: &str, mut f: F) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_with_backoff(name, move || {
            let fut = f();
            async move {
                match fut.await {
                    Ok(v) => ControlFlow::Break(v),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
        .map(|v| {
            info!(name, "operation succeeded");
            v
        })
    }
}
