//! The compaction coordinator (C3): a singleton, durable mutex guarding the
//! compaction critical section. Serialization is by construction — a
//! single actor task owns the state and drains a request channel, so no two
//! operations on the same instance ever run concurrently, following the
//! teacher's worker-loop idiom rather than a mutex held across `.await`.

use bytes::Bytes;
use lakeside_store::ObjectStore;
use lakeside_time::TimeProvider;
use lakeside_types::CoordinatorState;
use observability_deps::tracing::{info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Reference value from spec §4.3: a held lock older than this is presumed
/// abandoned and recovered automatically on the next instance load.
pub const DEFAULT_STALE_MS: i64 = 10 * 60 * 1000;

const LOCK_NAME: &str = "global-compaction-lock";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator store operation failed: {0}")]
    Store(#[from] lakeside_store::StoreError),

    #[error("coordinator actor has shut down")]
    ActorGone,
}

/// The outcome of [`Coordinator::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Busy { batch_size: usize, age_ms: i64 },
}

/// The snapshot returned by [`Coordinator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub busy: bool,
    pub batch_size: Option<usize>,
    pub started_at: Option<i64>,
}

enum Command {
    TryAcquire {
        batch: Vec<String>,
        reply: oneshot::Sender<Result<AcquireOutcome, CoordinatorError>>,
    },
    Release {
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    ForceRelease {
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
}

/// A handle to the coordinator actor. Cheaply cloneable; every clone talks
/// to the same serialized instance.
#[derive(Debug, Clone)]
pub struct Coordinator {
    tx: mpsc::Sender<Command>,
}

impl Coordinator {
    /// Spawns the actor task, loading (and, if stale, recovering) durable
    /// state once before entering the request loop.
    pub fn spawn<S, T>(store: S, time_provider: T, stale_ms: i64) -> Self
    where
        S: ObjectStore,
        T: TimeProvider,
    {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_actor(store, time_provider, stale_ms, rx));
        Self { tx }
    }

    pub async fn try_acquire(&self, batch: Vec<String>) -> Result<AcquireOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::TryAcquire { batch, reply })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }

    pub async fn release(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Release { reply })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        rx.await.map_err(|_| CoordinatorError::ActorGone)
    }

    pub async fn force_release(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ForceRelease { reply })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }
}

async fn run_actor<S, T>(store: S, time_provider: T, stale_ms: i64, mut rx: mpsc::Receiver<Command>)
where
    S: ObjectStore,
    T: TimeProvider,
{
    let mut state = load_and_recover(&store, &time_provider, stale_ms).await;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::TryAcquire { batch, reply } => {
                let outcome = handle_try_acquire(&store, &time_provider, &mut state, batch).await;
                let _ = reply.send(outcome);
            }
            Command::Release { reply } => {
                let result = handle_release(&store, &mut state, false).await;
                let _ = reply.send(result);
            }
            Command::ForceRelease { reply } => {
                let result = handle_release(&store, &mut state, true).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(StatusSnapshot {
                    busy: state.busy,
                    batch_size: state.batch.as_ref().map(|b| b.len()),
                    started_at: state.started_at,
                });
            }
        }
    }
}

async fn load_and_recover<S: ObjectStore, T: TimeProvider>(
    store: &S,
    time_provider: &T,
    stale_ms: i64,
) -> CoordinatorState {
    let loaded = match store.get(CoordinatorState::KEY).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => CoordinatorState::idle(),
    };

    if loaded.busy {
        if let Some(started_at) = loaded.started_at {
            let age_ms = time_provider.now_millis() - started_at;
            if age_ms > stale_ms {
                warn!(lock = LOCK_NAME, age_ms, "recovering stale compaction lock on load");
                let idle = CoordinatorState::idle();
                persist(store, &idle).await;
                return idle;
            }
        }
    }
    loaded
}

async fn handle_try_acquire<S: ObjectStore, T: TimeProvider>(
    store: &S,
    time_provider: &T,
    state: &mut CoordinatorState,
    batch: Vec<String>,
) -> Result<AcquireOutcome, CoordinatorError> {
    if state.busy {
        let age_ms = state
            .started_at
            .map(|started| time_provider.now_millis() - started)
            .unwrap_or(0);
        return Ok(AcquireOutcome::Busy {
            batch_size: state.batch.as_ref().map(|b| b.len()).unwrap_or(0),
            age_ms,
        });
    }

    let started_at = time_provider.now_millis();
    let held = CoordinatorState::held(batch, started_at);
    persist_fallible(store, &held).await?;
    info!(lock = LOCK_NAME, "compaction lock acquired");
    *state = held;
    Ok(AcquireOutcome::Acquired)
}

async fn handle_release<S: ObjectStore>(
    store: &S,
    state: &mut CoordinatorState,
    forced: bool,
) -> Result<(), CoordinatorError> {
    if !state.busy {
        // Idempotent: a repeat release from IDLE is a no-op.
        return Ok(());
    }
    let idle = CoordinatorState::idle();
    persist_fallible(store, &idle).await?;
    if forced {
        warn!(lock = LOCK_NAME, "compaction lock force-released");
    } else {
        info!(lock = LOCK_NAME, "compaction lock released");
    }
    *state = idle;
    Ok(())
}

async fn persist<S: ObjectStore>(store: &S, state: &CoordinatorState) {
    if let Err(err) = persist_fallible(store, state).await {
        warn!(lock = LOCK_NAME, error = %err, "failed to persist coordinator state");
    }
}

async fn persist_fallible<S: ObjectStore>(store: &S, state: &CoordinatorState) -> Result<(), CoordinatorError> {
    let bytes = Bytes::from(serde_json::to_vec(state).expect("CoordinatorState always serializes"));
    store.put(CoordinatorState::KEY, bytes).await?;
    Ok(())
}
