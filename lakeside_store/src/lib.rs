//! The object-store capability the core depends on (spec §6): `get`,
//! `put`, `put_if_absent`, `delete`, `list`, each wrapping a real
//! `object_store::ObjectStore` backend. Idempotent operations get
//! `backoff`-wrapped retry; `put_if_absent` does not, because a CAS
//! rejection is a meaningful outcome, not a transient fault, and the
//! bounded retry loop around it belongs to the caller (`lakeside_txlog`).

use std::sync::Arc;

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use bytes::Bytes;
use futures::StreamExt;
use object_store::{path::Path, PutMode, PutOptions, PutPayload};
use observability_deps::tracing::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Returned by [`ObjectStore::put_if_absent`] when the key already
    /// exists. Not a [`StoreError`] to retry on, since the whole point of
    /// the call was to observe whether the key was free.
    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("object store operation on {key} failed: {source}")]
    Backend {
        key: String,
        source: object_store::Error,
    },
}

/// The object-store capability required by spec §6: conditional-create on
/// non-existence, plain get/put/delete/list, each over keys in one of the
/// core's four namespaces (`schema/`, `data/`, `parquet/`, `_log/`).
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Like [`Self::get`], but also returns the backend's `ETag` for the
    /// object read, when the backend reports one. Lets a caller (the schema
    /// cache) tell "still the value I have cached" apart from "changed,
    /// must re-parse" without comparing full bodies.
    async fn get_with_etag(&self, key: &str) -> Result<(Bytes, Option<String>), StoreError>;

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;
    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// The production [`ObjectStore`], backed by a real `object_store` crate
/// implementation (local disk, S3, GCS, in-memory, ...).
#[derive(Debug, Clone)]
pub struct BackedStore {
    inner: Arc<dyn object_store::ObjectStore>,
    retry: BackoffConfig,
}

impl BackedStore {
    pub fn new(inner: Arc<dyn object_store::ObjectStore>) -> Self {
        Self {
            inner,
            retry: BackoffConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    fn classify_get(key: &str, err: object_store::Error) -> StoreError {
        match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound { key: key.to_string() },
            source => StoreError::Backend {
                key: key.to_string(),
                source,
            },
        }
    }
}

#[async_trait]
impl ObjectStore for BackedStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.get_with_etag(key).await.map(|(bytes, _etag)| bytes)
    }

    async fn get_with_etag(&self, key: &str) -> Result<(Bytes, Option<String>), StoreError> {
        let path = Path::from(key);
        retry_terminal_on_not_found(&self.retry, &format!("get {key}"), || async {
            match self.inner.get(&path).await {
                Ok(result) => {
                    let etag = result.meta.e_tag.clone();
                    TermResult::Terminal(
                        result
                            .bytes()
                            .await
                            .map(|bytes| (bytes, etag))
                            .map_err(|source| StoreError::Backend {
                                key: key.to_string(),
                                source,
                            }),
                    )
                }
                Err(object_store::Error::NotFound { .. }) => {
                    TermResult::Terminal(Err(StoreError::NotFound { key: key.to_string() }))
                }
                Err(source) => TermResult::Transient(StoreError::Backend {
                    key: key.to_string(),
                    source,
                }),
            }
        })
        .await
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = Path::from(key);
        retry_terminal_on_not_found(&self.retry, &format!("put {key}"), || async {
            match self.inner.put(&path, PutPayload::from_bytes(bytes.clone())).await {
                Ok(_) => TermResult::Terminal(Ok(())),
                Err(source) => TermResult::Transient(StoreError::Backend {
                    key: key.to_string(),
                    source,
                }),
            }
        })
        .await
    }

    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = Path::from(key);
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        debug!(key, "attempting conditional create");
        match self.inner.put_opts(&path, PutPayload::from_bytes(bytes), opts).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(StoreError::AlreadyExists { key: key.to_string() })
            }
            Err(source) => Err(StoreError::Backend {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = Path::from(key);
        retry_terminal_on_not_found(&self.retry, &format!("delete {key}"), || async {
            match self.inner.delete(&path).await {
                Ok(()) => TermResult::Terminal(Ok(())),
                Err(source) => TermResult::Transient(StoreError::Backend {
                    key: key.to_string(),
                    source,
                }),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = Path::from(prefix);
        retry_terminal_on_not_found(&self.retry, &format!("list {prefix}"), || async {
            let mut stream = self.inner.list(Some(&path));
            let mut keys = Vec::new();
            loop {
                match stream.next().await {
                    Some(Ok(meta)) => keys.push(meta.location.to_string()),
                    Some(Err(source)) => {
                        return TermResult::Transient(StoreError::Backend {
                            key: prefix.to_string(),
                            source,
                        })
                    }
                    None => return TermResult::Terminal(Ok(keys)),
                }
            }
        })
        .await
    }
}

/// The outcome of one attempt inside [`retry_terminal_on_not_found`]: either
/// a final result (success or a non-retryable error like `NotFound`) or a
/// backend fault worth retrying.
enum TermResult<T> {
    Terminal(Result<T, StoreError>),
    Transient(StoreError),
}

/// Retry `f` on backend faults, but stop immediately once it reports a
/// terminal outcome (the `Backoff` API models this with
/// `ControlFlow::Break`/`Continue`; terminal successes *and* terminal
/// errors both count as "break").
async fn retry_terminal_on_not_found<T, F, Fut>(config: &BackoffConfig, name: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TermResult<T>>,
{
    Backoff::new(config)
        .retry_with_backoff(name, move || {
            let fut = f();
            async move {
                match fut.await {
                    TermResult::Terminal(result) => std::ops::ControlFlow::Break(result),
                    TermResult::Transient(err) => std::ops::ControlFlow::Continue(err),
                }
            }
        })
        .await
        .unwrap_or_else(|e| match e {
            backoff::BackoffError::DeadlineExceeded { source, .. } => Err(source),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> BackedStore {
        BackedStore::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = store();
        store.put("data/p=a/1.json", Bytes::from_static(b"{}")).await.unwrap();
        let got = store.get("data/p=a/1.json").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn get_with_etag_reports_the_backend_etag() {
        let store = store();
        store.put("schema/schema.json", Bytes::from_static(b"{}")).await.unwrap();
        let (bytes, etag) = store.get_with_etag("schema/schema.json").await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"{}"));
        assert!(etag.is_some(), "in-memory object_store backend reports an e_tag per write");
    }

    #[tokio::test]
    async fn get_of_missing_key_is_not_found() {
        let store = store();
        let err = store.get("data/p=a/missing.json").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_if_absent_rejects_existing_key() {
        let store = store();
        store.put_if_absent("_log/00000000.json", Bytes::from_static(b"{}")).await.unwrap();
        let err = store
            .put_if_absent("_log/00000000.json", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_returns_keys_under_prefix() {
        let store = store();
        store.put("data/p=a/1.json", Bytes::from_static(b"{}")).await.unwrap();
        store.put("data/p=b/2.json", Bytes::from_static(b"{}")).await.unwrap();
        store.put("schema/schema.json", Bytes::from_static(b"{}")).await.unwrap();

        let mut keys = store.list("data/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["data/p=a/1.json", "data/p=b/2.json"]);
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let store = store();
        store.put("data/p=a/1.json", Bytes::from_static(b"{}")).await.unwrap();
        store.delete("data/p=a/1.json").await.unwrap();
        assert!(matches!(
            store.get("data/p=a/1.json").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }
}
