//! An [`ObjectStore`] decorator that records per-operation latency and
//! byte-count metrics, so any backend (local disk, S3, GCS, ...) gets the
//! same observability for free by being wrapped once at startup.

use std::{fmt::Display, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use lakeside_time::TimeProvider;
use metric::{DurationHistogram, Registry, U64Counter};
use object_store::{
    path::Path, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult, Result,
};

#[derive(Debug, Clone)]
struct OpMetrics {
    calls: U64Counter,
    errors: U64Counter,
    bytes: U64Counter,
    duration: DurationHistogram,
}

impl OpMetrics {
    fn new(registry: &Registry, op: &'static str) -> Self {
        let calls = registry
            .register_metric::<U64Counter>("object_store_op_calls", "number of object store operations")
            .recorder(&[("op", op)][..]);
        let errors = registry
            .register_metric::<U64Counter>("object_store_op_errors", "number of failed object store operations")
            .recorder(&[("op", op)][..]);
        let bytes = registry
            .register_metric::<U64Counter>("object_store_op_bytes", "bytes transferred by object store operations")
            .recorder(&[("op", op)][..]);
        let duration = registry
            .register_metric::<DurationHistogram>("object_store_op_duration", "object store operation latency")
            .recorder(&[("op", op)][..]);
        Self {
            calls,
            errors,
            bytes,
            duration,
        }
    }
}

/// Wraps a real [`ObjectStore`] implementation, recording call count, error
/// count, byte volume and latency for every operation under `metric`'s
/// [`Registry`].
#[derive(Debug)]
pub struct MetricsStore<T: TimeProvider = lakeside_time::SystemProvider> {
    inner: Arc<dyn ObjectStore>,
    time_provider: T,
    put: OpMetrics,
    get: OpMetrics,
    delete: OpMetrics,
    list: OpMetrics,
}

impl MetricsStore<lakeside_time::SystemProvider> {
    pub fn new(inner: Arc<dyn ObjectStore>, registry: &Registry) -> Self {
        Self::new_with_time_provider(inner, registry, lakeside_time::SystemProvider::new())
    }
}

impl<T: TimeProvider> MetricsStore<T> {
    pub fn new_with_time_provider(inner: Arc<dyn ObjectStore>, registry: &Registry, time_provider: T) -> Self {
        Self {
            inner,
            time_provider,
            put: OpMetrics::new(registry, "put"),
            get: OpMetrics::new(registry, "get"),
            delete: OpMetrics::new(registry, "delete"),
            list: OpMetrics::new(registry, "list"),
        }
    }

    fn record<R>(&self, metric: &OpMetrics, started: std::time::Duration, bytes: u64, result: &Result<R>) {
        metric.calls.inc(1);
        metric.bytes.inc(bytes);
        metric.duration.record(started);
        if result.is_err() {
            metric.errors.inc(1);
        }
    }
}

impl<T: TimeProvider> Display for MetricsStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsStore({})", self.inner)
    }
}

#[async_trait]
impl<T: TimeProvider> ObjectStore for MetricsStore<T> {
    async fn put_opts(&self, location: &Path, payload: PutPayload, opts: PutOptions) -> Result<PutResult> {
        let len = payload.content_length() as u64;
        let start = self.time_provider.now();
        let result = self.inner.put_opts(location, payload, opts).await;
        let elapsed = (self.time_provider.now() - start).to_std().unwrap_or_default();
        self.record(&self.put, elapsed, len, &result);
        result
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        let start = self.time_provider.now();
        let result = self.inner.get_opts(location, options).await;
        let elapsed = (self.time_provider.now() - start).to_std().unwrap_or_default();
        let len = result.as_ref().map(|r| r.meta.size).unwrap_or(0) as u64;
        self.record(&self.get, elapsed, len, &result);
        result
    }

    async fn get_range(&self, location: &Path, range: Range<u64>) -> Result<Bytes> {
        let len = range.end.saturating_sub(range.start);
        let start = self.time_provider.now();
        let result = self.inner.get_range(location, range).await;
        let elapsed = (self.time_provider.now() - start).to_std().unwrap_or_default();
        self.record(&self.get, elapsed, len, &result);
        result
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta> {
        self.inner.head(location).await
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        let start = self.time_provider.now();
        let result = self.inner.delete(location).await;
        let elapsed = (self.time_provider.now() - start).to_std().unwrap_or_default();
        self.record(&self.delete, elapsed, 0, &result);
        result
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, Result<ObjectMeta>> {
        self.list.calls.inc(1);
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        let start = self.time_provider.now();
        let result = self.inner.list_with_delimiter(prefix).await;
        let elapsed = (self.time_provider.now() - start).to_std().unwrap_or_default();
        self.record(&self.list, elapsed, 0, &result);
        result
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
