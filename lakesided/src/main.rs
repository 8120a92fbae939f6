//! The Lakeside compaction daemon: wires the coordinator, transaction log,
//! schema store, and compaction orchestrator together behind the HTTP
//! surface from spec §6, plus the ingestion gateway's `PUT /`/`POST /batch`
//! for completeness.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use clap::Parser;
use hyper::{service::{make_service_fn, service_fn}, Body, Method, Request, Response, Server, StatusCode};
use lakeside_compactor::{config::CompactorConfig, orchestrator::Orchestrator};
use lakeside_coordinator::Coordinator;
use lakeside_gateway::{GatewayError, IngestionGateway, JsonLinesEncoder, SchemaStore};
use lakeside_store::BackedStore;
use lakeside_time::SystemProvider;
use lakeside_txlog::TransactionLog;
use lakeside_types::LakesideError;
use metric::Registry;
use object_store_metrics::MetricsStore;
use observability_deps::tracing::{error, info};

type Store = BackedStore;
type Time = SystemProvider;

struct AppState {
    orchestrator: Orchestrator<Store, Time>,
    gateway: IngestionGateway<Store, Time>,
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = CompactorConfig::parse();
    let bind_address = config.bind_address;

    let state = Arc::new(build_state(config));

    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&state), req))) }
    });

    info!(%bind_address, "lakesided starting");
    if let Err(err) = Server::bind(&bind_address).serve(make_svc).await {
        error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn build_state(config: CompactorConfig) -> AppState {
    let registry = Registry::new();
    let time_provider = SystemProvider::new();

    let backend: Arc<dyn object_store::ObjectStore> = match &config.data_dir {
        Some(dir) => Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(dir)
                .expect("data-dir must be a writable local directory"),
        ),
        None => Arc::new(object_store::memory::InMemory::new()),
    };
    let metered = MetricsStore::new(backend, &registry);
    let store = BackedStore::new(Arc::new(metered));

    let schema = Arc::new(SchemaStore::new(store.clone(), time_provider));
    let gateway = IngestionGateway::new(
        store.clone(),
        Arc::clone(&schema),
        time_provider,
        config.partition_field.clone(),
    );

    let txlog = TransactionLog::new(store.clone(), time_provider, &registry);
    let coordinator = Coordinator::spawn(store.clone(), time_provider, config.stale_lock_ms);
    let semaphore = tracker::shared(config.partition_concurrency.max(1), &registry);
    let encoder = Arc::new(JsonLinesEncoder);

    let orchestrator = Orchestrator::new(store, time_provider, txlog, coordinator, schema, encoder, semaphore, config);

    AppState { orchestrator, gateway }
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (&method, path.as_str()) {
        (&Method::POST, "/") => run_compaction(&state).await,
        (&Method::GET, "/") => coordinator_status(&state).await,
        (&Method::GET, "/transactions") => list_transactions(&state).await,
        (&Method::GET, "/reconcile") => reconcile(&state).await,
        (&Method::DELETE, "/cleanup") => cleanup(&state).await,
        (&Method::PUT, "/") => put_record(&state, req).await,
        (&Method::POST, "/batch") => put_batch(&state, req).await,
        _ => json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"})),
    };
    Ok(response)
}

async fn run_compaction(state: &AppState) -> Response<Body> {
    use lakeside_compactor::orchestrator::CompactionOutcome;

    match state.orchestrator.compact().await {
        Ok(CompactionOutcome::NoFilesToCompact) => {
            json_response(StatusCode::OK, &serde_json::json!({"message": "No files to compact"}))
        }
        Ok(CompactionOutcome::Compacted(result)) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "transactionVersion": result.transaction_version,
                "partitions": result.partitions,
                "filesCompacted": result.files_compacted,
                "totalRows": result.total_rows,
                "parquetFiles": result.parquet_files,
            }),
        ),
        Err(err) => lakeside_error_response(err),
    }
}

async fn coordinator_status(state: &AppState) -> Response<Body> {
    match state.orchestrator.coordinator_status().await {
        Ok(status) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "busy": status.busy,
                "batch": status.batch_size,
                "startedAt": status.started_at,
            }),
        ),
        Err(err) => json_response(StatusCode::INTERNAL_SERVER_ERROR, &serde_json::json!({"error": err.to_string()})),
    }
}

async fn list_transactions(state: &AppState) -> Response<Body> {
    match state.orchestrator.transactions().await {
        Ok(entries) => json_response(StatusCode::OK, &entries),
        Err(err) => lakeside_error_response(err),
    }
}

async fn reconcile(state: &AppState) -> Response<Body> {
    match state.orchestrator.reconcile().await {
        Ok(report) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "parquetFiles": report.parquet_files,
                "orphanedJsonFiles": report.orphaned_json_files,
                "orphanCount": report.orphan_count,
            }),
        ),
        Err(err) => lakeside_error_response(err),
    }
}

async fn cleanup(state: &AppState) -> Response<Body> {
    match state.orchestrator.cleanup().await {
        Ok(report) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "deletedCount": report.deleted_count,
                "deletedFiles": report.deleted_files,
            }),
        ),
        Err(err) => lakeside_error_response(err),
    }
}

async fn put_record(state: &AppState, req: Request<Body>) -> Response<Body> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let record: lakeside_types::Record = match serde_json::from_slice(&body) {
        Ok(record) => record,
        Err(err) => return json_response(StatusCode::BAD_REQUEST, &serde_json::json!({"error": err.to_string()})),
    };
    match state.gateway.put_record(record).await {
        Ok(key) => json_response(StatusCode::OK, &serde_json::json!({"key": key})),
        Err(err) => gateway_error_response(err),
    }
}

async fn put_batch(state: &AppState, req: Request<Body>) -> Response<Body> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let records: Vec<lakeside_types::Record> = match serde_json::from_slice(&body) {
        Ok(records) => records,
        Err(err) => return json_response(StatusCode::BAD_REQUEST, &serde_json::json!({"error": err.to_string()})),
    };
    match state.gateway.put_batch(records).await {
        Ok(key) => json_response(StatusCode::OK, &serde_json::json!({"key": key})),
        Err(err) => gateway_error_response(err),
    }
}

async fn read_body(req: Request<Body>) -> Result<Bytes, Response<Body>> {
    hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| json_response(StatusCode::BAD_REQUEST, &serde_json::json!({"error": err.to_string()})))
}

/// Maps a [`LakesideError`] surfaced by `compact()`/`reconcile()`/`cleanup()`
/// to a status code. Note `PublishDeferred`/`ReclaimDeferred` never reach
/// here: the orchestrator logs those post-commit faults itself and always
/// returns `Ok` from `compact()` regardless of them (spec §7's propagation
/// policy), so this only ever classifies pre-commit failures.
fn lakeside_error_response(err: LakesideError) -> Response<Body> {
    let status = match &err {
        LakesideError::Busy { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, &serde_json::json!({"error": err.to_string()}))
}

fn gateway_error_response(err: GatewayError) -> Response<Body> {
    let status = match &err {
        GatewayError::Validation { .. } | GatewayError::EmptyBatch => StatusCode::BAD_REQUEST,
        GatewayError::Schema(_) | GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(status, &serde_json::json!({"error": err.to_string()}))
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Body> {
    let bytes = serde_json::to_vec(body).expect("response body always serializes");
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .expect("response builder never fails for a well-formed body")
}
