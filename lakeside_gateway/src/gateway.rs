//! The ingestion gateway (spec §6.2): validates and stages records. The
//! core never inspects how the partition is derived — only that it lands
//! under `data/<partition>/`.

use std::sync::Arc;

use bytes::Bytes;
use lakeside_store::ObjectStore;
use lakeside_time::TimeProvider;
use lakeside_types::Record;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    schema::{SchemaError, SchemaStore},
    validator::{validate_record, ValidationError},
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("record {index} failed validation: {source}")]
    Validation { index: usize, source: ValidationError },

    #[error(transparent)]
    Store(#[from] lakeside_store::StoreError),

    #[error("batch must contain at least one record")]
    EmptyBatch,
}

/// Accepts validated records and stages them under `data/<partition>/`.
/// `partition_field` is the schema field whose name is folded into the
/// Hive-style partition key (`<field>=<YYYY-MM-DDTHH>`), derived from the
/// gateway's own wall clock rather than any value in the record.
pub struct IngestionGateway<S, T> {
    store: S,
    schema: Arc<SchemaStore<S, T>>,
    time_provider: T,
    partition_field: String,
}

impl<S: ObjectStore + Clone, T: TimeProvider + Clone> IngestionGateway<S, T> {
    pub fn new(store: S, schema: Arc<SchemaStore<S, T>>, time_provider: T, partition_field: impl Into<String>) -> Self {
        Self {
            store,
            schema,
            time_provider,
            partition_field: partition_field.into(),
        }
    }

    fn partition_key(&self) -> String {
        format!(
            "{}={}",
            self.partition_field,
            self.time_provider.now().format("%Y-%m-%dT%H")
        )
    }

    /// `PUT /`: stage a single JSON record at `data/<partition>/<uuid>.json`.
    pub async fn put_record(&self, record: Record) -> Result<String, GatewayError> {
        let schema = self.schema.get().await?;
        validate_record(&record, &schema).map_err(|source| GatewayError::Validation { index: 0, source })?;

        let key = format!("data/{}/{}.json", self.partition_key(), Uuid::new_v4());
        let bytes = Bytes::from(serde_json::to_vec(&record).expect("Record always serializes"));
        self.store.put(&key, bytes).await?;
        Ok(key)
    }

    /// `POST /batch`: stage a JSON array as one newline-delimited batch at
    /// `data/<partition>/<uuid>.ndjson`.
    pub async fn put_batch(&self, records: Vec<Record>) -> Result<String, GatewayError> {
        if records.is_empty() {
            return Err(GatewayError::EmptyBatch);
        }
        let schema = self.schema.get().await?;
        for (index, record) in records.iter().enumerate() {
            validate_record(record, &schema).map_err(|source| GatewayError::Validation { index, source })?;
        }

        let mut body = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut body, record).expect("Record always serializes");
            body.push(b'\n');
        }

        let key = format!("data/{}/{}.ndjson", self.partition_key(), Uuid::new_v4());
        self.store.put(&key, Bytes::from(body)).await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PrimitiveType, Repetition, SchemaDocument, SchemaField};
    use lakeside_store::BackedStore;
    use lakeside_time::MockProvider;
    use std::sync::Arc as StdArc;

    fn schema_doc() -> SchemaDocument {
        SchemaDocument {
            fields: vec![SchemaField {
                name: "value".to_string(),
                primitive_type: PrimitiveType::String,
                logical_type: None,
                repetition: Some(Repetition::Required),
            }],
        }
    }

    fn record(v: &str) -> Record {
        let mut m = serde_json::Map::new();
        m.insert("value".to_string(), serde_json::json!(v));
        m
    }

    async fn gateway() -> IngestionGateway<BackedStore, MockProvider> {
        let store = BackedStore::new(StdArc::new(object_store::memory::InMemory::new()));
        let time = MockProvider::new(chrono::Utc::now());
        let schema_store = Arc::new(SchemaStore::new(store.clone(), time.clone()));
        schema_store.put(schema_doc()).await.unwrap();
        IngestionGateway::new(store, schema_store, time, "order_ts_hour")
    }

    #[tokio::test]
    async fn put_record_stages_under_data_prefix() {
        let gateway = gateway().await;
        let key = gateway.put_record(record("a")).await.unwrap();
        assert!(key.starts_with("data/order_ts_hour="));
        assert!(key.ends_with(".json"));
    }

    #[tokio::test]
    async fn put_batch_rejects_empty_batch() {
        let gateway = gateway().await;
        assert!(matches!(gateway.put_batch(vec![]).await, Err(GatewayError::EmptyBatch)));
    }

    #[tokio::test]
    async fn put_batch_stages_ndjson() {
        let gateway = gateway().await;
        let key = gateway.put_batch(vec![record("a"), record("b")]).await.unwrap();
        assert!(key.ends_with(".ndjson"));
    }

    #[tokio::test]
    async fn put_record_rejects_invalid_record() {
        let gateway = gateway().await;
        let mut bad = serde_json::Map::new();
        bad.insert("value".to_string(), serde_json::json!(42));
        assert!(matches!(
            gateway.put_record(bad).await,
            Err(GatewayError::Validation { .. })
        ));
    }
}
