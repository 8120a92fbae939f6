//! The schema manager: a single document at `schema/schema.json`, read
//! through a per-process cache (spec §9 "Global mutable state").

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lakeside_store::ObjectStore;
use lakeside_time::TimeProvider;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_KEY: &str = "schema/schema.json";

/// Default cache lifetime before a fresh read is forced.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// One field of the flat schema list (spec §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "primitiveType")]
    pub primitive_type: PrimitiveType,
    #[serde(rename = "logicalType", skip_serializing_if = "Option::is_none")]
    pub logical_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition: Option<Repetition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Boolean,
    Int64,
    Double,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repetition {
    Required,
    Optional,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub fields: Vec<SchemaField>,
}

impl SchemaDocument {
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema document missing or unreadable: {0}")]
    Unavailable(String),

    #[error("schema document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

struct Cached {
    document: Arc<SchemaDocument>,
    loaded_at: DateTime<Utc>,
    etag: Option<String>,
}

/// Reads and writes the schema document, maintaining an in-memory
/// `{etag, value, loadedAt}` cache refreshed on TTL expiry or when a fresh
/// read's `ETag` no longer matches the cached one. Racy concurrent refreshes
/// are tolerated — whichever read lands last simply wins, matching the
/// namespace-schema cache's incremental, never-evicting design.
pub struct SchemaStore<S, T> {
    store: S,
    time_provider: T,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl<S: ObjectStore, T: TimeProvider> SchemaStore<S, T> {
    pub fn new(store: S, time_provider: T) -> Self {
        Self::with_ttl(store, time_provider, DEFAULT_TTL)
    }

    pub fn with_ttl(store: S, time_provider: T, ttl: Duration) -> Self {
        Self {
            store,
            time_provider,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Returns the current schema, reading through to the store when the
    /// cache is empty or past its TTL. Fails fast with `SchemaError` if the
    /// document is absent or malformed — orchestrator step 1 maps this
    /// straight to `LakesideError::SchemaUnavailable` without touching the
    /// coordinator.
    ///
    /// On TTL expiry this still performs a read, but a matching `ETag`
    /// short-circuits re-parsing the body: the cached value is kept and only
    /// `loadedAt` is pushed forward, so the TTL amortizes re-parse cost
    /// rather than cache freshness.
    pub async fn get(&self) -> Result<Arc<SchemaDocument>, SchemaError> {
        if let Some(cached) = self.cache.read().as_ref() {
            let age = self.time_provider.now() - cached.loaded_at;
            if age.to_std().unwrap_or_default() < self.ttl {
                return Ok(Arc::clone(&cached.document));
            }
        }

        let (bytes, etag) = self
            .store
            .get_with_etag(SCHEMA_KEY)
            .await
            .map_err(|e| SchemaError::Unavailable(e.to_string()))?;

        let previous_etag = self.cache.read().as_ref().and_then(|c| c.etag.clone());
        if etag.is_some() && etag == previous_etag {
            let mut guard = self.cache.write();
            if let Some(cached) = guard.as_mut() {
                cached.loaded_at = self.time_provider.now();
                return Ok(Arc::clone(&cached.document));
            }
        }

        let document: SchemaDocument = serde_json::from_slice(&bytes)?;
        let document = Arc::new(document);

        *self.cache.write() = Some(Cached {
            document: Arc::clone(&document),
            loaded_at: self.time_provider.now(),
            etag,
        });
        Ok(document)
    }

    /// Writes a new schema document and refreshes the cache immediately
    /// (plain overwrite — schema evolution across mixed file versions is a
    /// declared non-goal, so no merge/compat logic applies here).
    pub async fn put(&self, document: SchemaDocument) -> Result<(), SchemaError> {
        let bytes = serde_json::to_vec(&document).expect("SchemaDocument always serializes");
        self.store
            .put(SCHEMA_KEY, bytes::Bytes::from(bytes))
            .await
            .map_err(|e| SchemaError::Unavailable(e.to_string()))?;
        // The etag for what we just wrote isn't known locally (the backend
        // assigns it); leave it unset so the next `get` after TTL expiry
        // re-reads once to learn it rather than risking a stale match.
        *self.cache.write() = Some(Cached {
            document: Arc::new(document),
            loaded_at: self.time_provider.now(),
            etag: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeside_store::BackedStore;
    use lakeside_time::MockProvider;
    use std::sync::Arc as StdArc;

    fn store() -> SchemaStore<BackedStore, MockProvider> {
        let backed = BackedStore::new(StdArc::new(object_store::memory::InMemory::new()));
        SchemaStore::new(backed, MockProvider::new(chrono::Utc::now()))
    }

    fn sample() -> SchemaDocument {
        SchemaDocument {
            fields: vec![SchemaField {
                name: "order_ts_hour".to_string(),
                primitive_type: PrimitiveType::String,
                logical_type: None,
                repetition: Some(Repetition::Required),
            }],
        }
    }

    #[tokio::test]
    async fn get_fails_fast_when_absent() {
        let store = store();
        assert!(matches!(store.get().await, Err(SchemaError::Unavailable(_))));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_caches() {
        let store = store();
        store.put(sample()).await.unwrap();
        let doc = store.get().await.unwrap();
        assert_eq!(doc.field("order_ts_hour").unwrap().primitive_type, PrimitiveType::String);
    }

    #[tokio::test]
    async fn ttl_expiry_with_unchanged_etag_keeps_the_cached_document() {
        let backed = BackedStore::new(StdArc::new(object_store::memory::InMemory::new()));
        let time = MockProvider::new(chrono::Utc::now());
        let store = SchemaStore::with_ttl(backed, time.clone(), Duration::from_millis(0));
        store.put(sample()).await.unwrap();

        let first = store.get().await.unwrap();
        time.advance(chrono::Duration::milliseconds(1));
        let second = store.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second), "unchanged etag should not force a re-parse");
    }

    #[tokio::test]
    async fn ttl_expiry_with_changed_document_reloads() {
        let backed = BackedStore::new(StdArc::new(object_store::memory::InMemory::new()));
        let time = MockProvider::new(chrono::Utc::now());
        let store = SchemaStore::with_ttl(backed, time.clone(), Duration::from_millis(0));
        store.put(sample()).await.unwrap();
        let _ = store.get().await.unwrap();

        time.advance(chrono::Duration::milliseconds(1));
        let mut replacement = sample();
        replacement.fields.push(SchemaField {
            name: "extra".to_string(),
            primitive_type: PrimitiveType::Int64,
            logical_type: None,
            repetition: Some(Repetition::Optional),
        });
        store.put(replacement).await.unwrap();

        time.advance(chrono::Duration::milliseconds(1));
        let reloaded = store.get().await.unwrap();
        assert!(reloaded.field("extra").is_some());
    }
}
