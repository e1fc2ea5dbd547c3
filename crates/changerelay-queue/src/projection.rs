//! Search-index and cache projections with in-memory backends

use crate::{Projection, ProjectionError};
use async_trait::async_trait;
use changerelay_core::BatchMessage;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Extract a record's key as a string; strings and numbers are accepted
pub fn record_key(record: &Value, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keyed documents of a batch; records without a usable key are skipped
fn keyed_documents(batch: &BatchMessage, key_field: &str, projection: &str) -> Vec<(String, Value)> {
    let mut documents = Vec::with_capacity(batch.len());
    for record in &batch.items {
        match record_key(record, key_field) {
            Some(key) => documents.push((key, record.clone())),
            None => warn!(
                projection = %projection,
                collection = %batch.collection_name,
                key_field = %key_field,
                "Skipping record without key"
            ),
        }
    }
    documents
}

/// Search backend accepting bulk upserts
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert documents by id into `index`
    async fn bulk_index(&self, index: &str, documents: Vec<(String, Value)>) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<T: SearchIndex + ?Sized> SearchIndex for Arc<T> {
    async fn bulk_index(&self, index: &str, documents: Vec<(String, Value)>) -> Result<(), ProjectionError> {
        (**self).bulk_index(index, documents).await
    }
}

/// Projects INSERT/REPLACE batches into a search index named after the collection
pub struct SearchIndexProjection<I> {
    name: String,
    index: I,
    key_field: String,
}

impl<I: SearchIndex> SearchIndexProjection<I> {
    pub fn new(name: impl Into<String>, index: I, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index,
            key_field: key_field.into(),
        }
    }
}

#[async_trait]
impl<I: SearchIndex> Projection for SearchIndexProjection<I> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, batch: &BatchMessage) -> Result<(), ProjectionError> {
        let documents = keyed_documents(batch, &self.key_field, &self.name);
        if documents.is_empty() {
            return Ok(());
        }

        let count = documents.len();
        self.index.bulk_index(&batch.collection_name, documents).await?;
        debug!(index = %batch.collection_name, documents = count, "Documents indexed");
        Ok(())
    }
}

/// A cached record stamped with the producer timestamp of its batch
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub version: i64,
}

/// Key/value cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), ProjectionError> {
        (**self).put_many(entries).await
    }
}

/// Projects INSERT/REPLACE batches into a cache under `"{collection}:{key}"`
pub struct CacheProjection<C> {
    name: String,
    cache: C,
    key_field: String,
}

impl<C: CacheStore> CacheProjection<C> {
    pub fn new(name: impl Into<String>, cache: C, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache,
            key_field: key_field.into(),
        }
    }
}

#[async_trait]
impl<C: CacheStore> Projection for CacheProjection<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, batch: &BatchMessage) -> Result<(), ProjectionError> {
        let entries: Vec<CacheEntry> = keyed_documents(batch, &self.key_field, &self.name)
            .into_iter()
            .map(|(key, value)| CacheEntry {
                key: format!("{}:{}", batch.collection_name, key),
                value,
                version: batch.timestamp,
            })
            .collect();

        if entries.is_empty() {
            return Ok(());
        }
        self.cache.put_many(entries).await
    }
}

/// In-memory search index keyed by `(index, id)`
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    documents: DashMap<(String, String), Value>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.documents
            .get(&(index.to_string(), id.to_string()))
            .map(|doc| doc.value().clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn bulk_index(&self, index: &str, documents: Vec<(String, Value)>) -> Result<(), ProjectionError> {
        for (id, document) in documents {
            self.documents.insert((index.to_string(), id), document);
        }
        Ok(())
    }
}

/// In-memory cache with last-write-wins by entry version.
///
/// An entry older than the one stored is dropped, so a redelivered or
/// out-of-order batch never rolls a key back.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn put_many(&self, entries: Vec<CacheEntry>) -> Result<(), ProjectionError> {
        for entry in entries {
            self.entries
                .entry(entry.key.clone())
                .and_modify(|current| {
                    if entry.version >= current.version {
                        *current = entry.clone();
                    }
                })
                .or_insert(entry);
        }
        Ok(())
    }
}
