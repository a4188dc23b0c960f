//! Catalog collaborator: upsert-by-SKU writes used by the importer.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use shelfsync_catalog::{ProductFields, ProductRecord, ProductRow, Sku, UpsertOutcome};

pub mod postgres;

pub use postgres::PostgresCatalogStore;

/// Result of a single upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub outcome: UpsertOutcome,
    pub record: ProductRecord,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogStoreError {
    /// The backing store cannot be reached. Fatal for an import.
    #[error("catalog store unavailable: {0}")]
    Unavailable(String),

    #[error("catalog conflict: {0}")]
    Conflict(String),

    #[error("catalog storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Create the record for `sku` or overwrite its mutable fields.
    async fn upsert_by_sku(&self, sku: &Sku, fields: ProductFields) -> Result<Upserted, CatalogStoreError>;

    /// Apply rows strictly in order. One result per row, same order.
    async fn upsert_batch(&self, rows: Vec<ProductRow>) -> Result<Vec<Upserted>, CatalogStoreError> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(self.upsert_by_sku(&row.sku, row.fields).await?);
        }
        Ok(results)
    }

    async fn get_by_sku(&self, sku: &str) -> Result<Option<ProductRecord>, CatalogStoreError>;
}

/// In-memory catalog for tests/dev. Keyed by `lower(sku)`.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    records: RwLock<HashMap<String, ProductRecord>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records sorted by SKU key.
    pub fn snapshot(&self) -> Vec<ProductRecord> {
        let mut all: Vec<ProductRecord> = self
            .records
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|r| r.sku.key());
        all
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CatalogStoreError {
    CatalogStoreError::Storage("catalog lock poisoned".to_string())
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn upsert_by_sku(&self, sku: &Sku, fields: ProductFields) -> Result<Upserted, CatalogStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().map_err(poisoned)?;
        let (outcome, record) = match records.get_mut(&sku.key()) {
            Some(existing) => {
                existing.apply(sku.clone(), fields, now);
                (UpsertOutcome::Updated, existing.clone())
            }
            None => {
                let record = ProductRecord::create(sku.clone(), fields, now);
                records.insert(sku.key(), record.clone());
                (UpsertOutcome::Created, record)
            }
        };
        Ok(Upserted { outcome, record })
    }

    async fn get_by_sku(&self, sku: &str) -> Result<Option<ProductRecord>, CatalogStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&sku.trim().to_lowercase()).cloned())
    }
}
