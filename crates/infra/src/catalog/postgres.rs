//! Postgres-backed catalog writes.
//!
//! Uniqueness is `lower(sku)` (see `db::SCHEMA`); the upsert relies on that
//! index so concurrent creates of the same SKU resolve to one row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use shelfsync_catalog::{ProductFields, ProductRecord, ProductRow, Sku, UpsertOutcome};
use shelfsync_core::ProductId;

use super::{CatalogStore, CatalogStoreError, Upserted};

const UPSERT_SQL: &str = r#"
    INSERT INTO products (id, sku, name, description, active, created_at, updated_at)
    VALUES ($1, $2, $3, $4, COALESCE($5::boolean, TRUE), $6, $6)
    ON CONFLICT ((lower(sku))) DO UPDATE
    SET sku = EXCLUDED.sku,
        name = EXCLUDED.name,
        description = EXCLUDED.description,
        active = COALESCE($5::boolean, products.active),
        updated_at = EXCLUDED.updated_at
    RETURNING id, sku, name, description, active, created_at, updated_at, (xmax = 0) AS inserted
"#;

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: Arc<PgPool>,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn upsert_query<'q>(sku: &'q Sku, fields: &'q ProductFields) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(UPSERT_SQL)
        .bind(Uuid::now_v7())
        .bind(sku.as_str())
        .bind(&fields.name)
        .bind(&fields.description)
        .bind(fields.active)
        .bind(Utc::now())
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(skip(self, changes), fields(sku = %sku), err)]
    async fn upsert_by_sku(&self, sku: &Sku, changes: ProductFields) -> Result<Upserted, CatalogStoreError> {
        let row = upsert_query(sku, &changes)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_by_sku", e))?;
        upserted_from_row(&row)
    }

    /// One transaction per batch; rows are applied one statement at a time so
    /// repeated SKUs inside the batch resolve in order.
    #[instrument(skip(self, rows), fields(rows = rows.len()), err)]
    async fn upsert_batch(&self, rows: Vec<ProductRow>) -> Result<Vec<Upserted>, CatalogStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_batch.begin", e))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let pg_row = upsert_query(&row.sku, &row.fields)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upsert_batch", e))?;
            results.push(upserted_from_row(&pg_row)?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_batch.commit", e))?;

        Ok(results)
    }

    #[instrument(skip(self), err)]
    async fn get_by_sku(&self, sku: &str) -> Result<Option<ProductRecord>, CatalogStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, sku, name, description, active, created_at, updated_at, FALSE AS inserted
            FROM products
            WHERE lower(sku) = lower($1)
            "#,
        )
        .bind(sku.trim())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_sku", e))?;

        row.map(|r| upserted_from_row(&r).map(|u| u.record)).transpose()
    }
}

fn upserted_from_row(row: &sqlx::postgres::PgRow) -> Result<Upserted, CatalogStoreError> {
    let decode = |e: sqlx::Error| CatalogStoreError::Storage(format!("failed to decode product row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let sku: String = row.try_get("sku").map_err(decode)?;
    let inserted: bool = row.try_get("inserted").map_err(decode)?;

    let record = ProductRecord {
        id: ProductId::from_uuid(id),
        sku: Sku::parse(&sku).map_err(|e| CatalogStoreError::Storage(e.to_string()))?,
        name: row.try_get("name").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        active: row.try_get("active").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    };
    let outcome = if inserted {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    };
    Ok(Upserted { outcome, record })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CatalogStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => CatalogStoreError::Conflict(msg),
                _ => CatalogStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            CatalogStoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => CatalogStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
