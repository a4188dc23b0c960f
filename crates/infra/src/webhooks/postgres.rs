//! Postgres-backed subscription reads.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use shelfsync_core::SubscriptionId;
use shelfsync_events::CatalogEvent;

use super::subscription::{LastDelivery, SubscriptionStore, SubscriptionStoreError, WebhookSubscription};

const SUBSCRIPTION_COLUMNS: &str =
    "id, url, event, enabled, secret, last_status_code, last_latency_ms, last_delivered_at";

#[derive(Debug, Clone)]
pub struct PostgresSubscriptionStore {
    pool: Arc<PgPool>,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    #[instrument(skip(self), fields(event = event.as_str()), err)]
    async fn list_enabled(&self, event: CatalogEvent) -> Result<Vec<WebhookSubscription>, SubscriptionStoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions \
             WHERE enabled AND event = $1::text ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(event.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_enabled", e))?;

        rows.iter().map(subscription_from_row).collect()
    }

    #[instrument(skip(self), fields(subscription_id = %id), err)]
    async fn get(&self, id: SubscriptionId) -> Result<Option<WebhookSubscription>, SubscriptionStoreError> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_subscription", e))?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self, delivery), fields(subscription_id = %id, status_code = ?delivery.status_code), err)]
    async fn record_last_delivery(
        &self,
        id: SubscriptionId,
        delivery: LastDelivery,
    ) -> Result<(), SubscriptionStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET last_status_code = $2::integer,
                last_latency_ms = $3::bigint,
                last_delivered_at = $4
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(delivery.status_code.map(i32::from))
        .bind(i64::try_from(delivery.latency_ms).unwrap_or(i64::MAX))
        .bind(delivery.at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_last_delivery", e))?;

        if result.rows_affected() == 0 {
            return Err(SubscriptionStoreError::NotFound(id));
        }
        Ok(())
    }
}

fn subscription_from_row(row: &sqlx::postgres::PgRow) -> Result<WebhookSubscription, SubscriptionStoreError> {
    let decode = |e: sqlx::Error| SubscriptionStoreError::Storage(format!("failed to decode subscription row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let event: String = row.try_get("event").map_err(decode)?;
    let last_status_code: Option<i32> = row.try_get("last_status_code").map_err(decode)?;
    let last_latency_ms: Option<i64> = row.try_get("last_latency_ms").map_err(decode)?;

    Ok(WebhookSubscription {
        id: SubscriptionId::from_uuid(id),
        url: row.try_get("url").map_err(decode)?,
        event: event
            .parse()
            .map_err(|e| SubscriptionStoreError::Storage(format!("subscription {id}: {e}")))?,
        enabled: row.try_get("enabled").map_err(decode)?,
        secret: row
            .try_get::<Option<String>, _>("secret")
            .map_err(decode)?
            .filter(|s| !s.is_empty()),
        last_status_code: last_status_code.and_then(|c| u16::try_from(c).ok()),
        last_latency_ms: last_latency_ms.and_then(|l| u64::try_from(l).ok()),
        last_delivered_at: row.try_get("last_delivered_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SubscriptionStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            SubscriptionStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            SubscriptionStoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => SubscriptionStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
