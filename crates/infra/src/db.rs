//! Postgres connection and schema bootstrap.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Tables used by the Postgres stores. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    status          TEXT NOT NULL,
    progress        DOUBLE PRECISION NOT NULL DEFAULT 0,
    message         TEXT,
    total_rows      BIGINT,
    processed_rows  BIGINT NOT NULL DEFAULT 0,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ,
    meta            JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at DESC);
CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status);

CREATE TABLE IF NOT EXISTS products (
    id          UUID PRIMARY KEY,
    sku         TEXT NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS products_sku_lower_idx ON products ((lower(sku)));

CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id                UUID PRIMARY KEY,
    url               TEXT NOT NULL,
    event             TEXT NOT NULL,
    enabled           BOOLEAN NOT NULL DEFAULT TRUE,
    secret            TEXT,
    last_status_code  INTEGER,
    last_latency_ms   BIGINT,
    last_delivered_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS webhook_subscriptions_event_idx ON webhook_subscriptions (event) WHERE enabled;
"#;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema ready");
    Ok(())
}
