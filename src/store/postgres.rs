use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::catalog::{Product, ProductStore};
use crate::config::PostgresConfig;
use crate::message::{MessageOutcome, NewOutboxMessage, OutboxMessage};
use crate::store::{OutboxStore, Store, StoreError};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres storage backend.
///
/// Holds the connection pool shared by the write path and the relay; each
/// transaction checks out one connection for its whole lifetime.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool from configuration and verifies the database is
    /// reachable within [`PING_TIMEOUT`].
    #[tracing::instrument(skip_all)]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.db)
            .ssl_mode(ssl_mode(&cfg.ssl_mode)?);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns)
            .min_connections(cfg.min_conns)
            .max_lifetime(Duration::from_secs(cfg.max_conn_lifetime_secs))
            .idle_timeout(Duration::from_secs(cfg.max_conn_idle_time_secs))
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        tokio::time::timeout(PING_TIMEOUT, store.ping())
            .await
            .map_err(|_| StoreError::backend("database ping timed out"))??;

        Ok(store)
    }

    /// Underlying pool, exposed for migrations.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        Ok(tx.rollback().await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    #[tracing::instrument(skip_all, fields(topic = %params.topic))]
    async fn insert_message(
        &self,
        params: NewOutboxMessage,
        tx: &mut Self::Tx,
    ) -> Result<OutboxMessage, StoreError> {
        let row = OutboxMessage::new(params);
        let headers = serde_json::to_value(&row.headers).map_err(StoreError::serde)?;

        sqlx::query(
            "INSERT INTO outbox_messages (id, topic, partition_key, headers, payload, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(row.id)
        .bind(&row.topic)
        .bind(&row.partition_key)
        .bind(&headers)
        .bind(&row.payload)
        .bind(row.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(row)
    }

    #[tracing::instrument(skip(self, tx))]
    async fn list_unprocessed(
        &self,
        batch_size: u32,
        tx: &mut Self::Tx,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, topic, partition_key, headers, payload, created_at, processed_at, error \
             FROM outbox_messages \
             WHERE processed_at IS NULL \
             ORDER BY id \
             LIMIT $1",
        )
        .bind(i64::from(batch_size))
        .fetch_all(&mut **tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let headers_json: serde_json::Value = row.try_get("headers")?;
            let headers: HashMap<String, String> =
                serde_json::from_value(headers_json).map_err(StoreError::serde)?;

            out.push(OutboxMessage {
                id: row.try_get("id")?,
                topic: row.try_get("topic")?,
                partition_key: row.try_get("partition_key")?,
                headers,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
                processed_at: row.try_get("processed_at")?,
                error: row.try_get("error")?,
            });
        }

        Ok(out)
    }

    #[tracing::instrument(skip_all, fields(count = outcomes.len()))]
    async fn bulk_mark_processed(
        &self,
        outcomes: &[MessageOutcome],
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let (ids, errors): (Vec<Uuid>, Vec<Option<String>>) = outcomes
            .iter()
            .map(|outcome| (outcome.id, outcome.error.clone()))
            .unzip();

        // One statement for the whole batch: unnest the parallel arrays and
        // join them row-wise onto the outbox table.
        sqlx::query(
            "UPDATE outbox_messages AS o \
             SET processed_at = NOW(), error = u.error \
             FROM (SELECT UNNEST($1::uuid[]) AS id, UNNEST($2::text[]) AS error) AS u \
             WHERE o.id = u.id AND o.processed_at IS NULL",
        )
        .bind(&ids)
        .bind(&errors)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProductStore for PgStore {
    #[tracing::instrument(skip_all, fields(sku = %product.sku))]
    async fn insert_product(
        &self,
        product: &Product,
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO products (id, name, sku, price, stock_quantity, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.sku)
        .bind(product.price)
        .bind(product.stock_quantity)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, sku, price, stock_quantity, created_at, updated_at \
             FROM products \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Product {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    sku: row.try_get("sku")?,
                    price: row.try_get("price")?,
                    stock_quantity: row.try_get("stock_quantity")?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}

fn ssl_mode(value: &str) -> Result<PgSslMode, StoreError> {
    match value {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => Err(StoreError::backend(format!(
            "unknown postgres ssl mode: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_mode_parses_known_values() {
        assert!(matches!(ssl_mode("disable"), Ok(PgSslMode::Disable)));
        assert!(matches!(ssl_mode("verify-full"), Ok(PgSslMode::VerifyFull)));
        assert!(ssl_mode("sideways").is_err());
    }
}
