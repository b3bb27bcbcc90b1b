//! Postgres-backed registrar and repository.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fundsync_core::{dedupe_by_composite_key, FundDataRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::collaborators::{FundDataRepository, RegistrationError, TickerRegistrar, WriteError};
use crate::SyncConfig;

/// Postgres caps a statement at 65535 bind parameters; each row binds seven.
pub const MAX_UPSERT_CHUNK: usize = 9_000;

const UPSERT_PREFIX: &str = "INSERT INTO fund_data \
     (trade_date, stock, ticker, col_code, value_numeric, value_text, source_key) ";

const UPSERT_CONFLICT: &str = " ON CONFLICT (trade_date, stock, ticker, col_code) DO UPDATE SET \
     value_numeric = EXCLUDED.value_numeric, \
     value_text = EXCLUDED.value_text, \
     source_key = EXCLUDED.source_key, \
     updated_at = now()";

pub async fn connect_pool(config: &SyncConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections.max(1))
        .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
        .connect(&config.database_url)
        .await
        .context("connecting to fund-data database")
}

#[derive(Debug, Clone)]
pub struct PgTickerRegistrar {
    pool: PgPool,
}

impl PgTickerRegistrar {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TickerRegistrar for PgTickerRegistrar {
    async fn resolve(&self, symbol: &str) -> Result<Option<i64>, RegistrationError> {
        let row = sqlx::query("SELECT id FROM tickers WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .map_err(RegistrationError::from)
    }

    async fn ensure_registered(
        &self,
        symbols: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<i64>>, RegistrationError> {
        let mut ids: BTreeMap<String, Option<i64>> =
            symbols.iter().map(|s| (s.clone(), None)).collect();
        if symbols.is_empty() {
            return Ok(ids);
        }
        let requested: Vec<String> = symbols.iter().cloned().collect();

        let inserted = sqlx::query(
            "INSERT INTO tickers (symbol) SELECT UNNEST($1::text[]) ON CONFLICT (symbol) DO NOTHING",
        )
        .bind(&requested)
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(requested = requested.len(), inserted, "registered tickers");

        let rows = sqlx::query("SELECT id, symbol FROM tickers WHERE symbol = ANY($1)")
            .bind(&requested)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let id: i64 = row.try_get("id")?;
            ids.insert(symbol, Some(id));
        }
        Ok(ids)
    }
}

#[derive(Debug, Clone)]
pub struct PgFundDataRepository {
    pool: PgPool,
    chunk_size: usize,
}

impl PgFundDataRepository {
    pub fn new(pool: PgPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.clamp(1, MAX_UPSERT_CHUNK),
        }
    }
}

#[async_trait]
impl FundDataRepository for PgFundDataRepository {
    async fn batch_upsert(&self, records: &[FundDataRecord]) -> Result<u64, WriteError> {
        let (unique, collisions) = dedupe_by_composite_key(records);
        if collisions > 0 {
            warn!(
                collisions,
                distinct = unique.len(),
                "file repeats composite keys; last row wins"
            );
        }
        if unique.is_empty() {
            return Ok(0);
        }

        // One transaction per file so a failed chunk leaves no partial write.
        let mut tx = self.pool.begin().await?;
        let mut rows_affected = 0u64;
        for chunk in unique.chunks(self.chunk_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(UPSERT_PREFIX);
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.trade_date)
                    .push_bind(record.stock.as_str())
                    .push_bind(record.ticker.as_str())
                    .push_bind(record.col_code.as_str())
                    .push_bind(record.value_numeric)
                    .push_bind(record.value_text.as_deref())
                    .push_bind(record.source_key.as_str());
            });
            builder.push(UPSERT_CONFLICT);
            rows_affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(rows_affected)
    }
}
