//! Interfaces of the ticker registrar and fund-data repository.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use fundsync_core::FundDataRecord;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("ticker registration failed: {0}")]
pub struct RegistrationError(pub String);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database write failed: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RegistrationError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Maps ticker symbols to their ids in the ticker master.
#[async_trait]
pub trait TickerRegistrar: Send + Sync {
    async fn resolve(&self, symbol: &str) -> Result<Option<i64>, RegistrationError>;

    /// Registers unknown symbols and returns every requested symbol mapped to
    /// its id, or `None` if it could not be registered.
    async fn ensure_registered(
        &self,
        symbols: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<i64>>, RegistrationError>;
}

/// Authoritative write of parsed records.
#[async_trait]
pub trait FundDataRepository: Send + Sync {
    /// Upserts on `(trade_date, stock, ticker, col_code)`. Re-submitting the
    /// same records must update the same rows and report the same count.
    async fn batch_upsert(&self, records: &[FundDataRecord]) -> Result<u64, WriteError>;
}
