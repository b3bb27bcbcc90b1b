//! Core value types shared by every stage of the fund-data sync pipeline.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fundsync-core";

pub const MAX_STOCK_LEN: usize = 50;
pub const MAX_TICKER_LEN: usize = 50;
pub const MAX_COL_CODE_LEN: usize = 100;
pub const MAX_SOURCE_KEY_LEN: usize = 500;

/// One typed fact from an exported CSV row.
///
/// Records are created once by the parser and only read afterwards. The
/// `source_key` is the lineage pointer back to the object the row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundDataRecord {
    pub trade_date: NaiveDate,
    pub stock: String,
    pub ticker: String,
    pub col_code: String,
    pub value_numeric: Option<Decimal>,
    pub value_text: Option<String>,
    pub source_key: String,
}

impl FundDataRecord {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            trade_date: self.trade_date,
            stock: self.stock.clone(),
            ticker: self.ticker.clone(),
            col_code: self.col_code.clone(),
        }
    }

    /// Sparse rows carry neither a numeric nor a text value.
    pub fn has_value(&self) -> bool {
        self.value_numeric.is_some() || self.value_text.is_some()
    }
}

/// Business key the repository upserts on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    pub trade_date: NaiveDate,
    pub stock: String,
    pub ticker: String,
    pub col_code: String,
}

/// Collapses records sharing a composite key, keeping the position of the
/// first occurrence and the values of the last one.
///
/// Returns the surviving records and how many rows were folded away.
pub fn dedupe_by_composite_key(records: &[FundDataRecord]) -> (Vec<&FundDataRecord>, usize) {
    let mut positions: HashMap<CompositeKey, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&FundDataRecord> = Vec::with_capacity(records.len());
    let mut collisions = 0usize;

    for record in records {
        match positions.get(&record.composite_key()) {
            Some(&idx) => {
                out[idx] = record;
                collisions += 1;
            }
            None => {
                positions.insert(record.composite_key(), out.len());
                out.push(record);
            }
        }
    }

    (out, collisions)
}

pub fn distinct_tickers(records: &[FundDataRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.ticker.clone()).collect()
}

/// Bucket/key pair addressing one staged object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `s3://bucket/key`.
    pub fn parse_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("s3://")?;
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }

    pub fn raw_path(&self) -> Option<RawObjectPath> {
        RawObjectPath::parse(&self.key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Decoded form of the staging layout
/// `raw/<source_system>/<dataset>/<YYYY-MM-DD>/<file>.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObjectPath {
    pub source_system: String,
    pub dataset: String,
    pub as_of: NaiveDate,
    pub file_name: String,
}

impl RawObjectPath {
    pub const NAMESPACE: &'static str = "raw";

    pub fn parse(key: &str) -> Option<Self> {
        let segments: Vec<&str> = key.trim_start_matches('/').split('/').collect();
        let [namespace, source_system, dataset, as_of, file_name] = segments.as_slice() else {
            return None;
        };
        if *namespace != Self::NAMESPACE || source_system.is_empty() || dataset.is_empty() {
            return None;
        }
        if !file_name.to_ascii_lowercase().ends_with(".csv") || file_name.len() <= ".csv".len() {
            return None;
        }
        let as_of = NaiveDate::parse_from_str(as_of, "%Y-%m-%d").ok()?;
        Some(Self {
            source_system: source_system.to_string(),
            dataset: dataset.to_string(),
            as_of,
            file_name: file_name.to_string(),
        })
    }
}

/// Per-message processing states. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Received,
    Parsing,
    Registering,
    Upserting,
    Succeeded,
    Failed,
}

impl ProcessingStage {
    /// Ticker registration is best effort and never fails a message.
    pub fn can_fail(self) -> bool {
        !matches!(
            self,
            ProcessingStage::Registering | ProcessingStage::Succeeded | ProcessingStage::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::Received => "received",
            ProcessingStage::Parsing => "parsing",
            ProcessingStage::Registering => "registering",
            ProcessingStage::Upserting => "upserting",
            ProcessingStage::Succeeded => "succeeded",
            ProcessingStage::Failed => "failed",
        }
    }
}

/// Coarse failure classification for operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidMessage,
    BucketNotFound,
    ObjectNotFound,
    EmptyObject,
    Storage,
    Parse,
    Write,
    Internal,
}

/// Result of syncing one staged file. Returned to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub records_processed: usize,
    pub rows_affected: u64,
    pub tickers_registered: usize,
    pub source_ref: String,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub failed_stage: Option<ProcessingStage>,
    pub content_sha256: Option<String>,
}

impl SyncOutcome {
    pub fn succeeded(
        source_ref: impl Into<String>,
        records_processed: usize,
        rows_affected: u64,
        tickers_registered: usize,
    ) -> Self {
        Self {
            success: true,
            records_processed,
            rows_affected,
            tickers_registered,
            source_ref: source_ref.into(),
            error: None,
            failure_kind: None,
            failed_stage: None,
            content_sha256: None,
        }
    }

    pub fn failed(
        source_ref: impl Into<String>,
        stage: ProcessingStage,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            records_processed: 0,
            rows_affected: 0,
            tickers_registered: 0,
            source_ref: source_ref.into(),
            error: Some(error.into()),
            failure_kind: Some(kind),
            failed_stage: Some(stage),
            content_sha256: None,
        }
    }

    pub fn with_content_sha256(mut self, hash: impl Into<String>) -> Self {
        self.content_sha256 = Some(hash.into());
        self
    }

    pub fn stage(&self) -> ProcessingStage {
        if self.success {
            ProcessingStage::Succeeded
        } else {
            ProcessingStage::Failed
        }
    }

    /// Folds the outcomes of several files announced by one notification.
    ///
    /// Success requires every file to succeed; counts are summed and the
    /// first failure's details are kept. Returns `None` for an empty input.
    pub fn merge(outcomes: Vec<SyncOutcome>) -> Option<SyncOutcome> {
        let mut iter = outcomes.into_iter();
        let first = iter.next()?;
        Some(iter.fold(first, |mut acc, next| {
            acc.records_processed += next.records_processed;
            acc.rows_affected += next.rows_affected;
            acc.tickers_registered += next.tickers_registered;
            acc.source_ref = format!("{},{}", acc.source_ref, next.source_ref);
            if acc.success && !next.success {
                acc.error = next.error;
                acc.failure_kind = next.failure_kind;
                acc.failed_stage = next.failed_stage;
            }
            acc.success = acc.success && next.success;
            acc.content_sha256 = None;
            acc
        }))
    }
}

/// Which messages of one handler invocation must be redelivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAcknowledgment {
    pub failed_message_ids: Vec<String>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchAcknowledgment {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, message_id: impl Into<String>) {
        self.failed_message_ids.push(message_id.into());
        self.failure_count += 1;
    }
}

/// Entry of the queue service's native partial-batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Transport-level response; always `200`, failures live in the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: BatchAcknowledgment,
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl From<BatchAcknowledgment> for HandlerResponse {
    fn from(body: BatchAcknowledgment) -> Self {
        let batch_item_failures = body
            .failed_message_ids
            .iter()
            .map(|id| BatchItemFailure {
                item_identifier: id.clone(),
            })
            .collect();
        Self {
            status_code: 200,
            body,
            batch_item_failures,
        }
    }
}
