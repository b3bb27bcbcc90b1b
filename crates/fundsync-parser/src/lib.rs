//! CSV decoder/parser for staged fund-data exports.
//!
//! Turns the raw bytes of one export into typed [`FundDataRecord`]s. Parsing
//! is all-or-nothing: any malformed row rejects the whole file, since a bad
//! row usually means the export itself is corrupt.

pub mod columns;
pub mod encoding;
pub mod values;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use encoding_rs::Encoding;
use fundsync_core::{
    FundDataRecord, MAX_COL_CODE_LEN, MAX_SOURCE_KEY_LEN, MAX_STOCK_LEN, MAX_TICKER_LEN,
};
use thiserror::Error;
use tracing::{debug, warn};

pub use columns::{ColumnIndex, RawRow, CANONICAL_COLUMNS};
pub use encoding::{decode_strict, detect_encoding, lookup_encoding, DetectedEncoding};
pub use values::{parse_exact_decimal, parse_trade_date, TRADE_DATE_FORMATS};

pub const CRATE_NAME: &str = "fundsync-parser";

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowErrorReason {
    #[error("is missing")]
    Missing,
    #[error("is empty")]
    Empty,
    #[error("has unrecognised date `{0}`")]
    InvalidDate(String),
    #[error("is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("source key is {len} characters long (max {max})")]
    InvalidSourceKey { len: usize, max: usize },
    #[error("cannot decode input as {encoding}: malformed bytes at [{start}, {end})")]
    Decode {
        encoding: &'static str,
        start: usize,
        end: usize,
    },
    #[error(
        "missing required columns: {}; found columns: {}",
        .missing.join(", "),
        .found.join(", ")
    )]
    Schema {
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error("duplicate columns in header: {}", .duplicates.join(", "))]
    DuplicateColumns { duplicates: Vec<String> },
    #[error("header present but file has no data rows")]
    EmptyData,
    #[error("row {row}: field `{field}` {reason}")]
    Row {
        row: usize,
        field: &'static str,
        reason: RowErrorReason,
    },
    #[error("malformed CSV at row {row}: {message}")]
    Csv { row: usize, message: String },
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Detections below this confidence are logged and used anyway.
    pub confidence_threshold: f32,
    /// Normalized (trimmed, lowercase) column names every file must carry.
    pub required_columns: Vec<String>,
    /// Skips detection entirely when set.
    pub encoding_override: Option<&'static Encoding>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            required_columns: CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
            encoding_override: None,
        }
    }
}

impl ParserConfig {
    pub fn with_required_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut required: Vec<String> = Vec::new();
        for name in columns {
            let name = columns::normalize_column_name(name.as_ref());
            if !name.is_empty() && !required.contains(&name) {
                required.push(name);
            }
        }
        self.required_columns = required;
        self
    }
}

/// Summary of soft data-quality findings for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: usize,
    pub degraded_to_text: usize,
    pub dropped_numeric: usize,
    pub sparse_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FundDataParser {
    config: ParserConfig,
}

impl FundDataParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn parse(&self, bytes: &[u8], source_key: &str) -> Result<Vec<FundDataRecord>, ParseError> {
        self.parse_with_stats(bytes, source_key).map(|(records, _)| records)
    }

    pub fn parse_with_stats(
        &self,
        bytes: &[u8],
        source_key: &str,
    ) -> Result<(Vec<FundDataRecord>, ParseStats), ParseError> {
        let key_len = source_key.chars().count();
        if key_len > MAX_SOURCE_KEY_LEN {
            return Err(ParseError::InvalidSourceKey {
                len: key_len,
                max: MAX_SOURCE_KEY_LEN,
            });
        }

        let text = self.decode(bytes, source_key)?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| ParseError::Csv {
                row: 0,
                message: e.to_string(),
            })?
            .clone();
        let index = ColumnIndex::from_headers(&headers, &self.config.required_columns)?;

        let mut records = Vec::new();
        let mut stats = ParseStats::default();
        let mut record = StringRecord::new();
        loop {
            let row_no = stats.rows + 1;
            let more = reader.read_record(&mut record).map_err(|e| ParseError::Csv {
                row: row_no,
                message: e.to_string(),
            })?;
            if !more {
                break;
            }
            stats.rows = row_no;
            let row = RawRow::from_record(&record, &index);
            records.push(build_record(row, row_no, source_key, &mut stats)?);
        }

        if records.is_empty() {
            return Err(ParseError::EmptyData);
        }

        if stats.degraded_to_text > 0 || stats.dropped_numeric > 0 {
            warn!(
                source_key,
                degraded_to_text = stats.degraded_to_text,
                dropped_numeric = stats.dropped_numeric,
                "non-numeric values found in value_numeric"
            );
        }
        if stats.sparse_rows > 0 {
            warn!(
                source_key,
                sparse_rows = stats.sparse_rows,
                "rows without numeric or text value"
            );
        }

        Ok((records, stats))
    }

    fn decode(&self, bytes: &[u8], source_key: &str) -> Result<String, ParseError> {
        let encoding = match self.config.encoding_override {
            Some(encoding) => encoding,
            None => {
                let detected = detect_encoding(bytes);
                if detected.confidence < self.config.confidence_threshold {
                    warn!(
                        source_key,
                        encoding = detected.name(),
                        confidence = detected.confidence,
                        threshold = self.config.confidence_threshold,
                        "low-confidence charset detection; decoding with best guess"
                    );
                } else {
                    debug!(
                        source_key,
                        encoding = detected.name(),
                        confidence = detected.confidence,
                        "detected charset"
                    );
                }
                detected.encoding
            }
        };
        decode_strict(bytes, encoding)
    }
}

/// Parses with the default configuration.
pub fn parse(bytes: &[u8], source_key: &str) -> Result<Vec<FundDataRecord>, ParseError> {
    FundDataParser::default().parse(bytes, source_key)
}

fn required_text<'a>(
    value: Option<&'a str>,
    field: &'static str,
    max: Option<usize>,
    row: usize,
) -> Result<&'a str, ParseError> {
    let reason = match value.map(str::trim) {
        None => RowErrorReason::Missing,
        Some("") => RowErrorReason::Empty,
        Some(v) => match max {
            Some(max) if v.chars().count() > max => RowErrorReason::TooLong {
                len: v.chars().count(),
                max,
            },
            _ => return Ok(v),
        },
    };
    Err(ParseError::Row { row, field, reason })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn build_record(
    row: RawRow<'_>,
    row_no: usize,
    source_key: &str,
    stats: &mut ParseStats,
) -> Result<FundDataRecord, ParseError> {
    let trade_date_raw = required_text(row.trade_date, columns::TRADE_DATE, None, row_no)?;
    let stock = required_text(row.stock, columns::STOCK, Some(MAX_STOCK_LEN), row_no)?;
    let ticker = required_text(row.ticker, columns::TICKER, Some(MAX_TICKER_LEN), row_no)?;
    let col_code = required_text(row.col_code, columns::COL_CODE, Some(MAX_COL_CODE_LEN), row_no)?;

    let trade_date: NaiveDate = parse_trade_date(trade_date_raw).ok_or_else(|| ParseError::Row {
        row: row_no,
        field: columns::TRADE_DATE,
        reason: RowErrorReason::InvalidDate(trade_date_raw.to_string()),
    })?;

    // Text is verbatim: only a truly empty cell counts as no text.
    let mut value_text = row.value_text.filter(|v| !v.is_empty()).map(ToString::to_string);
    let mut value_numeric = None;
    if let Some(raw) = non_blank(row.value_numeric) {
        match parse_exact_decimal(raw) {
            Some(number) => value_numeric = Some(number),
            None if value_text.is_none() => {
                debug!(row = row_no, value = raw, "numeric value kept as text");
                value_text = Some(raw.trim().to_string());
                stats.degraded_to_text += 1;
            }
            None => {
                debug!(row = row_no, value = raw, "non-numeric value dropped; text already set");
                stats.dropped_numeric += 1;
            }
        }
    }

    let record = FundDataRecord {
        trade_date,
        stock: stock.to_string(),
        ticker: ticker.to_string(),
        col_code: col_code.to_string(),
        value_numeric,
        value_text,
        source_key: source_key.to_string(),
    };
    if !record.has_value() {
        stats.sparse_rows += 1;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const KEY: &str = "s3://fund-staging/raw/erp/fund_prices/2025-12-09/part-0001.csv";
    const HEADER: &str = "trade_date,stock,ticker,col_code,value_numeric,value_text\n";

    fn csv(rows: &str) -> Vec<u8> {
        format!("{HEADER}{rows}").into_bytes()
    }

    #[test]
    fn parses_single_close_price() {
        let records = parse(&csv("2025-12-09,DBS,DBS19,CLOSE,38.50,\n"), KEY).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.trade_date, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
        assert_eq!(r.stock, "DBS");
        assert_eq!(r.ticker, "DBS19");
        assert_eq!(r.col_code, "CLOSE");
        assert_eq!(r.value_numeric, Some(Decimal::from_str("38.50").unwrap()));
        assert_eq!(r.value_text, None);
        assert_eq!(r.source_key, KEY);
    }

    #[test]
    fn every_row_becomes_a_record_with_lineage() {
        let rows = "2025-12-09,DBS,DBS19,CLOSE,38.50,\n\
                    2025-12-09,DBS,DBS19,OPEN,38.10,\n\
                    2025-12-09,OCBC,O39,RATING,,BUY\n";
        let records = parse(&csv(rows), KEY).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.source_key == KEY));
        assert_eq!(records[2].value_text.as_deref(), Some("BUY"));
    }

    #[test]
    fn compact_dates_parse() {
        let records = parse(&csv("20251209,DBS,DBS19,CLOSE,38.50,\n"), KEY).unwrap();
        assert_eq!(records[0].trade_date, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
    }

    #[test]
    fn header_case_does_not_change_result() {
        let lower = parse(&csv("2025-12-09,DBS,DBS19,CLOSE,38.50,\n"), KEY).unwrap();
        let upper_bytes =
            b"TRADE_DATE,STOCK,TICKER,COL_CODE,VALUE_NUMERIC,VALUE_TEXT\n2025-12-09,DBS,DBS19,CLOSE,38.50,\n";
        let upper = parse(upper_bytes, KEY).unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn extra_columns_are_ignored() {
        let bytes = b"source,trade_date,stock,ticker,col_code,value_numeric,value_text,updated_at\n\
                      ERP,2025-12-09,DBS,DBS19,CLOSE,38.50,,2025-12-09T18:00:00\n";
        let records = parse(bytes, KEY).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ticker, "DBS19");
    }

    #[test]
    fn header_only_file_is_empty_data() {
        assert!(matches!(parse(HEADER.as_bytes(), KEY), Err(ParseError::EmptyData)));
    }

    #[test]
    fn missing_column_message_names_missing_and_found() {
        let bytes = b"trade_date,stock,ticker,value_numeric,value_text\n2025-12-09,DBS,DBS19,1,\n";
        let err = parse(bytes, KEY).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("col_code"), "{message}");
        assert!(message.contains("trade_date, stock, ticker, value_numeric, value_text"), "{message}");
    }

    #[test]
    fn bad_date_rejects_whole_file() {
        let rows = "2025-12-09,DBS,DBS19,CLOSE,38.50,\n\
                    09-Dec-2025,DBS,DBS19,OPEN,38.10,\n";
        match parse(&csv(rows), KEY) {
            Err(ParseError::Row { row, field, reason }) => {
                assert_eq!(row, 2);
                assert_eq!(field, "trade_date");
                assert_eq!(reason, RowErrorReason::InvalidDate("09-Dec-2025".into()));
            }
            other => panic!("expected row error, got {other:?}"),
        }
    }

    #[test]
    fn blank_required_field_names_row_and_field() {
        match parse(&csv("2025-12-09,DBS,   ,CLOSE,38.50,\n"), KEY) {
            Err(ParseError::Row { row, field, reason }) => {
                assert_eq!((row, field), (1, "ticker"));
                assert_eq!(reason, RowErrorReason::Empty);
            }
            other => panic!("expected row error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_row_reports_missing_field() {
        match parse(&csv("2025-12-09,DBS\n"), KEY) {
            Err(ParseError::Row { field, reason, .. }) => {
                assert_eq!(field, "ticker");
                assert_eq!(reason, RowErrorReason::Missing);
            }
            other => panic!("expected row error, got {other:?}"),
        }
    }

    #[test]
    fn overlong_ticker_is_rejected() {
        let ticker = "T".repeat(51);
        let err = parse(&csv(&format!("2025-12-09,DBS,{ticker},CLOSE,1,\n")), KEY).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Row {
                field: "ticker",
                reason: RowErrorReason::TooLong { len: 51, max: 50 },
                ..
            }
        ));
    }

    #[test]
    fn non_numeric_value_degrades_to_text() {
        let (records, stats) = FundDataParser::default()
            .parse_with_stats(&csv("2025-12-09,DBS,DBS19,CLOSE, N/A ,\n"), KEY)
            .unwrap();
        assert_eq!(records[0].value_numeric, None);
        assert_eq!(records[0].value_text.as_deref(), Some("N/A"));
        assert_eq!(stats.degraded_to_text, 1);
    }

    #[test]
    fn non_numeric_value_does_not_overwrite_text() {
        let (records, stats) = FundDataParser::default()
            .parse_with_stats(&csv("2025-12-09,DBS,DBS19,RATING,n.m.,HOLD\n"), KEY)
            .unwrap();
        assert_eq!(records[0].value_numeric, None);
        assert_eq!(records[0].value_text.as_deref(), Some("HOLD"));
        assert_eq!(stats.dropped_numeric, 1);
    }

    #[test]
    fn text_value_is_kept_verbatim() {
        let records = parse(&csv("2025-12-09,DBS,DBS19,NOTE,,\" Outperform, raised \"\n"), KEY).unwrap();
        assert_eq!(records[0].value_text.as_deref(), Some(" Outperform, raised "));
    }

    #[test]
    fn whitespace_only_text_is_kept_verbatim() {
        let (records, stats) = FundDataParser::default()
            .parse_with_stats(&csv("2025-12-09,DBS,DBS19,NOTE,,\"   \"\n"), KEY)
            .unwrap();
        assert_eq!(records[0].value_text.as_deref(), Some("   "));
        assert_eq!(stats.sparse_rows, 0);
    }

    #[test]
    fn underscored_numbers_degrade_to_text() {
        let rows = "2025-12-09,DBS,DBS19,VOLUME,1_000,\n\
                    2025-12-09,DBS,DBS19,TURNOVER,1__2,\n";
        let (records, stats) = FundDataParser::default()
            .parse_with_stats(&csv(rows), KEY)
            .unwrap();
        assert_eq!(records[0].value_numeric, None);
        assert_eq!(records[0].value_text.as_deref(), Some("1_000"));
        assert_eq!(records[1].value_numeric, None);
        assert_eq!(records[1].value_text.as_deref(), Some("1__2"));
        assert_eq!(stats.degraded_to_text, 2);
    }

    #[test]
    fn sparse_rows_are_kept_and_counted() {
        let (records, stats) = FundDataParser::default()
            .parse_with_stats(&csv("2025-12-09,DBS,DBS19,CLOSE,,\n"), KEY)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].has_value());
        assert_eq!(stats.sparse_rows, 1);
    }

    #[test]
    fn thousands_separated_values_are_exact() {
        let records = parse(&csv("2025-12-09,DBS,DBS19,MCAP,\"1,234,567.125\",\n"), KEY).unwrap();
        assert_eq!(records[0].value_numeric, Some(Decimal::from_str("1234567.125").unwrap()));
    }

    #[test]
    fn optional_columns_can_be_dropped_from_required_set() {
        let parser = FundDataParser::new(
            ParserConfig::default().with_required_columns(["Trade_Date", "stock", "ticker", "col_code"]),
        );
        let records = parser
            .parse(b"trade_date,stock,ticker,col_code,value_numeric\n2025-12-09,DBS,DBS19,CLOSE,38.5\n", KEY)
            .unwrap();
        assert_eq!(records[0].value_text, None);
        assert_eq!(records[0].value_numeric, Some(Decimal::from_str("38.5").unwrap()));
    }

    #[test]
    fn forced_encoding_reports_undecodable_bytes() {
        let parser = FundDataParser::new(ParserConfig {
            encoding_override: lookup_encoding("utf-8"),
            ..ParserConfig::default()
        });
        let mut bytes = csv("2025-12-09,Soci");
        let offset = bytes.len();
        bytes.extend_from_slice(b"\xE9t\xE9,SG1,CLOSE,1,\n");
        match parser.parse(&bytes, KEY) {
            Err(ParseError::Decode { start, end, .. }) => {
                assert_eq!(start, offset);
                assert_eq!(end, offset + 1);
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn overlong_source_key_is_rejected() {
        let key = "k".repeat(501);
        assert!(matches!(
            parse(&csv("2025-12-09,DBS,DBS19,CLOSE,1,\n"), &key),
            Err(ParseError::InvalidSourceKey { len: 501, max: 500 })
        ));
    }
}
