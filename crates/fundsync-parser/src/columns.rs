//! Header validation and the typed intermediate row.

use std::collections::BTreeSet;

use csv::StringRecord;

use crate::ParseError;

pub const TRADE_DATE: &str = "trade_date";
pub const STOCK: &str = "stock";
pub const TICKER: &str = "ticker";
pub const COL_CODE: &str = "col_code";
pub const VALUE_NUMERIC: &str = "value_numeric";
pub const VALUE_TEXT: &str = "value_text";

pub const CANONICAL_COLUMNS: [&str; 6] = [TRADE_DATE, STOCK, TICKER, COL_CODE, VALUE_NUMERIC, VALUE_TEXT];

pub fn normalize_column_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Positions of the canonical columns within one file's header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    trade_date: Option<usize>,
    stock: Option<usize>,
    ticker: Option<usize>,
    col_code: Option<usize>,
    value_numeric: Option<usize>,
    value_text: Option<usize>,
}

impl ColumnIndex {
    /// Validates `headers` against `required` (already normalized) and maps
    /// the canonical columns. Unknown columns are ignored, even if repeated.
    pub fn from_headers(headers: &StringRecord, required: &[String]) -> Result<Self, ParseError> {
        let normalized: Vec<String> = headers.iter().map(normalize_column_name).collect();
        let present: BTreeSet<&str> = normalized.iter().map(String::as_str).collect();

        let missing: Vec<String> = required
            .iter()
            .filter(|name| !present.contains(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::Schema {
                missing,
                found: headers.iter().map(|h| h.trim().to_string()).collect(),
            });
        }

        let mut index = Self::default();
        let mut duplicates = Vec::new();
        for (pos, name) in normalized.iter().enumerate() {
            let Some(slot) = index.slot_mut(name) else {
                continue;
            };
            if slot.is_some() {
                if !duplicates.contains(name) {
                    duplicates.push(name.clone());
                }
                continue;
            }
            *slot = Some(pos);
        }
        if !duplicates.is_empty() {
            return Err(ParseError::DuplicateColumns { duplicates });
        }

        Ok(index)
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<usize>> {
        match name {
            TRADE_DATE => Some(&mut self.trade_date),
            STOCK => Some(&mut self.stock),
            TICKER => Some(&mut self.ticker),
            COL_CODE => Some(&mut self.col_code),
            VALUE_NUMERIC => Some(&mut self.value_numeric),
            VALUE_TEXT => Some(&mut self.value_text),
            _ => None,
        }
    }
}

/// One data row keyed by canonical column.
///
/// `None` means the column is not in the header or the row is too short;
/// `Some("")` means the cell exists but is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRow<'a> {
    pub trade_date: Option<&'a str>,
    pub stock: Option<&'a str>,
    pub ticker: Option<&'a str>,
    pub col_code: Option<&'a str>,
    pub value_numeric: Option<&'a str>,
    pub value_text: Option<&'a str>,
}

impl<'a> RawRow<'a> {
    pub fn from_record(record: &'a StringRecord, index: &ColumnIndex) -> Self {
        let cell = |pos: Option<usize>| pos.and_then(|p| record.get(p));
        Self {
            trade_date: cell(index.trade_date),
            stock: cell(index.stock),
            ticker: cell(index.ticker),
            col_code: cell(index.col_code),
            value_numeric: cell(index.value_numeric),
            value_text: cell(index.value_text),
        }
    }
}
