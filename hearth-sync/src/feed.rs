//! Change-feed wire records.
//!
//! Wire format: newline-delimited JSON, one record per line.
//! ```text
//! {"type":"change","table":"messages","op":"insert","key":"m1","row":{..},"cursor":41,"tx":7}
//! {"type":"up_to_date","cursor":41}
//! ```
//!
//! Transport frames do not align with lines; [`FeedDecoder`] buffers the
//! trailing partial line until the rest arrives. Blank lines are
//! keep-alives.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::Table;
use crate::store::Row;

/// Resume position in a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued position of a committed mutation in the change order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxMarker(pub u64);

impl fmt::Display for TxMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Primary key of a replicated row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One committed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub key: RowKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    pub cursor: Cursor,
    /// Transaction that produced the change, when the server knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<TxMarker>,
}

impl ChangeEvent {
    pub fn upsert(table: Table, op: ChangeOp, key: impl Into<RowKey>, row: Row, cursor: u64) -> Self {
        Self {
            table,
            op,
            key: key.into(),
            row: Some(row),
            cursor: Cursor(cursor),
            tx: None,
        }
    }

    pub fn delete(table: Table, key: impl Into<RowKey>, cursor: u64) -> Self {
        Self {
            table,
            op: ChangeOp::Delete,
            key: key.into(),
            row: None,
            cursor: Cursor(cursor),
            tx: None,
        }
    }

    pub fn with_tx(mut self, tx: u64) -> Self {
        self.tx = Some(TxMarker(tx));
        self
    }
}

impl From<String> for RowKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A decoded feed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRecord {
    Change(ChangeEvent),
    /// The server has sent everything up to `cursor`.
    UpToDate { cursor: Cursor },
}

impl FeedRecord {
    pub fn to_line(&self) -> Result<String, FeedError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| FeedError::Encode(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Check a record against the subscription it arrived on.
    pub fn validate(&self, table: Table, required_fields: &[String]) -> Result<(), FeedError> {
        let FeedRecord::Change(event) = self else {
            return Ok(());
        };
        if event.table != table {
            return Err(FeedError::TableMismatch {
                expected: table,
                found: event.table,
            });
        }
        if event.op == ChangeOp::Delete {
            return Ok(());
        }
        let row = event.row.as_ref().ok_or_else(|| FeedError::MissingRow {
            key: event.key.clone(),
        })?;
        match required_fields.iter().find(|field| !row.contains_key(field.as_str())) {
            Some(field) => Err(FeedError::MissingField {
                key: event.key.clone(),
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("malformed feed record: {0}")]
    Malformed(String),
    #[error("record for {found} on a {expected} subscription")]
    TableMismatch { expected: Table, found: Table },
    #[error("{key}: insert/update without a row")]
    MissingRow { key: RowKey },
    #[error("{key}: row is missing required field {field:?}")]
    MissingField { key: RowKey, field: String },
    #[error("could not encode feed record: {0}")]
    Encode(String),
}

/// Incremental newline-delimited JSON decoder.
#[derive(Debug, Default)]
pub struct FeedDecoder {
    pending: String,
}

impl FeedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns every record it completes.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<FeedRecord>, FeedError> {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Ok(Vec::new());
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| FeedError::Malformed(e.to_string()))
            })
            .collect()
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
