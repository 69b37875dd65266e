//! Row model, provenance types and structured error types.
//!
//! Every layer of the acquisition pipeline speaks in terms of [`Row`]s and
//! [`DataError`]s. Rows carry no fixed schema: the shape is dataset-specific
//! and adapters downstream of this crate give them meaning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
}

impl Value {
    /// Interpret a raw delimited-table cell.
    ///
    /// Empty cells and the `NA` marker become `Null`; anything that parses as
    /// a finite number becomes `Number`, except zero-padded identifiers such
    /// as player ids (`0033873`), which stay `Text` so the padding survives.
    pub fn from_cell(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.is_empty() || cell == "NA" {
            return Value::Null;
        }
        if is_zero_padded(cell) {
            return Value::Text(cell.to_string());
        }
        match cell.parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::Text(cell.to_string()),
        }
    }

    /// Convert a JSON scalar. Arrays and objects are not scalars and yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Text(b.to_string())),
            serde_json::Value::Number(n) => Some(n.as_f64().map_or(Value::Null, Value::Number)),
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64()
            .filter(|n| n.fract() == 0.0)
            .map(|n| n as i64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

fn is_zero_padded(cell: &str) -> bool {
    let digits = cell.strip_prefix(['-', '+']).unwrap_or(cell).as_bytes();
    digits.len() > 1 && digits[0] == b'0' && digits[1].is_ascii_digit()
}

/// One record of a delimited table, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Render a season key for logs and error messages (`None` is the ALL key).
pub fn season_label(season: Option<i32>) -> String {
    season.map_or_else(|| "ALL".to_string(), |s| s.to_string())
}

/// Structured error types for acquisition operations.
///
/// Errors are `Clone` because a single in-flight load is shared by every
/// caller waiting on the same cache key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("manifest unavailable for tag '{tag}': {reason}")]
    ManifestUnavailable { tag: String, reason: String },

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("transient network error for {url}: {reason}")]
    TransientNetwork { url: String, reason: String },

    #[error("malformed payload from {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error(
        "sanity check failed for {dataset} season {season}: {rows} rows, expected at least {threshold}"
    )]
    SanityCheckFailed {
        dataset: String,
        season: String,
        rows: usize,
        threshold: usize,
    },

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("no usable source for {dataset} season {season}")]
    NoSource { dataset: String, season: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// Whether the retrying transport should attempt the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::TransientNetwork { .. })
    }

    /// A 404 means "try the next candidate", never "retry this one".
    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound { .. })
    }
}

/// Where a resolved table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    /// Manifest entry for the exact requested season.
    Manifest,
    /// Last manifest entry, used when no season-specific asset exists.
    ManifestLatest,
    /// The dataset's static URL template (also the "live" endpoint).
    Static,
    /// The feature-flagged secondary provider.
    Alternate,
}

impl SourceOrigin {
    pub fn is_manifest(self) -> bool {
        matches!(self, SourceOrigin::Manifest | SourceOrigin::ManifestLatest)
    }
}

/// A concrete location selected for a (dataset, season) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub name: String,
    pub season: Option<i32>,
    pub origin: SourceOrigin,
}

/// A decoded, validated table for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub name: String,
    pub season: Option<i32>,
    pub rows: Vec<Row>,
    /// BLAKE3 hex digest over the decompressed payload.
    pub checksum: String,
    pub source: ResolvedSource,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
