//! Core domain model for the nuclear infrastructure ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "nuketrack-core";

/// Absolute floor for numeric change detection.
pub const FLOAT_ABS_TOLERANCE: f64 = 1e-6;
/// Relative tolerance applied to the larger magnitude of the two values.
pub const FLOAT_REL_TOLERANCE: f64 = 1e-9;

/// Lifecycle state of one ingestion-script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown run status `{0}`")]
pub struct ParseRunStatusError(pub String);

impl FromStr for RunStatus {
    type Err = ParseRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            other => Err(ParseRunStatusError(other.to_string())),
        }
    }
}

/// Per-run record counters written when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl RunCounts {
    pub fn observe(&mut self, result: &UpsertResult) {
        self.processed += 1;
        if result.inserted {
            self.inserted += 1;
        } else if result.updated {
            self.updated += 1;
        }
    }
}

/// Append-only audit row for one ingestion-script execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub id: i64,
    pub script_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub error_message: Option<String>,
}

/// One detected field-level change on an existing entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    pub id: i64,
    pub run_log_id: Option<i64>,
    pub entity_type: String,
    pub entity_id: i64,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
    pub notified: bool,
}

/// Scalar column value as seen by the upsert layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view of the value; text is trimmed and parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Stringified form recorded in `data_changes`.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Real(v) => Some(v.to_string()),
            FieldValue::Text(s) => Some(s.trim().to_string()),
        }
    }

    /// Type-aware equality used for change detection.
    ///
    /// Null only equals Null (so Null and an empty string differ), text is
    /// compared trimmed, and anything numeric on both sides is compared with
    /// [`numbers_match`].
    pub fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (FieldValue::Text(a), FieldValue::Text(b)) => a.trim() == b.trim(),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => numbers_match(a, b),
                _ => self.render() == other.render(),
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

pub fn numbers_match(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= FLOAT_ABS_TOLERANCE.max(FLOAT_REL_TOLERANCE * scale)
}

/// Incoming row payload identified by its natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub natural_key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.fields.insert(field.to_string(), value.into());
    }
}

/// A domain table the upsert layer can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTable {
    pub table: &'static str,
    pub entity_type: &'static str,
    pub key_column: &'static str,
}

impl EntityTable {
    pub const fn new(table: &'static str, entity_type: &'static str, key_column: &'static str) -> Self {
        Self {
            table,
            entity_type,
            key_column,
        }
    }
}

pub const SITES: EntityTable = EntityTable::new("sites", "site", "name");
pub const REACTORS: EntityTable = EntityTable::new("reactors", "reactor", "nrc_docket_number");
pub const COMPANIES: EntityTable = EntityTable::new("companies", "company", "name");
pub const CONTRACTS: EntityTable = EntityTable::new("contracts", "contract", "award_id");
pub const REGULATORY_EVENTS: EntityTable =
    EntityTable::new("regulatory_events", "regulatory_event", "source_url");
pub const COMMODITY_PRICES: EntityTable =
    EntityTable::new("commodity_prices", "commodity_price", "price_key");
/// Keyed by the owning site's id: one fund row per site.
pub const TRUST_FUNDS: EntityTable =
    EntityTable::new("decommissioning_trust_funds", "trust_fund", "site_id");

/// A single differing field reported by an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: String,
}

/// Outcome of one upsert call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub entity_id: i64,
    pub inserted: bool,
    pub updated: bool,
    pub changed_fields: Vec<FieldChange>,
}

impl UpsertResult {
    pub fn is_noop(&self) -> bool {
        !self.inserted && !self.updated
    }
}
