use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Source, UniprotId};
use crate::error::FetchFailure;

/// Marker used when a homology search finished without any usable hit.
pub const NO_SIGNIFICANT_HITS: &str = "no significant hits";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HomologyHit {
    pub accession: String,
    pub description: String,
    pub identity_pct: f64,
    pub evalue: f64,
    pub bit_score: f64,
    pub alignment_length: u64,
    pub hit_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidueCount {
    pub code: char,
    pub name: &'static str,
    pub count: u64,
    pub percent: f64,
}

/// A single annotation value.
///
/// `Unknown` means the source answered and the value does not exist; a field
/// whose source failed is absent from the record instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Integer(i64),
    List(Vec<String>),
    Hits(Vec<HomologyHit>),
    Composition(Vec<ResidueCount>),
    Unknown,
}

impl FieldValue {
    pub fn text_or_unknown(value: Option<String>) -> Self {
        match value {
            Some(text) if !text.trim().is_empty() => FieldValue::Text(text),
            _ => FieldValue::Unknown,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldValue::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    QuotaExceeded,
    NoSequence,
    SequenceTooShort,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::QuotaExceeded => write!(f, "quota_exceeded"),
            SkipReason::NoSequence => write!(f, "no_sequence"),
            SkipReason::SequenceTooShort => write!(f, "sequence_too_short"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PartialStatus {
    Ok,
    Partial,
    Failed { failure: FetchFailure },
    Skipped { reason: SkipReason },
}

impl PartialStatus {
    /// Whether the source produced data (possibly incomplete).
    pub fn is_success(&self) -> bool {
        matches!(self, PartialStatus::Ok | PartialStatus::Partial)
    }
}

/// Fields produced by one adapter for one identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialRecord {
    pub source: Source,
    pub status: PartialStatus,
    pub fields: BTreeMap<String, FieldValue>,
    pub warnings: Vec<String>,
    pub attempts: u32,
    pub fetched_at: DateTime<Utc>,
}

impl PartialRecord {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            status: PartialStatus::Ok,
            fields: BTreeMap::new(),
            warnings: Vec::new(),
            attempts: 1,
            fetched_at: Utc::now(),
        }
    }

    pub fn failed(source: Source, failure: FetchFailure) -> Self {
        Self {
            attempts: failure.attempts,
            status: PartialStatus::Failed { failure },
            ..Self::new(source)
        }
    }

    pub fn skipped(source: Source, reason: SkipReason) -> Self {
        Self {
            status: PartialStatus::Skipped { reason },
            attempts: 0,
            ..Self::new(source)
        }
    }

    pub fn insert(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        if self.status == PartialStatus::Ok {
            self.status = PartialStatus::Partial;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub value: FieldValue,
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub status: PartialStatus,
    pub attempts: u32,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Complete,
    Partial,
    Failed,
}

/// Everything known about one identifier after all enabled sources ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub identifier: UniprotId,
    pub status: RecordStatus,
    pub fields: BTreeMap<String, Field>,
    pub sources: BTreeMap<Source, SourceReport>,
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|field| &field.value)
    }

    pub fn source_status(&self, source: Source) -> Option<&PartialStatus> {
        self.sources.get(&source).map(|report| &report.status)
    }

    /// Compares data content, ignoring retrieval timestamps.
    pub fn same_content(&self, other: &Record) -> bool {
        self.identifier == other.identifier
            && self.status == other.status
            && self.fields == other.fields
            && self.missing == other.missing
            && self.sources.len() == other.sources.len()
            && self
                .sources
                .iter()
                .zip(other.sources.iter())
                .all(|((a_source, a), (b_source, b))| {
                    a_source == b_source && a.status == b.status
                })
    }
}
