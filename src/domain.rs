use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static ACCESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[OPQ][0-9][A-Z0-9]{3}[0-9]|[A-NR-Z][0-9](?:[A-Z][A-Z0-9]{2}[0-9]){1,2})$")
        .expect("accession pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Empty,
    EmbeddedWhitespace,
    Pattern,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::Empty => write!(f, "empty identifier"),
            InvalidReason::EmbeddedWhitespace => write!(f, "contains whitespace"),
            InvalidReason::Pattern => write!(f, "not a UniProt accession"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid UniProt accession {raw:?}: {reason}")]
pub struct InvalidIdentifier {
    pub raw: String,
    pub reason: InvalidReason,
}

/// A syntactically valid UniProtKB accession (e.g. `P04637`, `A0A022YWF9`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UniprotId(String);

impl UniprotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniprotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniprotId {
    type Err = InvalidIdentifier;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let reject = |reason| InvalidIdentifier {
            raw: value.to_string(),
            reason,
        };
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(reject(InvalidReason::Empty));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(reject(InvalidReason::EmbeddedWhitespace));
        }
        if !ACCESSION_RE.is_match(trimmed) {
            return Err(reject(InvalidReason::Pattern));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for UniprotId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UniprotId> for String {
    fn from(value: UniprotId) -> Self {
        value.0
    }
}

/// Checks one raw identifier before it may enter the worklist.
pub fn validate(raw: &str) -> Result<UniprotId, InvalidIdentifier> {
    raw.parse()
}

/// The remote (or derived) source a piece of data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Identity,
    Physicochemical,
    Homology,
    Structure,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Identity => "identity",
            Source::Physicochemical => "physicochemical",
            Source::Homology => "homology",
            Source::Structure => "structure",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which analyses a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    pub identity: bool,
    pub physicochemical: bool,
    pub homology: bool,
    pub structure: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            identity: true,
            physicochemical: true,
            homology: false,
            structure: false,
        }
    }
}

impl AnalysisOptions {
    pub fn all() -> Self {
        Self {
            identity: true,
            physicochemical: true,
            homology: true,
            structure: true,
        }
    }

    pub fn is_enabled(&self, source: Source) -> bool {
        match source {
            Source::Identity => self.identity,
            Source::Physicochemical => self.physicochemical,
            Source::Homology => self.homology,
            Source::Structure => self.structure,
        }
    }

    pub fn any(&self) -> bool {
        self.identity || self.physicochemical || self.homology || self.structure
    }
}
