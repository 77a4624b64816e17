use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

/// Errors that abort a run or prevent one from starting.
///
/// Per-identifier problems never show up here: they are captured as
/// [`FetchFailure`] values inside the records.
#[derive(Debug, Error, Diagnostic)]
pub enum ProtmergeError {
    #[error("identifier list is empty")]
    #[diagnostic(help("pass accessions on the command line or list them under `identifiers`"))]
    EmptyWorklist,

    #[error("a pipeline run is already in progress")]
    RunInProgress,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing config file protmerge.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("failed to write output: {0}")]
    Output(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    NotFound,
    Parse,
    RateLimited,
    Timeout,
    QuotaExceeded,
}

impl FailureKind {
    /// Transient kinds are worth another attempt; the rest mean the data is
    /// absent or unreadable and repeating the request cannot change that.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Network | FailureKind::Timeout | FailureKind::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::NotFound => "not_found",
            FailureKind::Parse => "parse",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::QuotaExceeded => "quota_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single adapter call that did not produce data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} failure after {attempts} attempt(s): {detail}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub detail: String,
    pub attempts: u32,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            attempts: 1,
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, detail)
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Parse, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, detail)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Maps a non-success HTTP status onto the failure taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 404 | 410 => FailureKind::NotFound,
            429 => FailureKind::RateLimited,
            _ => FailureKind::Network,
        };
        Self::new(kind, format!("status {status}: {}", message.into()))
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::parse(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}
