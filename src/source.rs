use std::time::Duration;

use crate::domain::{Source, UniprotId};
use crate::error::FetchFailure;
use crate::record::PartialRecord;

/// What an adapter gets to work with for one identifier.
#[derive(Debug, Clone)]
pub struct AdapterInput {
    pub id: UniprotId,
    /// Sequence from the identity lookup, once it has run.
    pub sequence: Option<String>,
}

impl AdapterInput {
    pub fn new(id: UniprotId) -> Self {
        Self { id, sequence: None }
    }
}

/// One source of per-protein data.
///
/// Implementations report every problem through [`FetchFailure`] and never
/// retry on their own; the pipeline wraps each call in a
/// [`RetryPolicy`](crate::retry::RetryPolicy).
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    fn fetch(&self, input: &AdapterInput, timeout: Duration) -> Result<PartialRecord, FetchFailure>;
}
