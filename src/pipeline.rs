use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::aggregate;
use crate::blast::{BlastClient, HomologyAdapter, HomologySettings};
use crate::clock::Clock;
use crate::domain::{AnalysisOptions, InvalidIdentifier, Source, UniprotId, validate};
use crate::error::{FailureKind, ProtmergeError};
use crate::governor::{BudgetSnapshot, RateGovernor, RatePolicy};
use crate::progress::{ProgressReporter, ProgressSink, Severity, Stage};
use crate::protparam::PhysicochemicalAdapter;
use crate::rcsb::{RcsbClient, StructureAdapter, StructureSettings};
use crate::record::{FieldValue, PartialRecord, PartialStatus, Record, RecordStatus, SkipReason};
use crate::retry::RetryPolicy;
use crate::source::{AdapterInput, SourceAdapter};
use crate::uniprot::{IdentityAdapter, SEQUENCE, UniprotClient};

/// Cooperative stop signal shared between the caller and the workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Validating,
    Processing,
    Cancelling,
    Done,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub options: AnalysisOptions,
    pub workers: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub homology: HomologySettings,
    pub structure: StructureSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            options: AnalysisOptions::default(),
            workers: 4,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            homology: HomologySettings::default(),
            structure: StructureSettings::default(),
        }
    }
}

/// One validated identifier and its position among the valid inputs.
///
/// Retry counts end up on each source report of the merged record.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub position: usize,
    pub id: UniprotId,
    pub options: AnalysisOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub invalid: Vec<InvalidIdentifier>,
    pub cancelled: Vec<UniprotId>,
    /// Records whose homology search was skipped for lack of quota.
    pub homology_skipped: usize,
    pub homology_budget: Option<BudgetSnapshot>,
    pub final_state: PipelineState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutput {
    pub records: Vec<Record>,
    pub summary: RunSummary,
}

enum ItemOutcome {
    Merged(Record),
    Cancelled,
}

/// Runs identifiers through every enabled source and merges the results.
pub struct Pipeline<U: UniprotClient, B: BlastClient, R: RcsbClient> {
    identity: IdentityAdapter<U>,
    physicochemical: PhysicochemicalAdapter,
    homology: HomologyAdapter<B>,
    structure: StructureAdapter<R>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    state: Mutex<PipelineState>,
}

impl<U: UniprotClient, B: BlastClient, R: RcsbClient> Pipeline<U, B, R> {
    /// `governor` paces NCBI; RCSB requests get their own spacing from
    /// `settings.structure`.
    pub fn new(
        uniprot: U,
        blast: B,
        rcsb: R,
        governor: Arc<RateGovernor>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        let homology = HomologyAdapter::new(
            blast,
            governor,
            Arc::clone(&clock),
            settings.homology.clone(),
        );
        let rcsb_pacer = RateGovernor::new(
            RatePolicy {
                min_spacing: settings.structure.spacing,
                daily_ceiling: usize::MAX,
                ..RatePolicy::default()
            },
            Arc::clone(&clock),
        );
        let structure = StructureAdapter::new(rcsb, Arc::new(rcsb_pacer), settings.structure.clone());
        Self {
            identity: IdentityAdapter::new(uniprot),
            physicochemical: PhysicochemicalAdapter,
            homology,
            structure,
            clock,
            settings,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Processes `raw_ids` and returns one record per valid identifier that
    /// finished before cancellation, in input order.
    pub fn run<S: AsRef<str>>(
        &self,
        raw_ids: &[S],
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunOutput, ProtmergeError> {
        let _guard = self.begin()?;
        if raw_ids.is_empty() {
            return Err(ProtmergeError::EmptyWorklist);
        }
        if !self.settings.options.any() {
            return Err(ProtmergeError::InvalidConfig(
                "no analysis is enabled".to_string(),
            ));
        }

        let reporter = ProgressReporter::new(sink, raw_ids.len());
        let mut invalid = Vec::new();
        let mut items = Vec::new();
        for raw in raw_ids {
            match validate(raw.as_ref()) {
                Ok(id) => {
                    reporter.stage(Stage::Validate, id.as_str(), "accession accepted");
                    items.push(WorkItem {
                        position: items.len(),
                        id,
                        options: self.settings.options,
                    });
                }
                Err(err) => {
                    tracing::warn!(raw = raw.as_ref(), reason = %err.reason, "rejected identifier");
                    reporter.finish(Stage::Rejected, raw.as_ref(), err.to_string(), Severity::Warning);
                    invalid.push(err);
                }
            }
        }
        tracing::info!(valid = items.len(), invalid = invalid.len(), "identifiers validated");

        self.set_state(PipelineState::Processing);
        let outcomes = self.process_all(&items, cancel, &reporter);

        let mut records = Vec::new();
        let mut cancelled = Vec::new();
        for (item, outcome) in items.iter().zip(outcomes) {
            match outcome {
                Some(ItemOutcome::Merged(record)) => records.push(record),
                Some(ItemOutcome::Cancelled) | None => cancelled.push(item.id.clone()),
            }
        }

        let summary = RunSummary {
            total: raw_ids.len(),
            complete: count_status(&records, RecordStatus::Complete),
            partial: count_status(&records, RecordStatus::Partial),
            failed: count_status(&records, RecordStatus::Failed),
            homology_skipped: records
                .iter()
                .filter(|record| {
                    matches!(
                        record.source_status(Source::Homology),
                        Some(PartialStatus::Skipped {
                            reason: SkipReason::QuotaExceeded
                        })
                    )
                })
                .count(),
            homology_budget: self
                .settings
                .options
                .homology
                .then(|| self.homology.governor().snapshot()),
            invalid,
            cancelled,
            final_state: PipelineState::Done,
        };
        reporter.summary(format!(
            "{} complete, {} partial, {} failed, {} invalid, {} cancelled",
            summary.complete,
            summary.partial,
            summary.failed,
            summary.invalid.len(),
            summary.cancelled.len()
        ));
        tracing::info!(
            complete = summary.complete,
            partial = summary.partial,
            failed = summary.failed,
            invalid = summary.invalid.len(),
            cancelled = summary.cancelled.len(),
            "run finished"
        );

        Ok(RunOutput { records, summary })
    }

    fn begin(&self) -> Result<RunGuard<'_>, ProtmergeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            PipelineState::Idle | PipelineState::Done => {
                *state = PipelineState::Validating;
                tracing::info!("pipeline validating");
                Ok(RunGuard { state: &self.state })
            }
            _ => Err(ProtmergeError::RunInProgress),
        }
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if previous != next {
            tracing::info!(from = ?previous, to = ?next, "pipeline state");
            *state = next;
        }
    }

    fn process_all(
        &self,
        items: &[WorkItem],
        cancel: &CancellationToken,
        reporter: &ProgressReporter<'_>,
    ) -> Vec<Option<ItemOutcome>> {
        let mut slots: Vec<Option<ItemOutcome>> = items.iter().map(|_| None).collect();
        if items.is_empty() {
            return slots;
        }

        let next = AtomicUsize::new(0);
        let quota_exhausted = AtomicBool::new(false);
        let workers = self.settings.workers.clamp(1, items.len());
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let quota_exhausted = &quota_exhausted;
                scope.spawn(move || {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(item) = items.get(index) else {
                            break;
                        };
                        let outcome = self.process_item(item, cancel, reporter, quota_exhausted);
                        if tx.send((item.position, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (position, outcome) in rx {
                slots[position] = Some(outcome);
            }
        });

        slots
    }

    fn process_item(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
        reporter: &ProgressReporter<'_>,
        quota_exhausted: &AtomicBool,
    ) -> ItemOutcome {
        let id = item.id.as_str();
        let options = item.options;
        if self.check_cancelled(cancel) {
            return self.cancel_item(id, reporter);
        }

        let mut input = AdapterInput::new(item.id.clone());
        let mut partials = Vec::new();

        reporter.stage(Stage::Identity, id, "querying UniProt");
        let identity = self.call(&self.identity, &input);
        input.sequence = identity
            .get(SEQUENCE)
            .and_then(FieldValue::as_text)
            .map(str::to_string);
        if options.identity {
            partials.push(identity);
        }

        if options.physicochemical {
            if self.check_cancelled(cancel) {
                return self.cancel_item(id, reporter);
            }
            reporter.stage(Stage::Physicochemical, id, "computing parameters");
            partials.push(self.call(&self.physicochemical, &input));
        }

        if options.homology {
            if self.check_cancelled(cancel) {
                return self.cancel_item(id, reporter);
            }
            partials.push(self.homology_partial(&input, reporter, quota_exhausted));
        }

        if options.structure {
            if self.check_cancelled(cancel) {
                return self.cancel_item(id, reporter);
            }
            reporter.stage(Stage::Structure, id, "searching PDB entries");
            partials.push(self.call(&self.structure, &input));
        }

        let record = aggregate::merge(&item.id, partials);
        let (message, severity) = match record.status {
            RecordStatus::Complete => ("complete".to_string(), Severity::Info),
            RecordStatus::Partial => (
                format!("partial: {}", record.missing.join("; ")),
                Severity::Warning,
            ),
            RecordStatus::Failed => (
                format!("failed: {}", record.missing.join("; ")),
                Severity::Error,
            ),
        };
        reporter.finish(Stage::Merged, id, message, severity);
        ItemOutcome::Merged(record)
    }

    fn homology_partial(
        &self,
        input: &AdapterInput,
        reporter: &ProgressReporter<'_>,
        quota_exhausted: &AtomicBool,
    ) -> PartialRecord {
        let id = input.id.as_str();
        if quota_exhausted.load(Ordering::SeqCst) {
            reporter.warn(Stage::Homology, id, "skipped: daily search quota exhausted");
            return PartialRecord::skipped(Source::Homology, SkipReason::QuotaExceeded);
        }

        reporter.stage(Stage::Homology, id, "submitting BLAST search");
        let partial = self.call(&self.homology, input);
        match &partial.status {
            PartialStatus::Failed { failure } if failure.kind == FailureKind::QuotaExceeded => {
                quota_exhausted.store(true, Ordering::SeqCst);
                tracing::warn!(id, detail = %failure.detail, "homology quota exhausted");
                reporter.warn(Stage::Homology, id, "skipped: daily search quota exhausted");
                let mut skipped = PartialRecord::skipped(Source::Homology, SkipReason::QuotaExceeded);
                skipped.warn(failure.detail.clone());
                skipped
            }
            _ => partial,
        }
    }

    /// One adapter call under the retry policy. Never fails: a terminal
    /// failure becomes a failed partial.
    fn call(&self, adapter: &dyn SourceAdapter, input: &AdapterInput) -> PartialRecord {
        let source = adapter.source();
        let mut attempts = 0;
        let result = self.settings.retry.run(self.clock.as_ref(), |attempt| {
            attempts = attempt;
            adapter.fetch(input, self.settings.timeout)
        });
        match result {
            Ok(mut partial) => {
                if !matches!(partial.status, PartialStatus::Skipped { .. }) {
                    partial.attempts = attempts;
                }
                partial
            }
            Err(failure) => {
                tracing::warn!(
                    id = %input.id,
                    source = %source,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    "source failed: {}",
                    failure.detail
                );
                PartialRecord::failed(source, failure)
            }
        }
    }

    fn check_cancelled(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == PipelineState::Processing {
                tracing::info!("pipeline cancelling");
                *state = PipelineState::Cancelling;
            }
            return true;
        }
        false
    }

    fn cancel_item(&self, id: &str, reporter: &ProgressReporter<'_>) -> ItemOutcome {
        reporter.finish(Stage::Cancelled, id, "cancelled", Severity::Warning);
        ItemOutcome::Cancelled
    }
}

/// Returns the pipeline to `Done` however the run ends.
struct RunGuard<'a> {
    state: &'a Mutex<PipelineState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = PipelineState::Done;
    }
}

fn count_status(records: &[Record], status: RecordStatus) -> usize {
    records.iter().filter(|record| record.status == status).count()
}
