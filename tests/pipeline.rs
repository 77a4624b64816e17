use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use protmerge::blast::{BlastClient, PollStatus, TOP_HIT_DESCRIPTION};
use protmerge::clock::{Clock, ManualClock};
use protmerge::domain::{AnalysisOptions, Source, UniprotId};
use protmerge::error::{FailureKind, FetchFailure, ProtmergeError};
use protmerge::governor::{RateGovernor, RatePolicy};
use protmerge::pipeline::{CancellationToken, Pipeline, PipelineSettings, PipelineState};
use protmerge::progress::{NoopSink, ProgressEvent, ProgressSink, Stage};
use protmerge::protparam::MOLECULAR_WEIGHT;
use protmerge::rcsb::{BEST_STRUCTURE, RcsbClient, STRUCTURE_COUNT};
use protmerge::record::{PartialStatus, RecordStatus, SkipReason};
use protmerge::uniprot::{GENE_NAME, ORGANISM, SEQUENCE, UniprotClient};

const ACCESSIONS: [&str; 10] = [
    "P04637", "P69905", "Q9H0H5", "O15530", "P01308", "P68871", "P00533", "P38398", "Q00987",
    "P10415",
];

#[derive(Default)]
struct MockUniprot {
    entries: HashMap<String, serde_json::Value>,
    delays: HashMap<String, Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockUniprot {
    fn with_fixture(ids: &[&str]) -> Self {
        let raw = fs::read_to_string("tests/fixtures/uniprot_P04637.json").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        Self {
            entries: ids
                .iter()
                .map(|id| (id.to_string(), value.clone()))
                .collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

impl UniprotClient for MockUniprot {
    fn fetch_entry(&self, id: &UniprotId, _timeout: Duration) -> Result<serde_json::Value, FetchFailure> {
        self.calls.lock().unwrap().push(id.to_string());
        if let Some(delay) = self.delays.get(id.as_str()) {
            thread::sleep(*delay);
        }
        self.entries
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| FetchFailure::from_status(404, format!("{id} not found")))
    }
}

struct MockBlast {
    report: Option<String>,
    submits: Arc<AtomicUsize>,
}

impl MockBlast {
    fn with_report() -> Self {
        Self {
            report: Some(fs::read_to_string("tests/fixtures/blast_P04637.xml").unwrap()),
            submits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn unreachable() -> Self {
        Self {
            report: None,
            submits: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BlastClient for MockBlast {
    fn submit(&self, _sequence: &str, _timeout: Duration) -> Result<String, FetchFailure> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        match self.report {
            Some(_) => Ok("RID".to_string()),
            None => Err(FetchFailure::network("connection refused")),
        }
    }

    fn poll(&self, _rid: &str, _timeout: Duration) -> Result<PollStatus, FetchFailure> {
        Ok(PollStatus::Ready { has_hits: true })
    }

    fn fetch_report(&self, _rid: &str, _timeout: Duration) -> Result<String, FetchFailure> {
        self.report
            .clone()
            .ok_or_else(|| FetchFailure::network("connection refused"))
    }
}

/// Two p53 entries; any other accession has none.
#[derive(Default)]
struct MockRcsb {
    searches: Arc<AtomicUsize>,
}

impl RcsbClient for MockRcsb {
    fn search_entries(&self, id: &UniprotId, _timeout: Duration) -> Result<Vec<String>, FetchFailure> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if id.as_str() == "P04637" {
            Ok(vec!["2OCJ".to_string(), "1TSR".to_string()])
        } else {
            Ok(Vec::new())
        }
    }

    fn fetch_entry(&self, pdb_id: &str, _timeout: Duration) -> Result<serde_json::Value, FetchFailure> {
        let resolution = if pdb_id == "1TSR" { 2.2 } else { 2.05 };
        Ok(serde_json::json!({
            "struct": {"title": format!("{pdb_id} p53 core domain")},
            "exptl": [{"method": "X-RAY DIFFRACTION"}],
            "rcsb_entry_info": {"resolution_combined": [resolution]}
        }))
    }
}

/// Records when each BLAST request reaches the service.
struct TimedBlast {
    clock: Arc<ManualClock>,
    requests: Arc<Mutex<Vec<(&'static str, Duration)>>>,
    report: String,
}

impl TimedBlast {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            requests: Arc::new(Mutex::new(Vec::new())),
            report: fs::read_to_string("tests/fixtures/blast_P04637.xml").unwrap(),
        }
    }

    fn log(&self, kind: &'static str) {
        self.requests.lock().unwrap().push((kind, self.clock.elapsed()));
    }
}

impl BlastClient for TimedBlast {
    fn submit(&self, _sequence: &str, _timeout: Duration) -> Result<String, FetchFailure> {
        self.log("submit");
        Ok("RID".to_string())
    }

    fn poll(&self, _rid: &str, _timeout: Duration) -> Result<PollStatus, FetchFailure> {
        self.log("poll");
        Ok(PollStatus::Ready { has_hits: true })
    }

    fn fetch_report(&self, _rid: &str, _timeout: Duration) -> Result<String, FetchFailure> {
        self.log("fetch");
        Ok(self.report.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Cancels the run once `after` items have merged.
struct CancelAfter {
    token: CancellationToken,
    after: usize,
    merged: AtomicUsize,
    inner: RecordingSink,
}

impl ProgressSink for CancelAfter {
    fn event(&self, event: ProgressEvent) {
        if event.stage == Stage::Merged && self.merged.fetch_add(1, Ordering::SeqCst) + 1 == self.after
        {
            self.token.cancel();
        }
        self.inner.event(event);
    }
}

fn settings(options: AnalysisOptions, workers: usize) -> PipelineSettings {
    PipelineSettings {
        options,
        workers,
        timeout: Duration::from_secs(5),
        ..PipelineSettings::default()
    }
}

fn pipeline(
    uniprot: MockUniprot,
    blast: MockBlast,
    options: AnalysisOptions,
    workers: usize,
) -> Pipeline<MockUniprot, MockBlast, MockRcsb> {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), Arc::clone(&clock)));
    Pipeline::new(
        uniprot,
        blast,
        MockRcsb::default(),
        governor,
        clock,
        settings(options, workers),
    )
}

fn homology_without_structure() -> AnalysisOptions {
    AnalysisOptions {
        structure: false,
        ..AnalysisOptions::all()
    }
}

#[test]
fn p53_with_every_analysis_is_complete() {
    let pipeline = pipeline(
        MockUniprot::with_fixture(&["P04637"]),
        MockBlast::with_report(),
        AnalysisOptions::all(),
        2,
    );
    let sink = RecordingSink::default();
    let output = pipeline
        .run(&["P04637"], &CancellationToken::new(), &sink)
        .unwrap();

    assert_eq!(output.records.len(), 1);
    let record = &output.records[0];
    assert_eq!(record.identifier.as_str(), "P04637");
    assert_eq!(record.status, RecordStatus::Complete);
    assert!(record.missing.is_empty());
    assert_eq!(record.value(ORGANISM).and_then(|v| v.as_text()), Some("Homo sapiens"));
    assert_eq!(record.value(GENE_NAME).and_then(|v| v.as_text()), Some("TP53"));
    assert!(record.value(SEQUENCE).and_then(|v| v.as_text()).is_some());
    assert!(record.value(MOLECULAR_WEIGHT).and_then(|v| v.as_number()).unwrap() > 0.0);
    assert_eq!(record.field(MOLECULAR_WEIGHT).unwrap().source, Source::Physicochemical);
    assert!(record.value(TOP_HIT_DESCRIPTION).and_then(|v| v.as_text()).is_some());
    assert_eq!(record.value(STRUCTURE_COUNT).and_then(|v| v.as_number()), Some(2.0));
    assert_eq!(record.value(BEST_STRUCTURE).and_then(|v| v.as_text()), Some("2OCJ"));
    assert_eq!(record.field(STRUCTURE_COUNT).unwrap().source, Source::Structure);
    assert_eq!(record.sources.len(), 4);

    assert_eq!(output.summary.complete, 1);
    assert_eq!(output.summary.final_state, PipelineState::Done);
    assert_eq!(output.summary.homology_budget.unwrap().used, 1);
    assert_eq!(pipeline.state(), PipelineState::Done);

    let events = sink.events();
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Summary);
    assert_eq!(last.completed_count, 1);
    let stages: Vec<Stage> = events.iter().map(|event| event.stage).collect();
    assert!(stages.contains(&Stage::Identity));
    assert!(stages.contains(&Stage::Physicochemical));
    assert!(stages.contains(&Stage::Homology));
}

#[test]
fn malformed_identifier_is_rejected_without_calls() {
    let uniprot = MockUniprot::with_fixture(&["P04637"]);
    let calls = uniprot.calls();
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::all(), 2);
    let sink = RecordingSink::default();
    let output = pipeline
        .run(&["not-an-id"], &CancellationToken::new(), &sink)
        .unwrap();

    assert!(output.records.is_empty());
    assert_eq!(output.summary.invalid.len(), 1);
    assert_eq!(output.summary.invalid[0].raw, "not-an-id");
    assert_eq!(output.summary.total, 1);

    let events = sink.events();
    assert_eq!(events[0].stage, Stage::Rejected);
    assert_eq!(events[0].identifier.as_deref(), Some("not-an-id"));
    assert_eq!(events.last().unwrap().stage, Stage::Summary);
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn invalid_identifiers_do_not_stop_valid_ones() {
    let uniprot = MockUniprot::with_fixture(&["P04637"]);
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::default(), 2);
    let output = pipeline
        .run(&["p04637", " P04637 "], &CancellationToken::new(), &NoopSink)
        .unwrap();
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.summary.invalid.len(), 1);
}

#[test]
fn exhausted_quota_skips_homology_only() {
    let clock = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), clock.clone()));
    for _ in 0..100 {
        governor.acquire_slot().unwrap();
    }
    let blast = MockBlast::with_report();
    let submits = Arc::clone(&blast.submits);
    let pipeline = Pipeline::new(
        MockUniprot::with_fixture(&ACCESSIONS[..3]),
        blast,
        MockRcsb::default(),
        governor,
        clock,
        settings(AnalysisOptions::all(), 2),
    );

    let output = pipeline
        .run(&ACCESSIONS[..3], &CancellationToken::new(), &NoopSink)
        .unwrap();

    assert_eq!(output.records.len(), 3);
    for record in &output.records {
        assert_eq!(
            record.source_status(Source::Homology),
            Some(&PartialStatus::Skipped {
                reason: SkipReason::QuotaExceeded
            })
        );
        assert_eq!(record.source_status(Source::Identity), Some(&PartialStatus::Ok));
        assert_eq!(record.source_status(Source::Physicochemical), Some(&PartialStatus::Ok));
        assert_eq!(record.status, RecordStatus::Partial);
        assert!(record.missing.iter().any(|m| m.contains("quota_exceeded")));
    }
    assert_eq!(output.summary.homology_skipped, 3);
    assert_eq!(submits.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_after_three_of_ten() {
    let uniprot = MockUniprot::with_fixture(&ACCESSIONS);
    let calls = uniprot.calls();
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::default(), 1);
    let token = CancellationToken::new();
    let sink = CancelAfter {
        token: token.clone(),
        after: 3,
        merged: AtomicUsize::new(0),
        inner: RecordingSink::default(),
    };

    let output = pipeline.run(&ACCESSIONS, &token, &sink).unwrap();

    let ids: Vec<&str> = output.records.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, ACCESSIONS[..3].to_vec());
    assert_eq!(output.summary.cancelled.len(), 7);
    assert_eq!(output.summary.cancelled[0].as_str(), ACCESSIONS[3]);
    assert_eq!(output.summary.final_state, PipelineState::Done);
    assert_eq!(pipeline.state(), PipelineState::Done);

    let events = sink.inner.events();
    let cancelled = events
        .iter()
        .filter(|event| event.stage == Stage::Cancelled)
        .count();
    assert_eq!(cancelled, 7);
    let terminal = events.iter().filter(|event| event.stage.is_terminal()).count();
    assert_eq!(terminal, 10);
    assert_eq!(events.last().unwrap().completed_count, 10);
    assert_eq!(*calls.lock().unwrap(), ACCESSIONS[..3].to_vec());
}

#[test]
fn records_follow_input_order() {
    let mut uniprot = MockUniprot::with_fixture(&ACCESSIONS);
    for (index, id) in ACCESSIONS.iter().enumerate() {
        let delay = Duration::from_millis(((ACCESSIONS.len() - index) * 5) as u64);
        uniprot.delays.insert(id.to_string(), delay);
    }
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::default(), 4);
    let output = pipeline
        .run(&ACCESSIONS, &CancellationToken::new(), &NoopSink)
        .unwrap();

    let ids: Vec<&str> = output.records.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, ACCESSIONS.to_vec());
}

#[test]
fn failing_source_does_not_hide_other_fields() {
    let pipeline = pipeline(
        MockUniprot::with_fixture(&["P04637"]),
        MockBlast::unreachable(),
        AnalysisOptions::all(),
        1,
    );
    let output = pipeline
        .run(&["P04637"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    let record = &output.records[0];
    assert_eq!(record.status, RecordStatus::Partial);
    assert!(record.value(ORGANISM).is_some());
    assert!(record.value(MOLECULAR_WEIGHT).is_some());
    assert!(record.value(TOP_HIT_DESCRIPTION).is_none());
    assert_matches!(
        record.source_status(Source::Homology),
        Some(PartialStatus::Failed { failure }) if failure.kind == FailureKind::Network && failure.attempts == 3
    );
    assert!(record.missing.iter().any(|m| m.starts_with("homology: failed")));
}

#[test]
fn unknown_accession_fails_identity_and_skips_parameters() {
    let uniprot = MockUniprot::with_fixture(&[]);
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::default(), 1);
    let output = pipeline
        .run(&["P69905"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    let record = &output.records[0];
    assert_eq!(record.status, RecordStatus::Failed);
    assert_matches!(
        record.source_status(Source::Identity),
        Some(PartialStatus::Failed { failure }) if failure.kind == FailureKind::NotFound && failure.attempts == 1
    );
    assert_eq!(
        record.source_status(Source::Physicochemical),
        Some(&PartialStatus::Skipped {
            reason: SkipReason::NoSequence
        })
    );
    assert_eq!(output.summary.failed, 1);
}

#[test]
fn identity_lookup_still_feeds_parameters_when_disabled() {
    let uniprot = MockUniprot::with_fixture(&["P04637"]);
    let options = AnalysisOptions {
        identity: false,
        physicochemical: true,
        homology: false,
        structure: false,
    };
    let pipeline = pipeline(uniprot, MockBlast::with_report(), options, 1);
    let output = pipeline
        .run(&["P04637"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    let record = &output.records[0];
    assert_eq!(record.status, RecordStatus::Complete);
    assert!(record.value(ORGANISM).is_none());
    assert!(record.value(MOLECULAR_WEIGHT).is_some());
    assert!(record.source_status(Source::Identity).is_none());
}

#[test]
fn repeated_runs_produce_equal_records() {
    let pipeline = pipeline(
        MockUniprot::with_fixture(&ACCESSIONS[..4]),
        MockBlast::with_report(),
        AnalysisOptions::all(),
        3,
    );
    let first = pipeline
        .run(&ACCESSIONS[..4], &CancellationToken::new(), &NoopSink)
        .unwrap();
    let second = pipeline
        .run(&ACCESSIONS[..4], &CancellationToken::new(), &NoopSink)
        .unwrap();

    assert_eq!(first.records.len(), second.records.len());
    for (a, b) in first.records.iter().zip(&second.records) {
        assert!(a.same_content(b));
    }
}

#[test]
fn empty_worklist_is_an_error() {
    let uniprot = MockUniprot::with_fixture(&["P04637"]);
    let pipeline = pipeline(uniprot, MockBlast::with_report(), AnalysisOptions::default(), 1);
    let ids: [&str; 0] = [];
    let err = pipeline
        .run(&ids, &CancellationToken::new(), &NoopSink)
        .unwrap_err();
    assert_matches!(err, ProtmergeError::EmptyWorklist);
}

struct Reentrant<'a> {
    pipeline: &'a Pipeline<MockUniprot, MockBlast, MockRcsb>,
    nested: Mutex<Vec<bool>>,
}

impl ProgressSink for Reentrant<'_> {
    fn event(&self, _event: ProgressEvent) {
        let result = self
            .pipeline
            .run(&["P04637"], &CancellationToken::new(), &NoopSink);
        self.nested
            .lock()
            .unwrap()
            .push(matches!(result, Err(ProtmergeError::RunInProgress)));
    }
}

#[test]
fn second_run_while_busy_is_refused() {
    let pipeline = pipeline(
        MockUniprot::with_fixture(&["P04637"]),
        MockBlast::with_report(),
        AnalysisOptions::default(),
        1,
    );
    let sink = Reentrant {
        pipeline: &pipeline,
        nested: Mutex::new(Vec::new()),
    };
    pipeline
        .run(&["P04637"], &CancellationToken::new(), &sink)
        .unwrap();

    let nested = sink.nested.into_inner().unwrap();
    assert!(!nested.is_empty());
    assert!(nested.iter().all(|refused| *refused));
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[test]
fn blast_requests_keep_their_spacing_across_items() {
    let clock = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), clock.clone()));
    let blast = TimedBlast::new(clock.clone());
    let requests = Arc::clone(&blast.requests);
    let pipeline = Pipeline::new(
        MockUniprot::with_fixture(&["P04637", "P69905"]),
        blast,
        MockRcsb::default(),
        governor,
        clock.clone(),
        settings(homology_without_structure(), 1),
    );

    pipeline
        .run(&["P04637", "P69905"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    let secs = |s: u64| Duration::from_secs(s);
    assert_eq!(
        *requests.lock().unwrap(),
        vec![
            ("submit", secs(0)),
            ("poll", secs(60)),
            ("fetch", secs(70)),
            ("submit", secs(80)),
            ("poll", secs(140)),
            ("fetch", secs(150)),
        ]
    );
}

#[test]
fn concurrent_searches_share_one_spacing_window() {
    let clock = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), clock.clone()));
    let blast = TimedBlast::new(clock.clone());
    let requests = Arc::clone(&blast.requests);
    let mut settings = settings(homology_without_structure(), 2);
    // Without a poll interval the governor is the only thing that moves the
    // clock, so six requests end exactly five spacings after the first.
    settings.homology.poll_interval = Duration::ZERO;
    let pipeline = Pipeline::new(
        MockUniprot::with_fixture(&["P04637", "P69905"]),
        blast,
        MockRcsb::default(),
        Arc::clone(&governor),
        clock.clone(),
        settings,
    );

    pipeline
        .run(&["P04637", "P69905"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 6);
    assert_eq!(requests.iter().filter(|(kind, _)| *kind == "submit").count(), 2);
    assert_eq!(clock.elapsed(), Duration::from_secs(50));
    assert_eq!(governor.snapshot().used, 2);
}

#[test]
fn events_for_each_identifier_follow_stage_order() {
    let ids = &ACCESSIONS[..6];
    let pipeline = pipeline(
        MockUniprot::with_fixture(ids),
        MockBlast::with_report(),
        AnalysisOptions::all(),
        3,
    );
    let sink = RecordingSink::default();
    pipeline.run(ids, &CancellationToken::new(), &sink).unwrap();

    let events = sink.events();
    let order = [
        Stage::Validate,
        Stage::Identity,
        Stage::Physicochemical,
        Stage::Homology,
        Stage::Structure,
        Stage::Merged,
    ];
    for id in ids {
        let positions: Vec<usize> = order
            .iter()
            .map(|stage| {
                events
                    .iter()
                    .position(|e| e.stage == *stage && e.identifier.as_deref() == Some(*id))
                    .unwrap_or_else(|| panic!("{id} has no {stage} event"))
            })
            .collect();
        assert!(
            positions.windows(2).all(|pair| pair[0] < pair[1]),
            "{id}: {positions:?}"
        );
        let terminal = events
            .iter()
            .filter(|e| e.stage.is_terminal() && e.identifier.as_deref() == Some(*id))
            .count();
        assert_eq!(terminal, 1, "{id}");
    }
}

#[test]
fn homology_skip_count_only_covers_quota() {
    let pipeline = pipeline(
        MockUniprot::with_fixture(&[]),
        MockBlast::with_report(),
        homology_without_structure(),
        1,
    );
    let output = pipeline
        .run(&["P69905"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    assert_eq!(
        output.records[0].source_status(Source::Homology),
        Some(&PartialStatus::Skipped {
            reason: SkipReason::NoSequence
        })
    );
    assert_eq!(output.summary.homology_skipped, 0);
}

#[test]
fn structure_search_is_off_by_default() {
    let rcsb = MockRcsb::default();
    let searches = Arc::clone(&rcsb.searches);
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), Arc::clone(&clock)));
    let pipeline = Pipeline::new(
        MockUniprot::with_fixture(&["P04637"]),
        MockBlast::with_report(),
        rcsb,
        governor,
        clock,
        PipelineSettings::default(),
    );
    let output = pipeline
        .run(&["P04637"], &CancellationToken::new(), &NoopSink)
        .unwrap();

    assert!(output.records[0].source_status(Source::Structure).is_none());
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}
