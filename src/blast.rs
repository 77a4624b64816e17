//! Homology search against NCBI BLAST through the URL API.
//!
//! A search is submitted once (`CMD=Put`), which yields a request id (RID),
//! then polled (`CMD=Get&FORMAT_OBJECT=SearchInfo`) until the job is ready,
//! and finally fetched as XML. Every one of those requests waits its turn at
//! the [`RateGovernor`]; only submissions spend daily quota. Polls also wait
//! `poll_interval` first.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::clock::Clock;
use crate::domain::Source;
use crate::error::{FailureKind, FetchFailure, ProtmergeError};
use crate::governor::RateGovernor;
use crate::protparam::MIN_SEQUENCE_LENGTH;
use crate::record::{FieldValue, HomologyHit, NO_SIGNIFICANT_HITS, PartialRecord, SkipReason};
use crate::source::{AdapterInput, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://blast.ncbi.nlm.nih.gov/Blast.cgi";

pub const HOMOLOGY_HITS: &str = "homology_hits";
pub const TOP_HIT_DESCRIPTION: &str = "top_hit_description";
pub const TOP_HIT_IDENTITY: &str = "top_hit_identity";
pub const TOP_HIT_EVALUE: &str = "top_hit_evalue";
pub const TOP_HIT_ALIGNMENT_LENGTH: &str = "top_hit_alignment_length";

static RID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RID = ([A-Z0-9]+)").expect("RID pattern compiles"));
static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Status=([A-Z]+)").expect("status pattern compiles"));

#[derive(Debug, Clone, PartialEq)]
pub struct HomologySettings {
    pub email: String,
    pub tool: String,
    pub program: String,
    pub database: String,
    pub expect: f64,
    pub hitlist_size: u32,
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Hits at or above this identity are treated as the query itself.
    pub self_match_identity: f64,
}

impl Default for HomologySettings {
    fn default() -> Self {
        Self {
            email: "protmerge@example.com".to_string(),
            tool: "ProtMerge".to_string(),
            program: "blastp".to_string(),
            database: "nr".to_string(),
            expect: 10.0,
            hitlist_size: 10,
            poll_interval: Duration::from_secs(60),
            max_polls: 5,
            self_match_identity: 95.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Waiting,
    Ready { has_hits: bool },
    Failed,
    Unknown,
}

pub trait BlastClient: Send + Sync {
    /// Submits a search and returns its RID.
    fn submit(&self, sequence: &str, timeout: Duration) -> Result<String, FetchFailure>;
    fn poll(&self, rid: &str, timeout: Duration) -> Result<PollStatus, FetchFailure>;
    fn fetch_report(&self, rid: &str, timeout: Duration) -> Result<String, FetchFailure>;
}

#[derive(Clone)]
pub struct BlastHttpClient {
    client: Client,
    base_url: String,
    settings: HomologySettings,
}

impl BlastHttpClient {
    pub fn new(settings: HomologySettings) -> Result<Self, ProtmergeError> {
        Self::with_base_url(DEFAULT_BASE_URL, settings)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        settings: HomologySettings,
    ) -> Result<Self, ProtmergeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("protmerge/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ProtmergeError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| ProtmergeError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            settings,
        })
    }

    fn attribution(&self) -> [(&'static str, String); 2] {
        [
            ("EMAIL", self.settings.email.clone()),
            ("TOOL", self.settings.tool.clone()),
        ]
    }

    fn get_text(&self, params: &[(&str, String)], timeout: Duration) -> Result<String, FetchFailure> {
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .query(&self.attribution())
            .timeout(timeout)
            .send()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        Self::read_text(response)
    }

    fn read_text(response: reqwest::blocking::Response) -> Result<String, FetchFailure> {
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        if !status.is_success() {
            return Err(FetchFailure::from_status(status.as_u16(), body));
        }
        Ok(body)
    }
}

impl BlastClient for BlastHttpClient {
    fn submit(&self, sequence: &str, timeout: Duration) -> Result<String, FetchFailure> {
        let mut form = vec![
            ("CMD", "Put".to_string()),
            ("PROGRAM", self.settings.program.clone()),
            ("DATABASE", self.settings.database.clone()),
            ("QUERY", sequence.to_string()),
            ("EXPECT", self.settings.expect.to_string()),
            ("HITLIST_SIZE", self.settings.hitlist_size.to_string()),
            ("FORMAT_TYPE", "XML".to_string()),
        ];
        form.extend(self.attribution());
        tracing::debug!(length = sequence.len(), "submitting BLAST search");
        let response = self
            .client
            .post(&self.base_url)
            .form(&form)
            .timeout(timeout)
            .send()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        let body = Self::read_text(response)?;
        parse_rid(&body)
    }

    fn poll(&self, rid: &str, timeout: Duration) -> Result<PollStatus, FetchFailure> {
        let body = self.get_text(
            &[
                ("CMD", "Get".to_string()),
                ("FORMAT_OBJECT", "SearchInfo".to_string()),
                ("RID", rid.to_string()),
            ],
            timeout,
        )?;
        Ok(parse_search_info(&body))
    }

    fn fetch_report(&self, rid: &str, timeout: Duration) -> Result<String, FetchFailure> {
        self.get_text(
            &[
                ("CMD", "Get".to_string()),
                ("FORMAT_TYPE", "XML".to_string()),
                ("RID", rid.to_string()),
            ],
            timeout,
        )
    }
}

pub fn parse_rid(body: &str) -> Result<String, FetchFailure> {
    RID_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FetchFailure::parse("BLAST submission returned no RID"))
}

pub fn parse_search_info(body: &str) -> PollStatus {
    let status = STATUS_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    match status {
        Some("WAITING") => PollStatus::Waiting,
        Some("READY") => PollStatus::Ready {
            has_hits: !body.contains("ThereAreHits=no"),
        },
        Some("FAILED") => PollStatus::Failed,
        _ => PollStatus::Unknown,
    }
}

/// Where one submitted search currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchState {
    Submitted { rid: String },
    Polling { rid: String, polls: u32 },
    Ready { rid: String, report: Option<String> },
    TimedOut { rid: String, polls: u32 },
    Failed { rid: String, failure: FetchFailure },
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchState::Ready { .. } | SearchState::TimedOut { .. } | SearchState::Failed { .. }
        )
    }
}

/// Submit-then-poll protocol for one search, driven one step at a time.
pub struct HomologySearch<'a> {
    client: &'a dyn BlastClient,
    clock: &'a dyn Clock,
    pacer: &'a RateGovernor,
    poll_interval: Duration,
    max_polls: u32,
    timeout: Duration,
    state: SearchState,
}

impl<'a> HomologySearch<'a> {
    /// Sends the search. The caller must already hold a governor slot.
    pub fn submit(
        client: &'a dyn BlastClient,
        clock: &'a dyn Clock,
        pacer: &'a RateGovernor,
        settings: &HomologySettings,
        sequence: &str,
        timeout: Duration,
    ) -> Result<Self, FetchFailure> {
        let rid = client.submit(sequence, timeout)?;
        tracing::debug!(%rid, "BLAST search submitted");
        Ok(Self {
            client,
            clock,
            pacer,
            poll_interval: settings.poll_interval,
            max_polls: settings.max_polls,
            timeout,
            state: SearchState::Submitted { rid },
        })
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    /// Advances by one transition. Polling sleeps `poll_interval` first, and
    /// every poll or report download is spaced by the governor.
    pub fn step(&mut self) -> &SearchState {
        let next = match &self.state {
            SearchState::Submitted { rid } => SearchState::Polling {
                rid: rid.clone(),
                polls: 0,
            },
            SearchState::Polling { rid, polls } if *polls >= self.max_polls => {
                SearchState::TimedOut {
                    rid: rid.clone(),
                    polls: *polls,
                }
            }
            SearchState::Polling { rid, polls } => {
                self.clock.sleep(self.poll_interval);
                self.pacer.acquire_spacing();
                let polls = polls + 1;
                match self.client.poll(rid, self.timeout) {
                    Ok(PollStatus::Ready { has_hits: false }) => SearchState::Ready {
                        rid: rid.clone(),
                        report: None,
                    },
                    Ok(PollStatus::Ready { has_hits: true }) => {
                        self.pacer.acquire_spacing();
                        match self.client.fetch_report(rid, self.timeout) {
                            Ok(report) => SearchState::Ready {
                                rid: rid.clone(),
                                report: Some(report),
                            },
                            Err(failure) => SearchState::Failed {
                                rid: rid.clone(),
                                failure,
                            },
                        }
                    }
                    Ok(PollStatus::Failed) => SearchState::Failed {
                        rid: rid.clone(),
                        failure: FetchFailure::network(format!("BLAST search {rid} failed")),
                    },
                    Ok(PollStatus::Waiting) | Ok(PollStatus::Unknown) => SearchState::Polling {
                        rid: rid.clone(),
                        polls,
                    },
                    Err(failure) => SearchState::Failed {
                        rid: rid.clone(),
                        failure,
                    },
                }
            }
            terminal => terminal.clone(),
        };
        self.state = next;
        &self.state
    }

    pub fn run_to_completion(mut self) -> SearchState {
        while !self.state.is_terminal() {
            self.step();
        }
        self.state
    }
}

#[derive(Debug, Deserialize)]
struct BlastOutput {
    #[serde(rename = "BlastOutput_iterations", default)]
    iterations: Option<Iterations>,
}

#[derive(Debug, Deserialize)]
struct Iterations {
    #[serde(rename = "Iteration", default)]
    items: Vec<Iteration>,
}

#[derive(Debug, Deserialize)]
struct Iteration {
    #[serde(rename = "Iteration_hits", default)]
    hits: Option<IterationHits>,
}

#[derive(Debug, Deserialize)]
struct IterationHits {
    #[serde(rename = "Hit", default)]
    items: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "Hit_def", default)]
    def: String,
    #[serde(rename = "Hit_accession", default)]
    accession: String,
    #[serde(rename = "Hit_len", default)]
    len: u64,
    #[serde(rename = "Hit_hsps", default)]
    hsps: Option<Hsps>,
}

#[derive(Debug, Deserialize)]
struct Hsps {
    #[serde(rename = "Hsp", default)]
    items: Vec<Hsp>,
}

#[derive(Debug, Deserialize)]
struct Hsp {
    #[serde(rename = "Hsp_bit-score")]
    bit_score: f64,
    #[serde(rename = "Hsp_evalue")]
    evalue: f64,
    #[serde(rename = "Hsp_identity")]
    identity: u64,
    #[serde(rename = "Hsp_align-len")]
    align_len: u64,
}

/// Parses a BLAST XML report into hits, best HSP per hit, in report order.
pub fn parse_blast_xml(xml: &str) -> Result<Vec<HomologyHit>, FetchFailure> {
    let output: BlastOutput = quick_xml::de::from_str(xml)
        .map_err(|err| FetchFailure::parse(format!("BLAST XML: {err}")))?;
    let hits = output
        .iterations
        .into_iter()
        .flat_map(|iterations| iterations.items)
        .flat_map(|iteration| iteration.hits.map(|hits| hits.items).unwrap_or_default())
        .filter_map(|hit| {
            let hsp = hit.hsps.and_then(|hsps| hsps.items.into_iter().next())?;
            if hsp.align_len == 0 {
                return None;
            }
            let identity_pct = hsp.identity as f64 / hsp.align_len as f64 * 100.0;
            Some(HomologyHit {
                accession: hit.accession,
                description: hit.def,
                identity_pct: (identity_pct * 100.0).round() / 100.0,
                evalue: hsp.evalue,
                bit_score: hsp.bit_score,
                alignment_length: hsp.align_len,
                hit_length: hit.len,
            })
        })
        .collect();
    Ok(hits)
}

/// Homology adapter. Each fetch consumes one governor slot.
pub struct HomologyAdapter<B: BlastClient> {
    client: B,
    governor: Arc<RateGovernor>,
    clock: Arc<dyn Clock>,
    settings: HomologySettings,
}

impl<B: BlastClient> HomologyAdapter<B> {
    pub fn new(
        client: B,
        governor: Arc<RateGovernor>,
        clock: Arc<dyn Clock>,
        settings: HomologySettings,
    ) -> Self {
        Self {
            client,
            governor,
            clock,
            settings,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    fn build_partial(&self, hits: Vec<HomologyHit>) -> PartialRecord {
        let mut partial = PartialRecord::new(Source::Homology);
        let top = hits
            .iter()
            .find(|hit| hit.identity_pct < self.settings.self_match_identity);
        match top {
            Some(hit) => {
                partial.insert(TOP_HIT_DESCRIPTION, FieldValue::Text(hit.description.clone()));
                partial.insert(TOP_HIT_IDENTITY, FieldValue::Number(hit.identity_pct));
                partial.insert(TOP_HIT_EVALUE, FieldValue::Number(hit.evalue));
                partial.insert(
                    TOP_HIT_ALIGNMENT_LENGTH,
                    FieldValue::Integer(hit.alignment_length as i64),
                );
            }
            None => {
                partial.insert(
                    TOP_HIT_DESCRIPTION,
                    FieldValue::Text(NO_SIGNIFICANT_HITS.to_string()),
                );
                partial.insert(TOP_HIT_IDENTITY, FieldValue::Unknown);
                partial.insert(TOP_HIT_EVALUE, FieldValue::Unknown);
                partial.insert(TOP_HIT_ALIGNMENT_LENGTH, FieldValue::Unknown);
            }
        }
        partial.insert(HOMOLOGY_HITS, FieldValue::Hits(hits));
        partial
    }
}

impl<B: BlastClient> SourceAdapter for HomologyAdapter<B> {
    fn source(&self) -> Source {
        Source::Homology
    }

    fn fetch(&self, input: &AdapterInput, timeout: Duration) -> Result<PartialRecord, FetchFailure> {
        let Some(sequence) = input.sequence.as_deref() else {
            return Ok(PartialRecord::skipped(Source::Homology, SkipReason::NoSequence));
        };
        let query: String = sequence
            .chars()
            .map(|ch| ch.to_ascii_uppercase())
            .filter(|ch| "ACDEFGHIKLMNPQRSTVWY".contains(*ch))
            .collect();
        if query.len() < MIN_SEQUENCE_LENGTH {
            return Ok(PartialRecord::skipped(Source::Homology, SkipReason::SequenceTooShort));
        }

        let grant = self
            .governor
            .acquire_slot()
            .map_err(|err| FetchFailure::new(FailureKind::QuotaExceeded, err.to_string()))?;
        tracing::debug!(
            id = %input.id,
            used = grant.used_in_window,
            waited_ms = grant.waited.as_millis() as u64,
            "homology slot granted"
        );

        let search = HomologySearch::submit(
            &self.client,
            self.clock.as_ref(),
            self.governor.as_ref(),
            &self.settings,
            &query,
            timeout,
        )?;
        match search.run_to_completion() {
            SearchState::Ready { report: None, .. } => Ok(self.build_partial(Vec::new())),
            SearchState::Ready {
                report: Some(report),
                ..
            } => Ok(self.build_partial(parse_blast_xml(&report)?)),
            SearchState::TimedOut { rid, polls } => Err(FetchFailure::timeout(format!(
                "BLAST search {rid} not ready after {polls} polls"
            ))),
            SearchState::Failed { failure, .. } => Err(failure),
            SearchState::Submitted { rid } | SearchState::Polling { rid, .. } => Err(
                FetchFailure::network(format!("BLAST search {rid} stopped before completion")),
            ),
        }
    }
}
