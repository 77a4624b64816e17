//! Experimental structures from the RCSB Protein Data Bank.
//!
//! The search API maps a UniProt accession to PDB entry ids; the data API
//! then describes each entry. Only the first few entries are described, and
//! every request waits its turn at a spacing-only [`RateGovernor`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{Source, UniprotId};
use crate::error::{FetchFailure, ProtmergeError};
use crate::governor::RateGovernor;
use crate::record::{FieldValue, PartialRecord, PartialStatus};
use crate::source::{AdapterInput, SourceAdapter};

pub const DEFAULT_SEARCH_URL: &str = "https://search.rcsb.org/rcsbsearch/v2/query";
pub const DEFAULT_DATA_URL: &str = "https://data.rcsb.org/rest/v1/core";

pub const STRUCTURE_COUNT: &str = "structure_count";
pub const PDB_IDS: &str = "pdb_ids";
pub const BEST_STRUCTURE: &str = "best_structure";
pub const BEST_RESOLUTION: &str = "best_resolution";
pub const STRUCTURE_METHODS: &str = "structure_methods";
pub const STRUCTURE_QUALITY: &str = "structure_quality";
pub const COMPLEX_INFO: &str = "complex_info";
pub const LIGAND_INFO: &str = "ligand_info";

const ACCESSION_ATTRIBUTE: &str =
    "rcsb_polymer_entity_container_identifiers.reference_sequence_identifiers.database_accession";

const LIGAND_KEYWORDS: &[(&str, &str)] = &[
    ("dna", "DNA"),
    ("rna", "RNA"),
    ("atp", "ATP"),
    ("inhibitor", "Inhibitor"),
    ("drug", "Drug compound"),
    ("substrate", "Substrate"),
    ("cofactor", "Cofactor"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct StructureSettings {
    /// Entries described through the data API, in search order.
    pub max_detailed: usize,
    /// Entry ids kept in the `pdb_ids` field.
    pub max_listed: usize,
    /// Gap between consecutive RCSB requests.
    pub spacing: Duration,
}

impl Default for StructureSettings {
    fn default() -> Self {
        Self {
            max_detailed: 10,
            max_listed: 15,
            spacing: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureEntry {
    pub pdb_id: String,
    pub title: Option<String>,
    pub methods: Vec<String>,
    pub resolution: Option<f64>,
}

pub trait RcsbClient: Send + Sync {
    /// PDB entry ids whose polymer entities reference `id`.
    fn search_entries(&self, id: &UniprotId, timeout: Duration) -> Result<Vec<String>, FetchFailure>;
    fn fetch_entry(&self, pdb_id: &str, timeout: Duration) -> Result<Value, FetchFailure>;
}

#[derive(Clone)]
pub struct RcsbHttpClient {
    client: Client,
    search_url: String,
    data_url: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result_set: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    identifier: String,
}

impl RcsbHttpClient {
    pub fn new() -> Result<Self, ProtmergeError> {
        Self::with_urls(DEFAULT_SEARCH_URL, DEFAULT_DATA_URL)
    }

    pub fn with_urls(
        search_url: impl Into<String>,
        data_url: impl Into<String>,
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
            search_url: search_url.into(),
            data_url: data_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn entry_url(&self, pdb_id: &str) -> String {
        format!("{}/entry/{}", self.data_url, pdb_id)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, FetchFailure> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "RCSB request failed".to_string());
        Err(FetchFailure::from_status(status, message))
    }
}

impl RcsbClient for RcsbHttpClient {
    fn search_entries(&self, id: &UniprotId, timeout: Duration) -> Result<Vec<String>, FetchFailure> {
        let query = json!({
            "query": {
                "type": "terminal",
                "service": "text",
                "parameters": {
                    "attribute": ACCESSION_ATTRIBUTE,
                    "operator": "exact_match",
                    "value": id.as_str(),
                }
            },
            "return_type": "entry",
            "request_options": { "return_all_hits": true }
        });
        tracing::debug!(%id, "searching RCSB entries");
        let response = self
            .client
            .post(&self.search_url)
            .json(&query)
            .timeout(timeout)
            .send()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        // The search API answers 204 when nothing matches.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let response = Self::handle_status(response)?;
        let body: SearchResponse = response
            .json()
            .map_err(|err| FetchFailure::parse(format!("RCSB search: {err}")))?;
        Ok(body.result_set.into_iter().map(|hit| hit.identifier).collect())
    }

    fn fetch_entry(&self, pdb_id: &str, timeout: Duration) -> Result<Value, FetchFailure> {
        let url = self.entry_url(pdb_id);
        tracing::debug!(%pdb_id, %url, "requesting RCSB entry");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| FetchFailure::parse(format!("RCSB entry {pdb_id}: {err}")))
    }
}

/// Reads title, experimental methods and resolution from a data API entry.
pub fn extract_entry(pdb_id: &str, raw: &Value) -> StructureEntry {
    let title = raw
        .get("struct")
        .and_then(|value| value.get("title"))
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string());
    let mut methods: Vec<String> = Vec::new();
    for method in raw
        .get("exptl")
        .and_then(|value| value.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|exp| exp.get("method").and_then(|value| value.as_str()))
    {
        if !methods.iter().any(|known| known == method) {
            methods.push(method.to_string());
        }
    }
    let resolution = raw
        .get("rcsb_entry_info")
        .and_then(|value| value.get("resolution_combined"))
        .and_then(|value| value.as_array())
        .and_then(|array| array.first())
        .and_then(|value| value.as_f64());

    StructureEntry {
        pdb_id: pdb_id.to_string(),
        title,
        methods,
        resolution,
    }
}

/// Resolution bands used for `structure_quality`.
pub fn assess_quality(resolution: f64) -> &'static str {
    match resolution {
        r if r <= 1.5 => "excellent",
        r if r <= 2.0 => "very good",
        r if r <= 2.5 => "good",
        r if r <= 3.5 => "moderate",
        _ => "low",
    }
}

fn complex_kind(title: &str) -> Option<&'static str> {
    if !(title.contains("complex") || title.contains("bound")) {
        return None;
    }
    if title.contains("dna") || title.contains("rna") {
        Some("nucleic acid complex")
    } else if title.contains("drug") || title.contains("inhibitor") {
        Some("drug complex")
    } else {
        Some("ligand complex")
    }
}

/// Builds the structure fields from the search ids and the described entries.
pub fn summarize(pdb_ids: &[String], entries: &[StructureEntry], max_listed: usize) -> PartialRecord {
    let mut partial = PartialRecord::new(Source::Structure);
    partial.insert(STRUCTURE_COUNT, FieldValue::Integer(pdb_ids.len() as i64));
    partial.insert(
        PDB_IDS,
        FieldValue::List(pdb_ids.iter().take(max_listed).cloned().collect()),
    );

    let best = entries
        .iter()
        .filter_map(|entry| entry.resolution.map(|resolution| (entry, resolution)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b));
    let best_structure = best
        .map(|(entry, _)| entry.pdb_id.clone())
        .or_else(|| pdb_ids.first().cloned());
    partial.insert(BEST_STRUCTURE, FieldValue::text_or_unknown(best_structure));
    match best {
        Some((_, resolution)) => {
            partial.insert(BEST_RESOLUTION, FieldValue::Number(resolution));
            partial.insert(
                STRUCTURE_QUALITY,
                FieldValue::Text(assess_quality(resolution).to_string()),
            );
        }
        None => {
            partial.insert(BEST_RESOLUTION, FieldValue::Unknown);
            partial.insert(STRUCTURE_QUALITY, FieldValue::Unknown);
        }
    }

    let methods: BTreeSet<&str> = entries
        .iter()
        .flat_map(|entry| entry.methods.iter().map(String::as_str))
        .collect();
    partial.insert(STRUCTURE_METHODS, list_or_unknown(methods));

    let titles: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.title.as_deref())
        .map(str::to_lowercase)
        .collect();
    if titles.is_empty() {
        partial.insert(COMPLEX_INFO, FieldValue::Unknown);
    } else {
        let complexes: BTreeSet<&str> = titles.iter().filter_map(|t| complex_kind(t)).collect();
        partial.insert(
            COMPLEX_INFO,
            if complexes.is_empty() {
                FieldValue::List(vec!["monomer".to_string()])
            } else {
                list_or_unknown(complexes)
            },
        );
    }
    let ligands: BTreeSet<&str> = titles
        .iter()
        .flat_map(|title| {
            LIGAND_KEYWORDS
                .iter()
                .filter(move |(keyword, _)| title.contains(*keyword))
                .map(|(_, name)| *name)
        })
        .collect();
    partial.insert(LIGAND_INFO, list_or_unknown(ligands.into_iter().take(5).collect()));
    partial
}

fn list_or_unknown(items: BTreeSet<&str>) -> FieldValue {
    if items.is_empty() {
        FieldValue::Unknown
    } else {
        FieldValue::List(items.into_iter().map(str::to_string).collect())
    }
}

/// Structure adapter: PDB entries that reference the accession.
pub struct StructureAdapter<R: RcsbClient> {
    client: R,
    pacer: Arc<RateGovernor>,
    settings: StructureSettings,
}

impl<R: RcsbClient> StructureAdapter<R> {
    /// `pacer` should only be used through
    /// [`RateGovernor::acquire_spacing`]; RCSB has no daily quota.
    pub fn new(client: R, pacer: Arc<RateGovernor>, settings: StructureSettings) -> Self {
        Self {
            client,
            pacer,
            settings,
        }
    }
}

impl<R: RcsbClient> SourceAdapter for StructureAdapter<R> {
    fn source(&self) -> Source {
        Source::Structure
    }

    fn fetch(&self, input: &AdapterInput, timeout: Duration) -> Result<PartialRecord, FetchFailure> {
        self.pacer.acquire_spacing();
        let pdb_ids = self.client.search_entries(&input.id, timeout)?;
        if pdb_ids.is_empty() {
            tracing::debug!(id = %input.id, "no PDB entries");
            return Ok(summarize(&[], &[], self.settings.max_listed));
        }

        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        for pdb_id in pdb_ids.iter().take(self.settings.max_detailed) {
            self.pacer.acquire_spacing();
            match self.client.fetch_entry(pdb_id, timeout) {
                Ok(raw) => entries.push(extract_entry(pdb_id, &raw)),
                Err(failure) => {
                    tracing::debug!(%pdb_id, kind = %failure.kind, "RCSB entry unavailable");
                    skipped.push(format!("entry {pdb_id} unavailable: {}", failure.detail));
                }
            }
        }

        let mut partial = summarize(&pdb_ids, &entries, self.settings.max_listed);
        if !skipped.is_empty() {
            partial.status = PartialStatus::Partial;
            for warning in skipped {
                partial.warn(warning);
            }
        }
        Ok(partial)
    }
}
