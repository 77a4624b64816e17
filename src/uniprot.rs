use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{Source, UniprotId};
use crate::error::{FetchFailure, ProtmergeError};
use crate::record::{FieldValue, PartialRecord};
use crate::source::{AdapterInput, SourceAdapter};

pub const DEFAULT_BASE_URL: &str = "https://rest.uniprot.org/uniprotkb";

pub const PROTEIN_NAME: &str = "protein_name";
pub const ORGANISM: &str = "organism";
pub const GENE_NAME: &str = "gene_name";
pub const FUNCTION: &str = "function";
pub const SUBCELLULAR_LOCATION: &str = "subcellular_location";
pub const ENVIRONMENT: &str = "environment";
pub const KEYWORDS: &str = "keywords";
pub const STRUCTURE_FEATURES: &str = "structure_features";
pub const SEQUENCE: &str = "sequence";
pub const SEQUENCE_LENGTH: &str = "sequence_length";
pub const ALPHAFOLD_URL: &str = "alphafold_url";

const BODY_LOCATIONS: &[(&str, &[&str])] = &[
    (
        "gut",
        &[
            "gut",
            "intestinal",
            "intestine",
            "gastrointestinal",
            "enteric",
            "colon",
            "colonic",
            "fecal",
            "faecal",
            "microbiome",
            "microbiota",
            "digestive",
            "bowel",
            "stomach",
            "gastric",
        ],
    ),
    (
        "blood",
        &["blood", "plasma", "serum", "vascular", "circulatory", "hematopoietic"],
    ),
    (
        "brain",
        &["brain", "neural", "neuronal", "cerebral", "nervous system"],
    ),
    ("liver", &["liver", "hepatic", "hepatocyte"]),
    ("kidney", &["kidney", "renal", "nephron"]),
    ("lung", &["lung", "pulmonary", "respiratory"]),
    ("skin", &["skin", "dermal", "epidermal"]),
    ("muscle", &["muscle", "muscular", "myocyte"]),
    ("bone", &["bone", "skeletal", "osseous"]),
    (
        "immune",
        &["immune", "immunological", "lymphoid", "spleen"],
    ),
    ("oral", &["oral", "mouth", "dental", "saliva"]),
];

const GUT_GENERA: &[&str] = &[
    "bacteroides",
    "lactobacillus",
    "bifidobacterium",
    "clostridium",
    "escherichia",
];

const STRUCTURE_FEATURE_TYPES: &[&str] = &[
    "Domain",
    "Region",
    "Transmembrane",
    "Signal",
    "Topological domain",
];

pub trait UniprotClient: Send + Sync {
    fn fetch_entry(&self, id: &UniprotId, timeout: Duration) -> Result<Value, FetchFailure>;
}

#[derive(Clone)]
pub struct UniprotHttpClient {
    client: Client,
    base_url: String,
}

impl UniprotHttpClient {
    pub fn new() -> Result<Self, ProtmergeError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ProtmergeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("protmerge/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ProtmergeError::HttpClient(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| ProtmergeError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn entry_url(&self, id: &UniprotId) -> String {
        format!("{}/{}.json", self.base_url, id.as_str())
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
            .unwrap_or_else(|_| "UniProt request failed".to_string());
        Err(FetchFailure::from_status(status, message))
    }
}

impl UniprotClient for UniprotHttpClient {
    fn fetch_entry(&self, id: &UniprotId, timeout: Duration) -> Result<Value, FetchFailure> {
        let url = self.entry_url(id);
        tracing::debug!(%id, %url, "requesting UniProt entry");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .map_err(|err| FetchFailure::from_reqwest(&err))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| FetchFailure::parse(err.to_string()))
    }
}

/// Identity adapter: organism, gene, function, location and sequence.
pub struct IdentityAdapter<U: UniprotClient> {
    client: U,
}

impl<U: UniprotClient> IdentityAdapter<U> {
    pub fn new(client: U) -> Self {
        Self { client }
    }
}

impl<U: UniprotClient> SourceAdapter for IdentityAdapter<U> {
    fn source(&self) -> Source {
        Source::Identity
    }

    fn fetch(&self, input: &AdapterInput, timeout: Duration) -> Result<PartialRecord, FetchFailure> {
        let raw = self.client.fetch_entry(&input.id, timeout)?;
        extract_identity(&input.id, &raw)
    }
}

/// Turns a UniProtKB JSON entry into identity fields.
///
/// Every identity field is present in the result; values the entry does not
/// carry are [`FieldValue::Unknown`].
pub fn extract_identity(id: &UniprotId, raw: &Value) -> Result<PartialRecord, FetchFailure> {
    if !raw.is_object() {
        return Err(FetchFailure::parse("UniProt entry is not a JSON object"));
    }
    if raw.get("entryType").and_then(|v| v.as_str()) == Some("Inactive") {
        let reason = raw
            .get("inactiveReason")
            .and_then(|v| v.get("inactiveReasonType"))
            .and_then(|v| v.as_str())
            .unwrap_or("inactive");
        return Err(FetchFailure::not_found(format!(
            "UniProt entry {id} is inactive ({reason})"
        )));
    }
    if let Some(accession) = raw.get("primaryAccession").and_then(|v| v.as_str()) {
        if accession != id.as_str() {
            tracing::debug!(%id, %accession, "UniProt returned a different primary accession");
        }
    }

    let protein_name = raw
        .get("proteinDescription")
        .and_then(|v| v.get("recommendedName"))
        .and_then(|v| v.get("fullName"))
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .or_else(|| {
            raw.get("proteinDescription")
                .and_then(|v| v.get("submissionNames"))
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|v| v.get("fullName"))
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        });

    let organism = raw
        .get("organism")
        .and_then(|v| v.get("scientificName"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let gene_name = raw
        .get("genes")
        .and_then(|v| v.as_array())
        .and_then(|genes| genes.first())
        .and_then(|gene| gene.get("geneName"))
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let comments = raw
        .get("comments")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut function = None;
    let mut locations = Vec::new();
    let mut environment_text = Vec::new();
    for comment in comments {
        let kind = comment.get("commentType").and_then(|v| v.as_str());
        let first_text = comment
            .get("texts")
            .and_then(|v| v.as_array())
            .and_then(|texts| texts.first())
            .and_then(|text| text.get("value"))
            .and_then(|v| v.as_str());
        match kind {
            Some("FUNCTION") => {
                if function.is_none() {
                    function = first_text.map(|v| v.to_string());
                }
                environment_text.extend(first_text.map(str::to_lowercase));
            }
            Some("SUBCELLULAR LOCATION") => {
                environment_text.extend(first_text.map(str::to_lowercase));
                if let Some(items) = comment.get("subcellularLocations").and_then(|v| v.as_array())
                {
                    for item in items {
                        if let Some(value) = item
                            .get("location")
                            .and_then(|v| v.get("value"))
                            .and_then(|v| v.as_str())
                        {
                            if !locations.iter().any(|known: &String| known == value) {
                                locations.push(value.to_string());
                            }
                            environment_text.push(value.to_lowercase());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let keywords: Vec<String> = raw
        .get("keywords")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|kw| kw.get("name").and_then(|v| v.as_str()))
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
                .collect()
        })
        .unwrap_or_default();
    environment_text.extend(keywords.iter().map(|kw| kw.to_lowercase()));

    let mut structure_features: Vec<String> = raw
        .get("features")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("type").and_then(|v| v.as_str()))
                .filter(|ftype| STRUCTURE_FEATURE_TYPES.contains(ftype))
                .map(|ftype| ftype.to_string())
                .collect()
        })
        .unwrap_or_default();
    structure_features.sort();
    structure_features.dedup();

    let sequence = raw
        .get("sequence")
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .filter(|seq| !seq.is_empty())
        .map(|v| v.to_string());
    let sequence_length = raw
        .get("sequence")
        .and_then(|v| v.get("length"))
        .and_then(|v| v.as_u64())
        .or_else(|| sequence.as_ref().map(|seq| seq.len() as u64));

    let environment = infer_environment(&environment_text, organism.as_deref());

    let mut partial = PartialRecord::new(Source::Identity);
    partial.insert(PROTEIN_NAME, FieldValue::text_or_unknown(protein_name));
    partial.insert(ORGANISM, FieldValue::text_or_unknown(organism));
    partial.insert(GENE_NAME, FieldValue::text_or_unknown(gene_name));
    partial.insert(FUNCTION, FieldValue::text_or_unknown(function));
    partial.insert(
        SUBCELLULAR_LOCATION,
        FieldValue::text_or_unknown((!locations.is_empty()).then(|| locations.join("; "))),
    );
    partial.insert(ENVIRONMENT, FieldValue::text_or_unknown(environment));
    partial.insert(
        KEYWORDS,
        if keywords.is_empty() {
            FieldValue::Unknown
        } else {
            FieldValue::List(keywords)
        },
    );
    partial.insert(
        STRUCTURE_FEATURES,
        if structure_features.is_empty() {
            FieldValue::Unknown
        } else {
            FieldValue::List(structure_features)
        },
    );
    partial.insert(
        SEQUENCE_LENGTH,
        sequence_length
            .map(|len| FieldValue::Integer(len as i64))
            .unwrap_or(FieldValue::Unknown),
    );
    let has_sequence = sequence.is_some();
    partial.insert(SEQUENCE, FieldValue::text_or_unknown(sequence));
    partial.insert(
        ALPHAFOLD_URL,
        FieldValue::Text(format!("https://alphafold.ebi.ac.uk/entry/{}", id.as_str())),
    );

    if !has_sequence {
        partial.warn("entry carries no sequence");
    }
    Ok(partial)
}

/// Guesses body locations from free text; falls back to the organism name.
pub fn infer_environment(texts: &[String], organism: Option<&str>) -> Option<String> {
    let all_text = texts.join(" ");
    let organism_lower = organism.map(str::to_lowercase).unwrap_or_default();
    let haystack = format!("{all_text} {organism_lower}");

    let mut locations: Vec<&str> = BODY_LOCATIONS
        .iter()
        .filter(|(_, words)| words.iter().any(|word| haystack.contains(word)))
        .map(|(location, _)| *location)
        .collect();
    if GUT_GENERA.iter().any(|genus| organism_lower.contains(genus)) {
        locations.push("gut");
    }
    locations.sort_unstable();
    locations.dedup();

    if !locations.is_empty() {
        return Some(locations.join("; "));
    }
    organism
        .filter(|name| !name.is_empty())
        .map(|name| format!("Found in: {name}"))
}
