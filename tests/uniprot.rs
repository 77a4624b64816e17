use std::fs;
use std::time::Duration;

use protmerge::domain::UniprotId;
use protmerge::error::{FailureKind, FetchFailure};
use protmerge::record::{FieldValue, PartialStatus};
use protmerge::source::{AdapterInput, SourceAdapter};
use protmerge::uniprot::{
    ENVIRONMENT, GENE_NAME, IdentityAdapter, ORGANISM, PROTEIN_NAME, SEQUENCE, SEQUENCE_LENGTH,
    STRUCTURE_FEATURES, SUBCELLULAR_LOCATION, UniprotClient, extract_identity,
};

fn fixture() -> serde_json::Value {
    let raw = fs::read_to_string("tests/fixtures/uniprot_P04637.json").unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn p53() -> UniprotId {
    "P04637".parse().unwrap()
}

struct FixtureClient;

impl UniprotClient for FixtureClient {
    fn fetch_entry(&self, id: &UniprotId, _timeout: Duration) -> Result<serde_json::Value, FetchFailure> {
        if id.as_str() == "P04637" {
            Ok(fixture())
        } else {
            Err(FetchFailure::from_status(404, format!("{id} not found")))
        }
    }
}

#[test]
fn extract_p53_identity() {
    let partial = extract_identity(&p53(), &fixture()).unwrap();

    assert_eq!(partial.status, PartialStatus::Ok);
    assert_eq!(
        partial.get(PROTEIN_NAME).and_then(FieldValue::as_text),
        Some("Cellular tumor antigen p53")
    );
    assert_eq!(partial.get(ORGANISM).and_then(FieldValue::as_text), Some("Homo sapiens"));
    assert_eq!(partial.get(GENE_NAME).and_then(FieldValue::as_text), Some("TP53"));
    assert_eq!(
        partial.get(SEQUENCE_LENGTH),
        Some(&FieldValue::Integer(393))
    );
    let sequence = partial.get(SEQUENCE).and_then(FieldValue::as_text).unwrap();
    assert!(sequence.starts_with("MEEPQSDPSV"));
    assert_eq!(sequence.len(), 393);

    let location = partial
        .get(SUBCELLULAR_LOCATION)
        .and_then(FieldValue::as_text)
        .unwrap();
    assert!(location.contains("Nucleus"));
    assert!(location.contains("Cytoplasm"));
    assert_eq!(
        partial.get(ENVIRONMENT).and_then(FieldValue::as_text),
        Some("Found in: Homo sapiens")
    );
    assert_eq!(
        partial.get(STRUCTURE_FEATURES),
        Some(&FieldValue::List(vec!["Region".to_string()]))
    );
}

#[test]
fn adapter_maps_missing_entry_to_not_found() {
    let adapter = IdentityAdapter::new(FixtureClient);
    let input = AdapterInput::new("P69905".parse().unwrap());
    let err = adapter.fetch(&input, Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind, FailureKind::NotFound);
    assert!(!err.kind.is_retryable());
}

#[test]
fn adapter_returns_identity_fields() {
    let adapter = IdentityAdapter::new(FixtureClient);
    let partial = adapter
        .fetch(&AdapterInput::new(p53()), Duration::from_secs(5))
        .unwrap();
    assert!(partial.status.is_success());
    assert!(!partial.get(ORGANISM).unwrap().is_unknown());
}

#[test]
fn non_object_body_is_parse_failure() {
    let err = extract_identity(&p53(), &serde_json::json!(["P04637"])).unwrap_err();
    assert_eq!(err.kind, FailureKind::Parse);
}
