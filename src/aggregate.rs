use std::collections::BTreeMap;

use crate::domain::UniprotId;
use crate::record::{Field, PartialRecord, PartialStatus, Record, RecordStatus, SourceReport};

/// Merges every partial produced for `identifier` into one record.
///
/// Fields are a union in partial order. A name produced by two successful
/// sources keeps the first value and the clash becomes a record warning.
/// Failed or skipped sources add no fields and are listed in `missing`.
pub fn merge(identifier: &UniprotId, partials: Vec<PartialRecord>) -> Record {
    let mut fields: BTreeMap<String, Field> = BTreeMap::new();
    let mut sources = BTreeMap::new();
    let mut missing = Vec::new();
    let mut warnings = Vec::new();

    let all_ok = !partials.is_empty()
        && partials
            .iter()
            .all(|partial| partial.status == PartialStatus::Ok);
    let any_success = partials.iter().any(|partial| partial.status.is_success());

    for partial in partials {
        match &partial.status {
            PartialStatus::Ok => {}
            PartialStatus::Partial => missing.push(format!("{}: partial", partial.source)),
            PartialStatus::Failed { failure } => missing.push(format!(
                "{}: failed ({}, {} attempts): {}",
                partial.source, failure.kind, failure.attempts, failure.detail
            )),
            PartialStatus::Skipped { reason } => {
                missing.push(format!("{}: skipped ({reason})", partial.source))
            }
        }

        for warning in &partial.warnings {
            warnings.push(format!("{}: {warning}", partial.source));
        }

        if partial.status.is_success() {
            for (name, value) in partial.fields {
                if let Some(existing) = fields.get(&name) {
                    tracing::warn!(
                        identifier = %identifier,
                        field = %name,
                        kept = %existing.source,
                        dropped = %partial.source,
                        "field produced by more than one source"
                    );
                    warnings.push(format!(
                        "field {name} from {} conflicts with {}; kept {}",
                        partial.source, existing.source, existing.source
                    ));
                    continue;
                }
                fields.insert(
                    name,
                    Field {
                        value,
                        source: partial.source,
                    },
                );
            }
        }

        sources.insert(
            partial.source,
            SourceReport {
                status: partial.status,
                attempts: partial.attempts,
                retrieved_at: partial.fetched_at,
            },
        );
    }

    let status = if all_ok {
        RecordStatus::Complete
    } else if any_success {
        RecordStatus::Partial
    } else {
        RecordStatus::Failed
    };

    Record {
        identifier: identifier.clone(),
        status,
        fields,
        sources,
        missing,
        warnings,
    }
}
