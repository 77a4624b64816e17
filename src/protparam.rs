//! Physicochemical parameters computed locally from the sequence, following
//! the definitions used by ExPASy ProtParam.

use std::time::Duration;

use crate::domain::Source;
use crate::error::FetchFailure;
use crate::record::{FieldValue, PartialRecord, ResidueCount, SkipReason};
use crate::source::{AdapterInput, SourceAdapter};

pub const MOLECULAR_WEIGHT: &str = "molecular_weight";
pub const ISOELECTRIC_POINT: &str = "isoelectric_point";
pub const GRAVY: &str = "gravy";
pub const EXTINCTION_REDUCED: &str = "extinction_coefficient_reduced";
pub const EXTINCTION_OXIDIZED: &str = "extinction_coefficient_oxidized";
pub const ALIPHATIC_INDEX: &str = "aliphatic_index";
pub const ATOMIC_COMPOSITION: &str = "atomic_composition";
pub const AMINO_ACID_COMPOSITION: &str = "amino_acid_composition";

pub const MIN_SEQUENCE_LENGTH: usize = 20;

const WATER_MASS: f64 = 18.01524;

struct Residue {
    code: char,
    name: &'static str,
    /// Average residue mass (amino acid minus water).
    mass: f64,
    hydropathy: f64,
    /// Residue formula C, H, N, O, S.
    atoms: [u64; 5],
}

const STANDARD: &[Residue] = &[
    Residue { code: 'A', name: "Ala", mass: 71.0788, hydropathy: 1.8, atoms: [3, 5, 1, 1, 0] },
    Residue { code: 'R', name: "Arg", mass: 156.1875, hydropathy: -4.5, atoms: [6, 12, 4, 1, 0] },
    Residue { code: 'N', name: "Asn", mass: 114.1038, hydropathy: -3.5, atoms: [4, 6, 2, 2, 0] },
    Residue { code: 'D', name: "Asp", mass: 115.0886, hydropathy: -3.5, atoms: [4, 5, 1, 3, 0] },
    Residue { code: 'C', name: "Cys", mass: 103.1388, hydropathy: 2.5, atoms: [3, 5, 1, 1, 1] },
    Residue { code: 'Q', name: "Gln", mass: 128.1307, hydropathy: -3.5, atoms: [5, 8, 2, 2, 0] },
    Residue { code: 'E', name: "Glu", mass: 129.1155, hydropathy: -3.5, atoms: [5, 7, 1, 3, 0] },
    Residue { code: 'G', name: "Gly", mass: 57.0519, hydropathy: -0.4, atoms: [2, 3, 1, 1, 0] },
    Residue { code: 'H', name: "His", mass: 137.1411, hydropathy: -3.2, atoms: [6, 7, 3, 1, 0] },
    Residue { code: 'I', name: "Ile", mass: 113.1594, hydropathy: 4.5, atoms: [6, 11, 1, 1, 0] },
    Residue { code: 'L', name: "Leu", mass: 113.1594, hydropathy: 3.8, atoms: [6, 11, 1, 1, 0] },
    Residue { code: 'K', name: "Lys", mass: 128.1741, hydropathy: -3.9, atoms: [6, 12, 2, 1, 0] },
    Residue { code: 'M', name: "Met", mass: 131.1926, hydropathy: 1.9, atoms: [5, 9, 1, 1, 1] },
    Residue { code: 'F', name: "Phe", mass: 147.1766, hydropathy: 2.8, atoms: [9, 9, 1, 1, 0] },
    Residue { code: 'P', name: "Pro", mass: 97.1167, hydropathy: -1.6, atoms: [5, 7, 1, 1, 0] },
    Residue { code: 'S', name: "Ser", mass: 87.0782, hydropathy: -0.8, atoms: [3, 5, 1, 2, 0] },
    Residue { code: 'T', name: "Thr", mass: 101.1051, hydropathy: -0.7, atoms: [4, 7, 1, 2, 0] },
    Residue { code: 'W', name: "Trp", mass: 186.2132, hydropathy: -0.9, atoms: [11, 10, 2, 1, 0] },
    Residue { code: 'Y', name: "Tyr", mass: 163.1760, hydropathy: -1.3, atoms: [9, 9, 1, 2, 0] },
    Residue { code: 'V', name: "Val", mass: 99.1326, hydropathy: 4.2, atoms: [5, 9, 1, 1, 0] },
];

/// Codes that appear in the composition table but have no fixed mass or
/// hydropathy (ambiguous) or are rare (Pyl, Sec).
const EXTRA_CODES: &[(char, &str)] = &[
    ('O', "Pyl"),
    ('U', "Sec"),
    ('B', "Asx"),
    ('Z', "Glx"),
    ('X', "Xaa"),
];

const PK_POSITIVE: &[(char, f64)] = &[('K', 10.0), ('R', 12.0), ('H', 5.98)];
const PK_NEGATIVE: &[(char, f64)] = &[('D', 4.05), ('E', 4.45), ('C', 9.0), ('Y', 10.0)];
const PK_NTERM_DEFAULT: f64 = 7.5;
const PK_CTERM_DEFAULT: f64 = 3.55;
const PK_NTERM: &[(char, f64)] = &[
    ('A', 7.59),
    ('M', 7.0),
    ('S', 6.93),
    ('P', 8.36),
    ('T', 6.82),
    ('V', 7.44),
    ('E', 7.7),
];
const PK_CTERM: &[(char, f64)] = &[('D', 4.55), ('E', 4.75)];

#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub length: usize,
    pub molecular_weight: f64,
    pub isoelectric_point: f64,
    pub gravy: f64,
    pub extinction_reduced: u64,
    pub extinction_oxidized: u64,
    pub aliphatic_index: f64,
    pub atomic_composition: String,
    pub composition: Vec<ResidueCount>,
    /// Letters outside the composition table, in order of first appearance.
    pub unrecognized: Vec<char>,
    /// Ambiguous or rare residues left out of the mass and charge sums.
    pub excluded: u64,
}

/// Computes ProtParam-style parameters. Returns `None` when fewer than
/// [`MIN_SEQUENCE_LENGTH`] standard residues are present.
pub fn compute_parameters(sequence: &str) -> Option<Parameters> {
    let residues: Vec<char> = sequence
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    let mut counts = [0u64; 20];
    let mut extra_counts = [0u64; 5];
    let mut unrecognized = Vec::new();
    for &ch in &residues {
        if let Some(idx) = STANDARD.iter().position(|r| r.code == ch) {
            counts[idx] += 1;
        } else if let Some(idx) = EXTRA_CODES.iter().position(|(code, _)| *code == ch) {
            extra_counts[idx] += 1;
        } else if !unrecognized.contains(&ch) {
            unrecognized.push(ch);
        }
    }

    let standard_len: u64 = counts.iter().sum();
    if (standard_len as usize) < MIN_SEQUENCE_LENGTH {
        return None;
    }
    let count_of = |code: char| {
        STANDARD
            .iter()
            .position(|r| r.code == code)
            .map(|idx| counts[idx])
            .unwrap_or(0)
    };

    let molecular_weight = STANDARD
        .iter()
        .zip(counts.iter())
        .map(|(residue, &count)| residue.mass * count as f64)
        .sum::<f64>()
        + WATER_MASS;

    let gravy = STANDARD
        .iter()
        .zip(counts.iter())
        .map(|(residue, &count)| residue.hydropathy * count as f64)
        .sum::<f64>()
        / standard_len as f64;

    let trp = count_of('W');
    let tyr = count_of('Y');
    let cys = count_of('C');
    let extinction_reduced = trp * 5500 + tyr * 1490;
    let extinction_oxidized = extinction_reduced + (cys / 2) * 125;

    let total_len = residues.len() as f64;
    let mole_percent = |code: char| count_of(code) as f64 / total_len * 100.0;
    let aliphatic_index =
        mole_percent('A') + 2.9 * mole_percent('V') + 3.9 * (mole_percent('I') + mole_percent('L'));

    let mut atoms = [0u64, 2, 0, 1, 0];
    for (residue, &count) in STANDARD.iter().zip(counts.iter()) {
        for (total, per_residue) in atoms.iter_mut().zip(residue.atoms.iter()) {
            *total += per_residue * count;
        }
    }
    let atomic_composition = format!(
        "C{}H{}N{}O{}S{}",
        atoms[0], atoms[1], atoms[2], atoms[3], atoms[4]
    );

    let first = residues.iter().copied().find(|ch| STANDARD.iter().any(|r| r.code == *ch));
    let last = residues.iter().rev().copied().find(|ch| STANDARD.iter().any(|r| r.code == *ch));
    let isoelectric_point = isoelectric_point(&count_of, first, last);

    let mut composition: Vec<ResidueCount> = STANDARD
        .iter()
        .zip(counts.iter())
        .map(|(residue, &count)| ResidueCount {
            code: residue.code,
            name: residue.name,
            count,
            percent: round1(count as f64 / total_len * 100.0),
        })
        .collect();
    composition.extend(EXTRA_CODES.iter().zip(extra_counts.iter()).map(
        |((code, name), &count)| ResidueCount {
            code: *code,
            name,
            count,
            percent: round1(count as f64 / total_len * 100.0),
        },
    ));

    Some(Parameters {
        length: residues.len(),
        molecular_weight: round2(molecular_weight),
        isoelectric_point: round2(isoelectric_point),
        gravy: round3(gravy),
        extinction_reduced,
        extinction_oxidized,
        aliphatic_index: round2(aliphatic_index),
        atomic_composition,
        composition,
        unrecognized,
        excluded: extra_counts.iter().sum(),
    })
}

/// Bjellqvist pK set; bisection on net charge over pH 0..14.
fn isoelectric_point(count_of: &dyn Fn(char) -> u64, first: Option<char>, last: Option<char>) -> f64 {
    let nterm_pk = first
        .and_then(|ch| PK_NTERM.iter().find(|(code, _)| *code == ch))
        .map(|(_, pk)| *pk)
        .unwrap_or(PK_NTERM_DEFAULT);
    let cterm_pk = last
        .and_then(|ch| PK_CTERM.iter().find(|(code, _)| *code == ch))
        .map(|(_, pk)| *pk)
        .unwrap_or(PK_CTERM_DEFAULT);

    let net_charge = |ph: f64| {
        let positive = |pk: f64| 1.0 / (10f64.powf(ph - pk) + 1.0);
        let negative = |pk: f64| 1.0 / (10f64.powf(pk - ph) + 1.0);
        let mut charge = positive(nterm_pk) - negative(cterm_pk);
        for (code, pk) in PK_POSITIVE {
            charge += count_of(*code) as f64 * positive(*pk);
        }
        for (code, pk) in PK_NEGATIVE {
            charge -= count_of(*code) as f64 * negative(*pk);
        }
        charge
    };

    let (mut low, mut high) = (0.0f64, 14.0f64);
    while high - low > 0.0001 {
        let mid = (low + high) / 2.0;
        if net_charge(mid) > 0.0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    (low + high) / 2.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Physicochemical adapter. Works on the sequence from the identity lookup
/// and never touches the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysicochemicalAdapter;

impl SourceAdapter for PhysicochemicalAdapter {
    fn source(&self) -> Source {
        Source::Physicochemical
    }

    fn fetch(&self, input: &AdapterInput, _timeout: Duration) -> Result<PartialRecord, FetchFailure> {
        let Some(sequence) = input.sequence.as_deref() else {
            return Ok(PartialRecord::skipped(Source::Physicochemical, SkipReason::NoSequence));
        };
        let Some(params) = compute_parameters(sequence) else {
            return Ok(PartialRecord::skipped(
                Source::Physicochemical,
                SkipReason::SequenceTooShort,
            ));
        };

        let mut partial = PartialRecord::new(Source::Physicochemical);
        partial.insert(MOLECULAR_WEIGHT, FieldValue::Number(params.molecular_weight));
        partial.insert(ISOELECTRIC_POINT, FieldValue::Number(params.isoelectric_point));
        partial.insert(GRAVY, FieldValue::Number(params.gravy));
        partial.insert(
            EXTINCTION_REDUCED,
            FieldValue::Integer(params.extinction_reduced as i64),
        );
        partial.insert(
            EXTINCTION_OXIDIZED,
            FieldValue::Integer(params.extinction_oxidized as i64),
        );
        partial.insert(ALIPHATIC_INDEX, FieldValue::Number(params.aliphatic_index));
        partial.insert(
            ATOMIC_COMPOSITION,
            FieldValue::Text(params.atomic_composition.clone()),
        );
        partial.insert(
            AMINO_ACID_COMPOSITION,
            FieldValue::Composition(params.composition.clone()),
        );

        if params.excluded > 0 {
            partial.warn(format!(
                "{} ambiguous or rare residues excluded from mass and charge",
                params.excluded
            ));
        }
        if !params.unrecognized.is_empty() {
            let letters: String = params.unrecognized.iter().collect();
            partial.warn(format!("unrecognized residue codes ignored: {letters}"));
        }
        Ok(partial)
    }
}
