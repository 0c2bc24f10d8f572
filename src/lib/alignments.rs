//! Alignment data model for the correction pipeline.
//!
//! An [`AlignmentSet`] bundles one target read with the overlaps supporting
//! it: per-query overlap coordinates, strand, and CIGAR operations as emitted
//! by the upstream all-vs-all mapper. Sequences and qualities are *not*
//! carried by the mapper output; they are filled in from the read store by
//! [`AlignmentSet::hydrate`], which also enforces the consistency invariant:
//! a set whose recorded lengths disagree with the fetched sequences or the
//! CIGAR-implied spans is rejected wholesale.

use crate::errors::{CorrectError, Result};
use crate::read_store::ReadStore;

/// Orientation of a query against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

/// One alignment operation. Match and mismatch are tracked separately so
/// alignment accuracy can be computed when the mapper distinguishes them
/// (`=`/`X`); plain `M` counts as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    Match(u32),
    Mismatch(u32),
    Insertion(u32),
    Deletion(u32),
}

impl CigarOp {
    /// Length of the operation in its consumed coordinate(s).
    #[must_use]
    pub fn len(&self) -> u32 {
        match self {
            CigarOp::Match(l) | CigarOp::Mismatch(l) | CigarOp::Insertion(l) | CigarOp::Deletion(l) => *l,
        }
    }

    /// Rebuild the operation with a different length.
    #[must_use]
    pub fn with_len(&self, len: u32) -> CigarOp {
        match self {
            CigarOp::Match(_) => CigarOp::Match(len),
            CigarOp::Mismatch(_) => CigarOp::Mismatch(len),
            CigarOp::Insertion(_) => CigarOp::Insertion(len),
            CigarOp::Deletion(_) => CigarOp::Deletion(len),
        }
    }

    /// Whether the operation consumes target positions.
    #[must_use]
    pub fn consumes_target(&self) -> bool {
        matches!(self, CigarOp::Match(_) | CigarOp::Mismatch(_) | CigarOp::Deletion(_))
    }

    /// Whether the operation consumes query positions.
    #[must_use]
    pub fn consumes_query(&self) -> bool {
        matches!(self, CigarOp::Match(_) | CigarOp::Mismatch(_) | CigarOp::Insertion(_))
    }
}

/// Parse a CIGAR string (e.g. the payload of a PAF `cg:Z:` tag).
///
/// Recognized operations: `M`, `=`, `X`, `I`, `D`. Anything else is an
/// [`CorrectError::UnknownCigarOp`] and fails the whole parse.
///
/// # Errors
///
/// Fails on unknown operations, missing lengths, or zero-length operations.
pub fn parse_cigar(text: &str) -> Result<Vec<CigarOp>> {
    let mut ops = Vec::new();
    let mut len: u32 = 0;
    let mut saw_digit = false;
    for ch in text.chars() {
        if let Some(d) = ch.to_digit(10) {
            len = len * 10 + d;
            saw_digit = true;
            continue;
        }
        if !saw_digit || len == 0 {
            return Err(CorrectError::UnknownCigarOp { op: ch });
        }
        let op = match ch {
            'M' | '=' => CigarOp::Match(len),
            'X' => CigarOp::Mismatch(len),
            'I' => CigarOp::Insertion(len),
            'D' => CigarOp::Deletion(len),
            other => return Err(CorrectError::UnknownCigarOp { op: other }),
        };
        ops.push(op);
        len = 0;
        saw_digit = false;
    }
    if saw_digit {
        // Trailing length with no operation character.
        return Err(CorrectError::UnknownCigarOp { op: ' ' });
    }
    Ok(ops)
}

/// Target and query spans implied by a CIGAR.
#[must_use]
pub fn cigar_spans(cigar: &[CigarOp]) -> (usize, usize) {
    let mut tspan = 0usize;
    let mut qspan = 0usize;
    for op in cigar {
        if op.consumes_target() {
            tspan += op.len() as usize;
        }
        if op.consumes_query() {
            qspan += op.len() as usize;
        }
    }
    (tspan, qspan)
}

/// Fraction of aligned columns that are matches. `M` counts as a match.
#[must_use]
pub fn alignment_accuracy(cigar: &[CigarOp]) -> f64 {
    let mut matches = 0u64;
    let mut total = 0u64;
    for op in cigar {
        let l = u64::from(op.len());
        total += l;
        if matches!(op, CigarOp::Match(_)) {
            matches += l;
        }
    }
    if total == 0 { 0.0 } else { matches as f64 / total as f64 }
}

/// Reverse complement of a nucleotide sequence. Non-ACGT bases map to `N`.
#[must_use]
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            _ => b'N',
        })
        .collect()
}

/// Overlap coordinates for one supporting query, as recorded by the mapper.
/// All coordinates are on the forward strand of the respective read; a
/// reverse-strand overlap means the query aligns reverse-complemented.
#[derive(Debug, Clone)]
pub struct Overlap {
    pub qlen: usize,
    pub qstart: usize,
    pub qend: usize,
    pub strand: Strand,
    pub tlen: usize,
    pub tstart: usize,
    pub tend: usize,
}

/// One supporting read: its overlap, CIGAR, and (after hydration) sequence
/// and quality fetched from the read store.
#[derive(Debug, Clone)]
pub struct Support {
    pub name: String,
    pub overlap: Overlap,
    pub cigar: Vec<CigarOp>,
    /// Forward-strand sequence, filled by [`AlignmentSet::hydrate`].
    pub seq: Vec<u8>,
    /// Phred+33 qualities, filled by [`AlignmentSet::hydrate`].
    pub qual: Vec<u8>,
}

/// One target read plus every overlap supporting it.
#[derive(Debug, Clone)]
pub struct AlignmentSet {
    pub read_name: String,
    /// Target sequence, filled by [`AlignmentSet::hydrate`].
    pub read_seq: Vec<u8>,
    /// Target phred+33 qualities, filled by [`AlignmentSet::hydrate`].
    pub read_qual: Vec<u8>,
    pub supports: Vec<Support>,
}

impl AlignmentSet {
    /// Create an empty (un-hydrated) set for a target read.
    #[must_use]
    pub fn new(read_name: impl Into<String>) -> Self {
        Self { read_name: read_name.into(), read_seq: Vec::new(), read_qual: Vec::new(), supports: Vec::new() }
    }

    /// Number of windows covering the target at the given window size.
    #[must_use]
    pub fn window_count(&self, window_size: usize) -> usize {
        self.read_seq.len().div_ceil(window_size)
    }

    /// Fetch target and query sequences/qualities from the read store and
    /// validate the whole set.
    ///
    /// Consistency invariant: each fetched query length must equal the
    /// overlap's recorded query length, each CIGAR-implied span must equal
    /// the recorded overlap span, and every overlap must agree on the target
    /// length. Any violation rejects the whole set; no partial use.
    ///
    /// # Errors
    ///
    /// [`CorrectError::ReadNotFound`] when a name is missing from the store;
    /// [`CorrectError::InconsistentAlignments`] on any invariant violation.
    pub fn hydrate(&mut self, store: &dyn ReadStore) -> Result<()> {
        self.read_seq = store.fetch_sequence(&self.read_name)?;
        self.read_qual = store.fetch_quality(&self.read_name)?;
        let tlen = self.read_seq.len();

        for support in &mut self.supports {
            support.seq = store.fetch_sequence(&support.name)?;
            support.qual = store.fetch_quality(&support.name)?;

            let ov = &support.overlap;
            if support.seq.len() != ov.qlen {
                return Err(CorrectError::InconsistentAlignments {
                    read: self.read_name.clone(),
                    reason: format!(
                        "query length {} for '{}' does not match fetched length {}",
                        ov.qlen,
                        support.name,
                        support.seq.len()
                    ),
                });
            }
            if ov.tlen != tlen {
                return Err(CorrectError::InconsistentAlignments {
                    read: self.read_name.clone(),
                    reason: format!("target length {} for '{}' does not match fetched length {tlen}", ov.tlen, support.name),
                });
            }
            let (tspan, qspan) = cigar_spans(&support.cigar);
            if qspan != ov.qend - ov.qstart {
                return Err(CorrectError::InconsistentAlignments {
                    read: self.read_name.clone(),
                    reason: format!(
                        "CIGAR query span {qspan} for '{}' does not match overlap span {}",
                        support.name,
                        ov.qend - ov.qstart
                    ),
                });
            }
            if tspan != ov.tend - ov.tstart {
                return Err(CorrectError::InconsistentAlignments {
                    read: self.read_name.clone(),
                    reason: format!(
                        "CIGAR target span {tspan} for '{}' does not match overlap span {}",
                        support.name,
                        ov.tend - ov.tstart
                    ),
                });
            }
        }
        Ok(())
    }
}
