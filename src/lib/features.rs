//! Pileup feature construction.
//!
//! For every window of a target read this module builds the model-facing
//! feature bundle: a base matrix and a quality matrix whose rows are pileup
//! columns (target positions plus insertion columns) and whose lanes are the
//! target followed by up to [`TOP_K`] supporting reads, ranked by alignment
//! accuracy.
//!
//! Encoding follows the pileup conventions of the correction model:
//! forward-strand bases as uppercase with `*` for gaps, reverse-strand bases
//! as lowercase with `#` for gaps, and `.` for cells outside a lane's aligned
//! span. Qualities are normalized to `[0, 1]`; cells without a base carry 0.

use ndarray::Array2;

use crate::alignments::{alignment_accuracy, reverse_complement, AlignmentSet, CigarOp, Strand};
use crate::errors::Result;
use crate::windows::{extract_windows, OverlapWindow};

/// Maximum number of supporting reads per window lane set.
pub const TOP_K: usize = 30;

/// Minimum alignment accuracy for a window piece to contribute to a pileup.
pub const MIN_WINDOW_ACCURACY: f64 = 0.85;

/// Window pieces containing an insertion or deletion at least this long are
/// discarded.
pub const MAX_INDEL_LEN: u32 = 30;

/// Empty-cell marker: the lane has no aligned base at this column.
pub const EMPTY: u8 = b'.';

/// Gap marker on the forward strand.
pub const GAP_FORWARD: u8 = b'*';

/// Gap marker on the reverse strand.
pub const GAP_REVERSE: u8 = b'#';

/// The unit of work flowing through the pipeline: one window's pileup
/// features, later annotated with the model's predictions.
#[derive(Debug, Clone)]
pub struct WindowFeature {
    /// Owning read.
    pub read_name: String,
    /// Ordinal window index within the read (0-based, contiguous).
    pub window_idx: usize,
    /// Number of supporting alignments in the pileup.
    pub n_alns: usize,
    /// Number of pileup columns (target positions + insertion columns).
    pub n_columns: usize,
    /// Base matrix, shape `(n_columns, 1 + TOP_K)`; lane 0 is the target.
    pub bases: Array2<u8>,
    /// Normalized quality matrix, same shape as `bases`.
    pub quals: Array2<f32>,
    /// Columns with enough disagreement against the target to warrant model
    /// correction, ascending.
    pub supported: Vec<usize>,
    /// Per-column class predictions, filled by the inference stage.
    pub inferred_bases: Option<Vec<u8>>,
}

impl WindowFeature {
    /// Whether this window must go through the model. Windows with at most
    /// one support or no supported columns are trivial and decode directly.
    #[must_use]
    pub fn needs_inference(&self) -> bool {
        self.n_alns > 1 && !self.supported.is_empty()
    }
}

/// Produces the per-window feature bundles for one alignment set.
///
/// Contract: the output has exactly `set.window_count(window_size)` entries
/// and entry `w` describes window `w`.
pub trait PileupExtractor: Send + Sync {
    /// Build one [`WindowFeature`] per window of the target read.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the default extractor only fails on internal
    /// invariant violations surfaced by upstream validation.
    fn extract_features(&self, set: &AlignmentSet, window_size: usize) -> Result<Vec<WindowFeature>>;
}

/// Symbol class in the model alphabet: A=0, C=1, G=2, T=3, gap=4.
/// Unknown bases (e.g. `N`) get a class that never matches a real one.
fn symbol_class(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        GAP_FORWARD | GAP_REVERSE => 4,
        _ => 5,
    }
}

/// Normalize a phred+33 quality byte into `[0, 1]`.
fn normalize_qual(q: u8) -> f32 {
    (f32::from(q) - 33.0).max(0.0) / 93.0
}

/// The default extractor: accuracy-filtered, top-K-ranked pileups with
/// insertion-column expansion.
#[derive(Debug, Clone)]
pub struct WindowPileupExtractor {
    pub min_accuracy: f64,
    pub max_indel_len: u32,
    pub top_k: usize,
    /// A column is supported when at least this many present supports
    /// disagree with the target symbol.
    pub min_disagreement: usize,
}

impl Default for WindowPileupExtractor {
    fn default() -> Self {
        Self { min_accuracy: MIN_WINDOW_ACCURACY, max_indel_len: MAX_INDEL_LEN, top_k: TOP_K, min_disagreement: 2 }
    }
}

impl PileupExtractor for WindowPileupExtractor {
    fn extract_features(&self, set: &AlignmentSet, window_size: usize) -> Result<Vec<WindowFeature>> {
        let n_windows = set.window_count(window_size);
        let mut pieces = extract_windows(set, window_size);

        // Oriented query slices are shared by every window a support touches.
        let oriented: Vec<(Vec<u8>, Vec<u8>)> = set
            .supports
            .iter()
            .map(|s| {
                let range = s.overlap.qstart..s.overlap.qend;
                match s.overlap.strand {
                    Strand::Forward => (s.seq[range.clone()].to_vec(), s.qual[range].to_vec()),
                    Strand::Reverse => (
                        reverse_complement(&s.seq[range.clone()]),
                        s.qual[range].iter().rev().copied().collect(),
                    ),
                }
            })
            .collect();

        let mut features = Vec::with_capacity(n_windows);
        for (w, mut entries) in pieces.drain(..).enumerate() {
            let wstart = w * window_size;
            let wlen = window_size.min(set.read_seq.len() - wstart);

            entries.retain(|e| {
                let long_indel = e.cigar.iter().any(|op| {
                    matches!(op, CigarOp::Insertion(l) | CigarOp::Deletion(l) if *l >= self.max_indel_len)
                });
                !long_indel && alignment_accuracy(&e.cigar) >= self.min_accuracy
            });
            entries.sort_by(|a, b| {
                alignment_accuracy(&b.cigar)
                    .partial_cmp(&alignment_accuracy(&a.cigar))
                    .expect("accuracies are finite")
            });
            entries.truncate(self.top_k);

            features.push(self.build_feature(set, &oriented, w, wstart, wlen, &entries));
        }
        Ok(features)
    }
}

impl WindowPileupExtractor {
    fn build_feature(
        &self,
        set: &AlignmentSet,
        oriented: &[(Vec<u8>, Vec<u8>)],
        window_idx: usize,
        wstart: usize,
        wlen: usize,
        entries: &[OverlapWindow],
    ) -> WindowFeature {
        // Widest insertion run after each target position in this window.
        let mut max_ins = vec![0u32; wlen];
        for e in entries {
            let mut t = e.tstart;
            for op in &e.cigar {
                match op {
                    CigarOp::Insertion(l) => {
                        max_ins[t - 1] = max_ins[t - 1].max(*l);
                    }
                    _ => t += op.len() as usize,
                }
            }
        }

        // Pileup column of each target position.
        let mut col_of = Vec::with_capacity(wlen);
        let mut col = 0usize;
        for ins in &max_ins {
            col_of.push(col);
            col += 1 + *ins as usize;
        }
        let n_columns = col;

        let depth = 1 + self.top_k;
        let mut bases = Array2::from_elem((n_columns, depth), EMPTY);
        let mut quals = Array2::<f32>::zeros((n_columns, depth));

        // Lane 0: the target. Insertion columns show a gap.
        for c in 0..n_columns {
            bases[[c, 0]] = GAP_FORWARD;
        }
        for i in 0..wlen {
            bases[[col_of[i], 0]] = set.read_seq[wstart + i].to_ascii_uppercase();
            quals[[col_of[i], 0]] = normalize_qual(set.read_qual[wstart + i]);
        }

        for (lane0, e) in entries.iter().enumerate() {
            let lane = lane0 + 1;
            let strand = set.supports[e.support_idx].overlap.strand;
            let (qseq, qqual) = &oriented[e.support_idx];
            self.fill_lane(&mut bases, &mut quals, lane, e, strand, qseq, qqual, &max_ins, &col_of);
        }

        let supported = self.supported_columns(&bases, n_columns, entries.len());

        WindowFeature {
            read_name: set.read_name.clone(),
            window_idx,
            n_alns: entries.len(),
            n_columns,
            bases,
            quals,
            supported,
            inferred_bases: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_lane(
        &self,
        bases: &mut Array2<u8>,
        quals: &mut Array2<f32>,
        lane: usize,
        e: &OverlapWindow,
        strand: Strand,
        qseq: &[u8],
        qqual: &[u8],
        max_ins: &[u32],
        col_of: &[usize],
    ) {
        let gap = match strand {
            Strand::Forward => GAP_FORWARD,
            Strand::Reverse => GAP_REVERSE,
        };
        let encode = |b: u8| match strand {
            Strand::Forward => b.to_ascii_uppercase(),
            Strand::Reverse => b.to_ascii_lowercase(),
        };

        let mut t = e.tstart;
        let mut q = e.qstart;
        let mut col = col_of[e.tstart];

        for op in &e.cigar {
            match op {
                CigarOp::Match(l) | CigarOp::Mismatch(l) => {
                    for _ in 0..*l {
                        bases[[col, lane]] = encode(qseq[q]);
                        quals[[col, lane]] = normalize_qual(qqual[q]);
                        q += 1;
                        // Insertion slots after this position default to a
                        // gap within the aligned span; a following insertion
                        // op overwrites them.
                        for k in 0..max_ins[t] as usize {
                            bases[[col + 1 + k, lane]] = gap;
                        }
                        col += 1 + max_ins[t] as usize;
                        t += 1;
                    }
                }
                CigarOp::Deletion(l) => {
                    for _ in 0..*l {
                        bases[[col, lane]] = gap;
                        for k in 0..max_ins[t] as usize {
                            bases[[col + 1 + k, lane]] = gap;
                        }
                        col += 1 + max_ins[t] as usize;
                        t += 1;
                    }
                }
                CigarOp::Insertion(l) => {
                    let anchor_slots = max_ins[t - 1] as usize;
                    let first_slot = col - anchor_slots;
                    for i in 0..*l as usize {
                        bases[[first_slot + i, lane]] = encode(qseq[q]);
                        quals[[first_slot + i, lane]] = normalize_qual(qqual[q]);
                        q += 1;
                    }
                }
            }
        }
    }

    /// Columns whose support contradicts the target strongly enough to ask
    /// the model. With fewer than two supports nothing is supported.
    fn supported_columns(&self, bases: &Array2<u8>, n_columns: usize, n_alns: usize) -> Vec<usize> {
        let mut supported = Vec::new();
        if n_alns < 2 {
            return supported;
        }
        for col in 0..n_columns {
            let target_class = symbol_class(bases[[col, 0]]);
            let mut present = 0usize;
            let mut disagree = 0usize;
            for lane in 1..=n_alns {
                let b = bases[[col, lane]];
                if b == EMPTY {
                    continue;
                }
                present += 1;
                if symbol_class(b) != target_class {
                    disagree += 1;
                }
            }
            if present >= 2 && disagree >= self.min_disagreement {
                supported.push(col);
            }
        }
        supported
    }
}
