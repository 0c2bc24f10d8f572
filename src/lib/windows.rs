//! Partitioning of overlaps into fixed-size target windows.
//!
//! Each supporting alignment is walked along the target and split at window
//! boundaries into [`OverlapWindow`] pieces. A piece owns its clipped CIGAR
//! outright, so window features can be built and moved between stages without
//! borrowing from the alignment set.
//!
//! Insertions consume no target positions; an insertion is anchored to the
//! preceding target column and therefore lands in that column's window. An
//! insertion at the very start of an overlap has no anchor and is dropped.

use crate::alignments::{AlignmentSet, CigarOp};

/// One supporting alignment's contribution to one window.
#[derive(Debug, Clone)]
pub struct OverlapWindow {
    /// Index of the support within its [`AlignmentSet`].
    pub support_idx: usize,
    /// First target column covered, relative to the window start.
    pub tstart: usize,
    /// First consumed position within the oriented query slice.
    pub qstart: usize,
    /// CIGAR operations clipped to this window's target span.
    pub cigar: Vec<CigarOp>,
}

impl OverlapWindow {
    fn new(support_idx: usize, tstart: usize, qstart: usize) -> Self {
        Self { support_idx, tstart, qstart, cigar: Vec::new() }
    }
}

/// Split every support of `set` into per-window pieces.
///
/// The result has exactly `set.window_count(window_size)` entries; entry `w`
/// lists the pieces overlapping window `w`, in support order.
#[must_use]
pub fn extract_windows(set: &AlignmentSet, window_size: usize) -> Vec<Vec<OverlapWindow>> {
    let n_windows = set.window_count(window_size);
    let mut windows: Vec<Vec<OverlapWindow>> = vec![Vec::new(); n_windows];

    for (support_idx, support) in set.supports.iter().enumerate() {
        // Position on the target and within the oriented query slice.
        let mut tpos = support.overlap.tstart;
        let mut qpos = 0usize;
        // Window index of the piece currently being extended for this
        // support, if any.
        let mut open: Option<usize> = None;

        for op in &support.cigar {
            match op {
                CigarOp::Insertion(l) => {
                    if tpos > support.overlap.tstart {
                        // Anchored to the previous target column's window,
                        // which is necessarily the open piece.
                        let w = open.expect("insertion follows a target-consuming op");
                        windows[w].last_mut().expect("open piece exists").cigar.push(*op);
                    }
                    qpos += *l as usize;
                }
                _ => {
                    let mut remaining = op.len() as usize;
                    while remaining > 0 {
                        let w = tpos / window_size;
                        let window_end = (w + 1) * window_size;
                        let take = remaining.min(window_end - tpos);

                        if open != Some(w) {
                            windows[w].push(OverlapWindow::new(support_idx, tpos - w * window_size, qpos));
                            open = Some(w);
                        }
                        windows[w]
                            .last_mut()
                            .expect("piece was just opened")
                            .cigar
                            .push(op.with_len(take as u32));

                        tpos += take;
                        if op.consumes_query() {
                            qpos += take;
                        }
                        remaining -= take;
                    }
                }
            }
        }
    }

    windows
}
