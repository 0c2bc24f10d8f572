//! Decoding of window predictions into corrected text, and emission of
//! corrected reads as segment records.
//!
//! Decoding walks a window's pileup columns once: supported columns take the
//! model's predicted symbol, all other columns keep the target's symbol, and
//! gap symbols emit nothing. A window with no supporting alignments decodes
//! to the empty string: there is no evidence to correct against, and the
//! empty segment later becomes a break point between output records.

use crate::features::{WindowFeature, EMPTY, GAP_FORWARD, GAP_REVERSE};

/// Model alphabet: class index to symbol. Class 4 is the deletion/gap
/// placeholder and never reaches the output.
pub const BASE_DECODER: [u8; 5] = [b'A', b'C', b'G', b'T', b'*'];

/// One corrected output record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqRecord {
    pub name: String,
    pub seq: String,
}

fn is_gap(symbol: u8) -> bool {
    matches!(symbol, GAP_FORWARD | GAP_REVERSE | EMPTY)
}

/// Decode one window into its corrected text.
///
/// Returns the empty string for windows without support (break point).
#[must_use]
pub fn decode_window(wf: &WindowFeature) -> String {
    if wf.n_alns == 0 {
        return String::new();
    }

    let mut out = String::with_capacity(wf.n_columns);
    let mut supported = wf.supported.iter().peekable();
    for col in 0..wf.n_columns {
        let is_supported = supported.next_if(|&&s| s == col).is_some();
        let symbol = match (&wf.inferred_bases, is_supported) {
            (Some(preds), true) => BASE_DECODER[preds[col] as usize],
            _ => wf.bases[[col, 0]],
        };
        if !is_gap(symbol) {
            out.push(symbol.to_ascii_uppercase() as char);
        }
    }
    out
}

/// Split a read's ordered window segments into output records.
///
/// Consecutive non-empty segments concatenate into one corrected run; an
/// empty segment breaks the run. The first run keeps the read name, each
/// later run is named `<read-name>:<run-index>`. All-empty input yields no
/// records.
#[must_use]
pub fn segment_records(read_name: &str, segments: &[String]) -> Vec<SeqRecord> {
    let mut records = Vec::new();
    let mut run = String::new();
    for segment in segments {
        if segment.is_empty() {
            if !run.is_empty() {
                records.push(run);
                run = String::new();
            }
        } else {
            run.push_str(segment);
        }
    }
    if !run.is_empty() {
        records.push(run);
    }

    records
        .into_iter()
        .enumerate()
        .map(|(i, seq)| {
            let name = if i == 0 { read_name.to_string() } else { format!("{read_name}:{i}") };
            SeqRecord { name, seq }
        })
        .collect()
}
