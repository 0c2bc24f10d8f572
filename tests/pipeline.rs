//! Concurrency and end-to-end tests for the correction pipeline.
//!
//! These tests verify order preservation, segment splitting, validation,
//! batching, and failure handling under multi-threaded pipeline execution.
//! Stub extractors and engines stand in for the pileup builder and the
//! learned model so each property can be exercised in isolation; a handful
//! of tests run the real extractor and the majority-vote engine end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::unbounded;
use ndarray::Array2;

use lrcorrect_lib::alignments::{parse_cigar, AlignmentSet, Overlap, Strand, Support};
use lrcorrect_lib::decode::SeqRecord;
use lrcorrect_lib::engine::MajorityVoteEngine;
use lrcorrect_lib::errors::{CorrectError, Result as LibResult};
use lrcorrect_lib::features::{PileupExtractor, WindowFeature, WindowPileupExtractor, EMPTY, TOP_K};
use lrcorrect_lib::inference::{Device, InferenceBatch, InferenceEngine, InferenceError};
use lrcorrect_lib::pipeline::{CorrectionPipeline, Message, PipelineConfig};
use lrcorrect_lib::read_store::InMemoryReadStore;

// ============================================================================
// Test Helpers
// ============================================================================

/// Build a window feature whose target lane spells `text`, with `n_alns`
/// identical support lanes.
fn stub_feature(name: &str, idx: usize, n_alns: usize, text: &str, supported: Vec<usize>) -> WindowFeature {
    let n_columns = text.len();
    let mut bases = Array2::from_elem((n_columns, 1 + TOP_K), EMPTY);
    let mut quals = Array2::<f32>::zeros((n_columns, 1 + TOP_K));
    for (col, &b) in text.as_bytes().iter().enumerate() {
        bases[[col, 0]] = b;
        quals[[col, 0]] = 0.3;
        for lane in 1..=n_alns.min(TOP_K) {
            bases[[col, lane]] = b;
            quals[[col, lane]] = 0.3;
        }
    }
    WindowFeature {
        read_name: name.to_string(),
        window_idx: idx,
        n_alns,
        n_columns,
        bases,
        quals,
        supported,
        inferred_bases: None,
    }
}

/// An extractor that replays canned features per read name, ignoring the
/// alignment content entirely.
struct StubExtractor {
    features: HashMap<String, Vec<WindowFeature>>,
}

impl StubExtractor {
    fn new(features: Vec<(&str, Vec<WindowFeature>)>) -> Self {
        Self { features: features.into_iter().map(|(n, f)| (n.to_string(), f)).collect() }
    }
}

impl PileupExtractor for StubExtractor {
    fn extract_features(&self, set: &AlignmentSet, _window_size: usize) -> LibResult<Vec<WindowFeature>> {
        Ok(self.features.get(&set.read_name).cloned().unwrap_or_default())
    }
}

/// Symbol class of a target-lane byte, mirroring the model alphabet.
fn class_of(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// A test engine that predicts each column's target symbol (an identity
/// model), with configurable delays and injected out-of-memory failures.
#[derive(Default)]
struct TestEngine {
    /// Sleep this long per batch, scaled by the first target byte (see
    /// `delay_for`), to scramble completion order across workers.
    scramble_delays: bool,
    /// Fixed per-batch delay.
    fixed_delay: Duration,
    /// Fail this many leading `run_batch` calls with out-of-memory.
    fail_oom: AtomicUsize,
    /// Fail every call with out-of-memory.
    always_oom: bool,
    /// Item count of every executed batch, in invocation order.
    batch_sizes: Mutex<Vec<usize>>,
    /// Number of cache-clear requests observed.
    cache_clears: AtomicUsize,
}

impl TestEngine {
    fn identity() -> Self {
        Self::default()
    }

    fn delay_for(&self, batch: &InferenceBatch) -> Duration {
        if !self.scramble_delays || batch.lengths.is_empty() {
            return self.fixed_delay;
        }
        // Earlier test windows spell earlier alphabet letters; make them
        // slower so completion order inverts submission order.
        let first = batch.bases[[0, 0, 0]];
        let steps = match first {
            b'A' => 6,
            b'C' => 4,
            b'G' => 2,
            _ => 0,
        };
        Duration::from_millis(steps * 15)
    }
}

impl InferenceEngine for TestEngine {
    fn run_batch(&self, _device: &Device, batch: &InferenceBatch) -> Result<Vec<Vec<u8>>, InferenceError> {
        std::thread::sleep(self.delay_for(batch));
        if self.always_oom {
            return Err(InferenceError::OutOfMemory("synthetic".to_string()));
        }
        if self
            .fail_oom
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InferenceError::OutOfMemory("synthetic".to_string()));
        }

        self.batch_sizes.lock().unwrap().push(batch.lengths.len());
        let predictions = batch
            .lengths
            .iter()
            .enumerate()
            .map(|(item, &len)| (0..len).map(|col| class_of(batch.bases[[item, col, 0]])).collect())
            .collect();
        Ok(predictions)
    }

    fn clear_device_cache(&self, _device: &Device) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_slots_hint(&self, _device: &Device) -> usize {
        64
    }
}

/// Run `sets` through a pipeline built from the given pieces and return the
/// emitted records together with the pipeline result.
fn run_pipeline(
    config: PipelineConfig,
    store: InMemoryReadStore,
    extractor: Arc<dyn PileupExtractor>,
    engine: Arc<dyn InferenceEngine>,
    sets: Vec<AlignmentSet>,
) -> (Vec<SeqRecord>, LibResult<()>) {
    let (input_tx, input_rx) = unbounded();
    let (sink_tx, sink_rx) = unbounded();

    let pipeline =
        CorrectionPipeline::spawn(config, Arc::new(store), extractor, engine, input_rx, sink_tx)
            .expect("pipeline should start");

    for set in sets {
        input_tx.send(Message::Alignments(set)).unwrap();
    }
    drop(input_tx);

    let result = pipeline.wait();
    let records: Vec<SeqRecord> = sink_rx.iter().collect();
    (records, result)
}

/// A store holding a single bare target read (enough for stubbed extraction).
fn store_with(names: &[&str]) -> InMemoryReadStore {
    let mut store = InMemoryReadStore::new();
    for name in names {
        store.insert(*name, vec![b'A'; 16], vec![b'I'; 16]);
    }
    store
}

fn config_with(ingest: usize, decode: usize, batch_slots: usize) -> PipelineConfig {
    PipelineConfig {
        window_size: 16,
        ingest_threads: ingest,
        decode_threads: decode,
        batch_slots,
        ..Default::default()
    }
}

// ============================================================================
// Order preservation
// ============================================================================

/// Windows completing out of order across two device pools must still emit
/// in ascending window index order.
#[test]
fn test_window_order_survives_scrambled_completion() {
    let texts = ["AAAA", "CCCC", "GGGG", "TTTT"];
    let features: Vec<WindowFeature> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| stub_feature("r1", i, 2, t, vec![0]))
        .collect();

    let engine = Arc::new(TestEngine { scramble_delays: true, ..TestEngine::identity() });
    let config = PipelineConfig {
        // Two single-worker pools; one-slot budget makes every window its
        // own batch, so the per-batch delays interleave the pools.
        device: "cuda:0,1".to_string(),
        infer_threads: 1,
        batch_slots: 1,
        ..config_with(1, 4, 1)
    };

    let (records, result) = run_pipeline(
        config,
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        engine,
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "r1");
    assert_eq!(records[0].seq, "AAAACCCCGGGGTTTT");
}

/// Identity inference over many reads keeps every read intact.
#[test]
fn test_many_reads_all_complete() {
    let mut features = Vec::new();
    let mut names = Vec::new();
    let mut sets = Vec::new();
    let owned: Vec<String> = (0..20).map(|i| format!("read{i}")).collect();
    for name in &owned {
        let windows: Vec<WindowFeature> = (0..3)
            .map(|w| stub_feature(name, w, 2, "ACGTACGT", vec![0]))
            .collect();
        features.push((name.as_str(), windows));
        names.push(name.as_str());
        sets.push(AlignmentSet::new(name.clone()));
    }

    let (records, result) = run_pipeline(
        config_with(4, 4, 4),
        store_with(&names),
        Arc::new(StubExtractor::new(features)),
        Arc::new(TestEngine::identity()),
        sets,
    );

    result.unwrap();
    assert_eq!(records.len(), 20);
    for record in &records {
        assert_eq!(record.seq, "ACGTACGTACGTACGTACGTACGT");
    }
}

// ============================================================================
// Segment splitting and emission
// ============================================================================

/// A zero-support window splits the read; the first run keeps the bare name.
#[test]
fn test_segment_splitting_through_inference() {
    let features = vec![
        stub_feature("r1", 0, 2, "AAAA", vec![0]),
        stub_feature("r1", 1, 0, "CCCC", vec![]),
        stub_feature("r1", 2, 2, "TTTT", vec![0]),
    ];

    let (records, result) = run_pipeline(
        config_with(1, 2, 4),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::new(TestEngine::identity()),
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], SeqRecord { name: "r1".to_string(), seq: "AAAA".to_string() });
    assert_eq!(records[1], SeqRecord { name: "r1:1".to_string(), seq: "TTTT".to_string() });
}

/// Reads whose windows are all trivial bypass the queues entirely and still
/// obey the segment-splitting rule.
#[test]
fn test_trivial_only_read_emits_from_ingestion() {
    let features = vec![
        stub_feature("r1", 0, 1, "ACGT", vec![]),
        stub_feature("r1", 1, 0, "", vec![]),
        stub_feature("r1", 2, 1, "TTTT", vec![]),
    ];

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::new(TestEngine::identity()),
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "r1");
    assert_eq!(records[0].seq, "ACGT");
    assert_eq!(records[1].name, "r1:1");
    assert_eq!(records[1].seq, "TTTT");
}

/// All-empty windows emit no records at all.
#[test]
fn test_all_empty_read_emits_nothing() {
    let features = vec![
        stub_feature("r1", 0, 0, "AAAA", vec![]),
        stub_feature("r1", 1, 0, "CCCC", vec![]),
    ];

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::new(TestEngine::identity()),
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert!(records.is_empty());
}

// ============================================================================
// Validation and duplicate handling
// ============================================================================

/// One inconsistent overlap rejects the whole alignment set, even when other
/// overlaps in the set are fine.
#[test]
fn test_inconsistent_set_is_rejected_wholesale() {
    let mut store = InMemoryReadStore::new();
    store.insert("t", b"ACGTACGTAC".to_vec(), vec![b'I'; 10]);
    store.insert("good", b"ACGTACGT".to_vec(), vec![b'I'; 8]);
    store.insert("bad", b"ACGTACGT".to_vec(), vec![b'I'; 8]);

    let mut set = AlignmentSet::new("t");
    set.supports.push(Support {
        name: "good".to_string(),
        overlap: Overlap { qlen: 8, qstart: 0, qend: 8, strand: Strand::Forward, tlen: 10, tstart: 0, tend: 8 },
        cigar: parse_cigar("8M").unwrap(),
        seq: Vec::new(),
        qual: Vec::new(),
    });
    // Recorded query length disagrees with the stored read.
    set.supports.push(Support {
        name: "bad".to_string(),
        overlap: Overlap { qlen: 9, qstart: 0, qend: 8, strand: Strand::Forward, tlen: 10, tstart: 0, tend: 8 },
        cigar: parse_cigar("8M").unwrap(),
        seq: Vec::new(),
        qual: Vec::new(),
    });

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store,
        Arc::new(WindowPileupExtractor::default()),
        Arc::new(MajorityVoteEngine::new()),
        vec![set],
    );

    result.unwrap();
    assert!(records.is_empty(), "rejected read must emit no records");
}

/// A second registration for an in-flight read is dropped; only the first
/// submission's output appears.
#[test]
fn test_duplicate_read_registration_is_dropped() {
    let features = vec![stub_feature("dup", 0, 2, "ACGT", vec![0])];
    // Keep the first submission in flight long enough for the duplicate to
    // arrive while its state entry still exists.
    let engine = Arc::new(TestEngine { fixed_delay: Duration::from_millis(300), ..TestEngine::identity() });

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store_with(&["dup"]),
        Arc::new(StubExtractor::new(vec![("dup", features)])),
        engine,
        vec![AlignmentSet::new("dup"), AlignmentSet::new("dup")],
    );

    result.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "dup");
}

// ============================================================================
// Batching
// ============================================================================

/// Two windows of twice the slot threshold cannot share a three-slot batch.
#[test]
fn test_long_windows_do_not_share_a_small_batch() {
    let long_text = "A".repeat(10_240);
    let features = vec![
        stub_feature("r1", 0, 2, &long_text, vec![0]),
        stub_feature("r1", 1, 2, &long_text, vec![0]),
    ];

    let engine = Arc::new(TestEngine::identity());
    let (records, result) = run_pipeline(
        config_with(1, 1, 3),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::clone(&engine) as Arc<dyn InferenceEngine>,
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq.len(), 20_480);
    // Each two-slot window was flushed on its own.
    assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![1, 1]);
}

/// Short windows pack together up to the slot budget.
#[test]
fn test_short_windows_share_batches() {
    let features: Vec<WindowFeature> =
        (0..6).map(|i| stub_feature("r1", i, 2, "ACGT", vec![0])).collect();

    let engine = Arc::new(TestEngine::identity());
    let (records, result) = run_pipeline(
        config_with(1, 1, 8),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::clone(&engine) as Arc<dyn InferenceEngine>,
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 1);
    let sizes = engine.batch_sizes.lock().unwrap().clone();
    assert_eq!(sizes.iter().sum::<usize>(), 6);
    // With an 8-slot budget nothing forces six one-item batches.
    assert!(sizes.len() < 6, "expected batched execution, got {sizes:?}");
}

// ============================================================================
// Failure handling
// ============================================================================

/// One out-of-memory failure is absorbed by a cache clear and retry.
#[test]
fn test_oom_retry_once_recovers() {
    let features = vec![stub_feature("r1", 0, 2, "ACGT", vec![0])];
    let engine = Arc::new(TestEngine { fail_oom: AtomicUsize::new(1), ..TestEngine::identity() });

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        Arc::clone(&engine) as Arc<dyn InferenceEngine>,
        vec![AlignmentSet::new("r1")],
    );

    result.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq, "ACGT");
    assert_eq!(engine.cache_clears.load(Ordering::SeqCst), 1);
}

/// A second consecutive out-of-memory failure is fatal and surfaces from
/// `wait` without hanging any stage.
#[test]
fn test_persistent_oom_is_fatal() {
    let features = vec![stub_feature("r1", 0, 2, "ACGT", vec![0])];
    let engine = Arc::new(TestEngine { always_oom: true, ..TestEngine::identity() });

    let (records, result) = run_pipeline(
        config_with(1, 1, 4),
        store_with(&["r1"]),
        Arc::new(StubExtractor::new(vec![("r1", features)])),
        engine,
        vec![AlignmentSet::new("r1")],
    );

    assert!(matches!(result, Err(CorrectError::InferenceFailed { .. })));
    assert!(records.is_empty());
}

// ============================================================================
// End-to-end determinism
// ============================================================================

/// The same alignments under different target names produce byte-identical
/// corrected output.
#[test]
fn test_rerun_is_byte_identical() {
    let target = b"ACGTACGTACGTACGTACGTACGT".to_vec();
    // Both supports carry the same single mismatch, so the vote engine
    // corrects the target at that column.
    let mut support_seq = target.clone();
    support_seq[5] = b'T';

    let mut store = InMemoryReadStore::new();
    store.insert("s1", support_seq.clone(), vec![b'I'; 24]);
    store.insert("s2", support_seq.clone(), vec![b'I'; 24]);

    let mut sets = Vec::new();
    for name in ["runA", "runB"] {
        store.insert(name, target.clone(), vec![b'I'; 24]);
        let mut set = AlignmentSet::new(name);
        for sup in ["s1", "s2"] {
            set.supports.push(Support {
                name: sup.to_string(),
                overlap: Overlap {
                    qlen: 24,
                    qstart: 0,
                    qend: 24,
                    strand: Strand::Forward,
                    tlen: 24,
                    tstart: 0,
                    tend: 24,
                },
                cigar: parse_cigar("5M1X18M").unwrap(),
                seq: Vec::new(),
                qual: Vec::new(),
            });
        }
        sets.push(set);
    }

    let (records, result) = run_pipeline(
        PipelineConfig { window_size: 24, ingest_threads: 2, decode_threads: 2, batch_slots: 4, ..Default::default() },
        store,
        Arc::new(WindowPileupExtractor::default()),
        Arc::new(MajorityVoteEngine::new()),
        sets,
    );

    result.unwrap();
    assert_eq!(records.len(), 2);
    let run_a = records.iter().find(|r| r.name == "runA").unwrap();
    let run_b = records.iter().find(|r| r.name == "runB").unwrap();
    assert_eq!(run_a.seq, run_b.seq);
    assert_eq!(run_a.seq.len(), 24);
    assert_eq!(run_a.seq.as_bytes()[5], b'T', "the supported column takes the majority base");
}
