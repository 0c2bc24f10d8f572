//! The concurrent correction pipeline.
//!
//! Three stages, each its own pool of OS threads, connected by bounded
//! queues:
//!
//! ```text
//! input ─→ Ingestion ──→ feature queue ──→ Inference ──→ inferred queue ──→ Decode ──→ sink
//!              │                                                              ▲
//!              └── trivial windows decode synchronously; trivial-only reads ──┘
//!                  emit straight to the sink
//! ```
//!
//! Shutdown cascades with the data: the input channel closing ends the
//! ingestion workers, the last ingestion worker terminates the feature
//! queue, the last inference worker (across all devices) terminates the
//! inferred queue, and `wait` joins the stages in that order. Bounded queue
//! capacities are the backpressure mechanism: when inference falls behind,
//! ingestion blocks on `push` instead of growing memory without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::alignments::AlignmentSet;
use crate::decode::{decode_window, segment_records, SeqRecord};
use crate::errors::{CorrectError, Result};
use crate::features::{PileupExtractor, WindowFeature};
use crate::inference::{
    batch_slots_for, collate, parse_device_string, Device, InferenceEngine, InferenceError,
};
use crate::progress::ProgressTracker;
use crate::queue::{AsyncQueue, PopResult};
use crate::read_store::ReadStore;
use crate::registry::{Completion, ReadStateRegistry};

/// Default capacity of the ingestion → inference queue. Substantially larger
/// than the inferred queue so feature extraction can run ahead of the model.
pub const FEATURE_QUEUE_CAPACITY: usize = 1000;

/// Default capacity of the inference → decode queue.
pub const INFERRED_QUEUE_CAPACITY: usize = 500;

/// How long an inference worker waits for more work before flushing a
/// partial batch.
pub const BATCH_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// A message flowing into the pipeline. Anything that is not an alignment
/// set passes through to the sink unchanged.
#[derive(Debug)]
pub enum Message {
    Alignments(AlignmentSet),
    Record(SeqRecord),
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window size in target bases (the model's expected input width).
    pub window_size: usize,
    /// Device selector: `cpu`, `cuda`, `cuda:1` or `cuda:0,1`.
    pub device: String,
    /// Inference workers per device. Forced to 1 on cpu.
    pub infer_threads: usize,
    /// Ingestion workers.
    pub ingest_threads: usize,
    /// Decode workers.
    pub decode_threads: usize,
    /// Batch-slot budget per inference worker. 0 probes the device.
    pub batch_slots: usize,
    /// Partial-batch flush deadline.
    pub batch_flush_timeout: Duration,
    pub feature_queue_capacity: usize,
    pub inferred_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 4096,
            device: "cpu".to_string(),
            infer_threads: 2,
            ingest_threads: 4,
            decode_threads: 4,
            batch_slots: 0,
            batch_flush_timeout: BATCH_FLUSH_TIMEOUT,
            feature_queue_capacity: FEATURE_QUEUE_CAPACITY,
            inferred_queue_capacity: INFERRED_QUEUE_CAPACITY,
        }
    }
}

/// Handle to a running correction pipeline.
pub struct CorrectionPipeline {
    ingest_handles: Vec<JoinHandle<Result<()>>>,
    infer_handles: Vec<JoinHandle<Result<()>>>,
    decode_handles: Vec<JoinHandle<Result<()>>>,
    progress: Arc<ProgressTracker>,
}

impl CorrectionPipeline {
    /// Validate the configuration, derive per-device batch budgets, and
    /// spawn every stage. Returns once all threads are running; the caller
    /// feeds `input` and drains `sink` concurrently, then calls
    /// [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Fails on an unparseable device string or when a device's memory probe
    /// yields no usable batch budget.
    pub fn spawn(
        config: PipelineConfig,
        store: Arc<dyn ReadStore>,
        extractor: Arc<dyn PileupExtractor>,
        engine: Arc<dyn InferenceEngine>,
        input: Receiver<Message>,
        sink: Sender<SeqRecord>,
    ) -> Result<Self> {
        let devices = parse_device_string(&config.device)?;
        let workers_per_device = if devices == [Device::Cpu] { 1 } else { config.infer_threads.max(1) };

        // Resolve each device's batch budget up front so a hopeless device
        // aborts the run before any thread starts.
        let mut budgets = Vec::with_capacity(devices.len());
        for device in &devices {
            let budget = if config.batch_slots == 0 {
                engine.batch_slots_hint(device)
            } else {
                config.batch_slots
            };
            if budget == 0 {
                return Err(CorrectError::InsufficientDeviceMemory { device: device.to_string() });
            }
            debug!("Using batch budget of {budget} slots on {device}");
            budgets.push(budget);
        }

        let feature_queue = Arc::new(AsyncQueue::new(config.feature_queue_capacity));
        let inferred_queue = Arc::new(AsyncQueue::new(config.inferred_queue_capacity));
        let registry = Arc::new(ReadStateRegistry::new());
        let progress = Arc::new(ProgressTracker::new("Corrected reads"));

        let active_ingest = Arc::new(AtomicUsize::new(config.ingest_threads));
        let active_infer = Arc::new(AtomicUsize::new(devices.len() * workers_per_device));

        let mut ingest_handles = Vec::with_capacity(config.ingest_threads);
        for _ in 0..config.ingest_threads {
            let ctx = IngestContext {
                input: input.clone(),
                sink: sink.clone(),
                store: Arc::clone(&store),
                extractor: Arc::clone(&extractor),
                registry: Arc::clone(&registry),
                feature_queue: Arc::clone(&feature_queue),
                progress: Arc::clone(&progress),
                active: Arc::clone(&active_ingest),
                window_size: config.window_size,
            };
            ingest_handles.push(thread::spawn(move || ingest_worker(&ctx)));
        }

        let mut infer_handles = Vec::new();
        for (device, budget) in devices.iter().zip(&budgets) {
            // One mutex per device: workers sharing a device serialize the
            // engine invocation, different devices run in parallel.
            let device_mutex = Arc::new(Mutex::new(()));
            for _ in 0..workers_per_device {
                let ctx = InferContext {
                    device: *device,
                    budget: *budget,
                    device_mutex: Arc::clone(&device_mutex),
                    engine: Arc::clone(&engine),
                    feature_queue: Arc::clone(&feature_queue),
                    inferred_queue: Arc::clone(&inferred_queue),
                    active: Arc::clone(&active_infer),
                    flush_timeout: config.batch_flush_timeout,
                };
                infer_handles.push(thread::spawn(move || infer_worker(&ctx)));
            }
        }

        let mut decode_handles = Vec::with_capacity(config.decode_threads);
        for _ in 0..config.decode_threads {
            let inferred_queue = Arc::clone(&inferred_queue);
            let registry = Arc::clone(&registry);
            let sink = sink.clone();
            let progress = Arc::clone(&progress);
            decode_handles.push(thread::spawn(move || {
                decode_worker(&inferred_queue, &registry, &sink, &progress)
            }));
        }

        Ok(Self { ingest_handles, infer_handles, decode_handles, progress })
    }

    /// Join every stage in dependency order and surface the first error.
    ///
    /// # Errors
    ///
    /// The first worker failure (fatal inference error, I/O failure) or a
    /// worker panic.
    pub fn wait(self) -> Result<()> {
        let mut first_err: Option<CorrectError> = None;
        let handles = self
            .ingest_handles
            .into_iter()
            .chain(self.infer_handles)
            .chain(self.decode_handles);
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(CorrectError::Io(std::io::Error::other(
                            "pipeline worker thread panicked",
                        )));
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                self.progress.log_final();
                Ok(())
            }
        }
    }
}

// ============================================================================
// Ingestion stage
// ============================================================================

struct IngestContext {
    input: Receiver<Message>,
    sink: Sender<SeqRecord>,
    store: Arc<dyn ReadStore>,
    extractor: Arc<dyn PileupExtractor>,
    registry: Arc<ReadStateRegistry>,
    feature_queue: Arc<AsyncQueue<WindowFeature>>,
    progress: Arc<ProgressTracker>,
    active: Arc<AtomicUsize>,
    window_size: usize,
}

fn ingest_worker(ctx: &IngestContext) -> Result<()> {
    let result = (|| {
        for message in ctx.input.iter() {
            match message {
                Message::Record(record) => {
                    if ctx.sink.send(record).is_err() {
                        break;
                    }
                }
                Message::Alignments(set) => process_alignment_set(ctx, set)?,
            }
        }
        Ok(())
    })();

    // The last worker out closes the feature queue, success or not.
    if ctx.active.fetch_sub(1, Ordering::AcqRel) == 1 {
        ctx.feature_queue.terminate();
    }
    result
}

fn process_alignment_set(ctx: &IngestContext, mut set: AlignmentSet) -> Result<()> {
    let read_name = set.read_name.clone();

    if let Err(err) = set.hydrate(ctx.store.as_ref()) {
        match err {
            CorrectError::InconsistentAlignments { .. } | CorrectError::ReadNotFound { .. } => {
                error!("Dropping read '{read_name}': {err}");
                return Ok(());
            }
            fatal => return Err(fatal),
        }
    }

    let features = ctx.extractor.extract_features(&set, ctx.window_size)?;
    drop(set);

    let mut segments = vec![String::new(); features.len()];
    let mut to_infer = Vec::new();
    for wf in features {
        if wf.needs_inference() {
            to_infer.push(wf);
        } else {
            segments[wf.window_idx] = decode_window(&wf);
        }
    }

    if to_infer.is_empty() {
        // Nothing for the model: this worker is its own aggregation stage.
        emit_read(&ctx.sink, &read_name, &segments, &ctx.progress);
        return Ok(());
    }

    // Register before pushing any window, so an early-completing window
    // always finds the entry.
    if !ctx.registry.register(&read_name, segments, to_infer.len()) {
        error!("Read state for '{read_name}' already exists, dropping read");
        return Ok(());
    }
    for wf in to_infer {
        if ctx.feature_queue.push(wf).is_err() {
            // Terminated early: a fatal error elsewhere is unwinding the
            // pipeline. Stop feeding it.
            debug!("Feature queue terminated while ingesting '{read_name}'");
            return Ok(());
        }
    }
    Ok(())
}

fn emit_read(sink: &Sender<SeqRecord>, read_name: &str, segments: &[String], progress: &ProgressTracker) {
    for record in segment_records(read_name, segments) {
        if sink.send(record).is_err() {
            return;
        }
    }
    progress.log_if_needed(1);
}

// ============================================================================
// Inference stage
// ============================================================================

struct InferContext {
    device: Device,
    budget: usize,
    device_mutex: Arc<Mutex<()>>,
    engine: Arc<dyn InferenceEngine>,
    feature_queue: Arc<AsyncQueue<WindowFeature>>,
    inferred_queue: Arc<AsyncQueue<WindowFeature>>,
    active: Arc<AtomicUsize>,
    flush_timeout: Duration,
}

fn infer_worker(ctx: &InferContext) -> Result<()> {
    debug!("Starting inference worker for {}", ctx.device);

    let result = (|| {
        let mut pending: Vec<WindowFeature> = Vec::new();
        let mut used_slots = 0usize;

        loop {
            match ctx.feature_queue.pop_deadline(ctx.flush_timeout) {
                PopResult::Terminated => break,
                PopResult::Timeout => {
                    // Bound tail latency: don't sit on a partial batch.
                    if !pending.is_empty() {
                        flush_batch(ctx, &mut pending)?;
                        used_slots = 0;
                    }
                }
                PopResult::Item(wf) => {
                    let needed = batch_slots_for(wf.n_columns);
                    if used_slots + needed > ctx.budget && !pending.is_empty() {
                        flush_batch(ctx, &mut pending)?;
                        used_slots = 0;
                    }
                    used_slots += needed;
                    pending.push(wf);
                }
            }
        }
        if !pending.is_empty() {
            flush_batch(ctx, &mut pending)?;
        }
        Ok(())
    })();

    if ctx.active.fetch_sub(1, Ordering::AcqRel) == 1 {
        ctx.inferred_queue.terminate();
    }
    if result.is_err() {
        // Fatal: unwind the whole pipeline rather than letting the other
        // stages block forever.
        ctx.feature_queue.terminate();
        ctx.inferred_queue.terminate();
    }
    result
}

fn flush_batch(ctx: &InferContext, pending: &mut Vec<WindowFeature>) -> Result<()> {
    let batch = collate(pending);

    let predictions = {
        let _device_guard = ctx.device_mutex.lock();
        match ctx.engine.run_batch(&ctx.device, &batch) {
            Ok(predictions) => predictions,
            Err(InferenceError::OutOfMemory(msg)) => {
                warn!("Out of memory on {} ({msg}), clearing device cache and retrying", ctx.device);
                ctx.engine.clear_device_cache(&ctx.device);
                ctx.engine.run_batch(&ctx.device, &batch).map_err(|err| {
                    CorrectError::InferenceFailed { device: ctx.device.to_string(), message: err.to_string() }
                })?
            }
            Err(err) => {
                return Err(CorrectError::InferenceFailed {
                    device: ctx.device.to_string(),
                    message: err.to_string(),
                })
            }
        }
    };

    debug_assert_eq!(predictions.len(), pending.len());
    for (mut wf, prediction) in pending.drain(..).zip(predictions) {
        wf.inferred_bases = Some(prediction);
        if ctx.inferred_queue.push(wf).is_err() {
            debug!("Inferred queue terminated during flush on {}", ctx.device);
            return Ok(());
        }
    }
    Ok(())
}

// ============================================================================
// Aggregation/decode stage
// ============================================================================

fn decode_worker(
    inferred_queue: &AsyncQueue<WindowFeature>,
    registry: &ReadStateRegistry,
    sink: &Sender<SeqRecord>,
    progress: &ProgressTracker,
) -> Result<()> {
    loop {
        match inferred_queue.pop() {
            PopResult::Terminated => break,
            PopResult::Timeout => unreachable!("plain pop never times out"),
            PopResult::Item(wf) => {
                let segment = decode_window(&wf);
                // The lock inside the registry covers map mutation only;
                // decode happened above and emission happens below, both
                // outside it.
                match registry.complete_window(&wf.read_name, wf.window_idx, segment) {
                    Completion::Done(segments) => emit_read(sink, &wf.read_name, &segments, progress),
                    Completion::Pending => {}
                    Completion::Missing => {
                        error!("Read state not found for '{}', dropping window {}", wf.read_name, wf.window_idx);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MajorityVoteEngine;
    use crate::features::WindowPileupExtractor;
    use crate::read_store::InMemoryReadStore;
    use crossbeam_channel::unbounded;

    fn minimal_config() -> PipelineConfig {
        PipelineConfig {
            window_size: 8,
            ingest_threads: 1,
            infer_threads: 1,
            decode_threads: 1,
            batch_slots: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_batch_budget_is_fatal_at_startup() {
        let (_, input) = unbounded::<Message>();
        let (sink, _out) = unbounded();
        let result = CorrectionPipeline::spawn(
            PipelineConfig { batch_slots: 0, ..minimal_config() },
            Arc::new(InMemoryReadStore::new()),
            Arc::new(WindowPileupExtractor::default()),
            Arc::new(MajorityVoteEngine::with_batch_slots(0)),
            input,
            sink,
        );
        assert!(matches!(result, Err(CorrectError::InsufficientDeviceMemory { .. })));
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let (_, input) = unbounded::<Message>();
        let (sink, _out) = unbounded();
        let result = CorrectionPipeline::spawn(
            PipelineConfig { device: "tpu:0".to_string(), ..minimal_config() },
            Arc::new(InMemoryReadStore::new()),
            Arc::new(WindowPileupExtractor::default()),
            Arc::new(MajorityVoteEngine::new()),
            input,
            sink,
        );
        assert!(matches!(result, Err(CorrectError::UnsupportedDevice { .. })));
    }

    #[test]
    fn test_empty_input_shuts_down_cleanly() {
        let (input_tx, input) = unbounded::<Message>();
        let (sink, out) = unbounded();
        let pipeline = CorrectionPipeline::spawn(
            minimal_config(),
            Arc::new(InMemoryReadStore::new()),
            Arc::new(WindowPileupExtractor::default()),
            Arc::new(MajorityVoteEngine::new()),
            input,
            sink,
        )
        .unwrap();
        drop(input_tx);
        pipeline.wait().unwrap();
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn test_passthrough_messages_reach_sink() {
        let (input_tx, input) = unbounded();
        let (sink, out) = unbounded();
        let pipeline = CorrectionPipeline::spawn(
            minimal_config(),
            Arc::new(InMemoryReadStore::new()),
            Arc::new(WindowPileupExtractor::default()),
            Arc::new(MajorityVoteEngine::new()),
            input,
            sink,
        )
        .unwrap();

        let record = SeqRecord { name: "keep".to_string(), seq: "ACGT".to_string() };
        input_tx.send(Message::Record(record.clone())).unwrap();
        drop(input_tx);
        pipeline.wait().unwrap();
        assert_eq!(out.try_recv().unwrap(), record);
    }
}
