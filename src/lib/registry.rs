//! Per-read completion bookkeeping.
//!
//! The registry is the only fine-grained shared mutable structure in the
//! pipeline. One lock guards a map from read name to that read's segment
//! slots and its outstanding-window count. Critical sections are map
//! mutation only; decoding and emission always happen outside the lock.

use ahash::AHashMap;
use parking_lot::Mutex;

/// Outcome of recording one completed window.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// This was the read's last outstanding window; the caller now owns the
    /// ordered segment list and is responsible for emission.
    Done(Vec<String>),
    /// Other windows are still outstanding.
    Pending,
    /// No state entry exists for the read. Upstream invariant violation.
    Missing,
}

struct ReadState {
    /// One slot per window of the read, pre-filled with trivially-decoded
    /// segments; inference results land at their window index.
    segments: Vec<String>,
    /// Windows still out for inference.
    remaining: usize,
}

/// Shared map of in-flight reads, guarded by a single lock.
#[derive(Default)]
pub struct ReadStateRegistry {
    inner: Mutex<AHashMap<String, ReadState>>,
}

impl ReadStateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read before any of its windows enter the inference queue.
    ///
    /// `segments` must have one slot per window, with trivial windows already
    /// decoded in place; `remaining` is the number of windows headed for
    /// inference. Returns `false` (and registers nothing) if the read is
    /// already registered; the caller must drop the read and log.
    pub fn register(&self, name: &str, segments: Vec<String>, remaining: usize) -> bool {
        debug_assert!(remaining > 0, "reads without inference windows bypass the registry");
        debug_assert!(remaining <= segments.len());
        let mut inner = self.inner.lock();
        if inner.contains_key(name) {
            return false;
        }
        inner.insert(name.to_string(), ReadState { segments, remaining });
        true
    }

    /// Record one decoded window. When the read's last window lands, the
    /// entry is removed and the completed segment list handed to the caller.
    pub fn complete_window(&self, name: &str, window_idx: usize, segment: String) -> Completion {
        let mut inner = self.inner.lock();
        let Some(state) = inner.get_mut(name) else {
            return Completion::Missing;
        };
        state.segments[window_idx] = segment;
        state.remaining -= 1;
        if state.remaining == 0 {
            let state = inner.remove(name).expect("entry exists");
            Completion::Done(state.segments)
        } else {
            Completion::Pending
        }
    }

    /// Number of reads currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether any reads are in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
