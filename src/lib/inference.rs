//! Device selection and batched model invocation plumbing.
//!
//! The correction model itself lives behind [`InferenceEngine`]; this module
//! owns everything around it: the closed set of device kinds, parsing of the
//! device selector string, padded batch collation, and the slot arithmetic
//! that keeps variable-length windows within a device's memory budget.

use std::fmt;

use ndarray::Array3;
use thiserror::Error;

use crate::errors::{CorrectError, Result};
use crate::features::{WindowFeature, EMPTY, TOP_K};

/// Windows longer than this many pileup columns consume extra batch slots.
pub const LONG_WINDOW_THRESHOLD: usize = 5120;

/// Number of batch slots a window of `n_columns` pileup columns consumes.
///
/// Every window costs at least one slot; long windows cost one slot per
/// started multiple of [`LONG_WINDOW_THRESHOLD`] columns.
#[must_use]
pub fn batch_slots_for(n_columns: usize) -> usize {
    n_columns.div_ceil(LONG_WINDOW_THRESHOLD).max(1)
}

/// A compute device the inference stage can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Parse a device selector string into one or more devices.
///
/// Accepted forms: `cpu`, `cuda` (device 0), `cuda:2`, `cuda:0,1,3`.
///
/// # Errors
///
/// [`CorrectError::UnsupportedDevice`] on anything else.
pub fn parse_device_string(selector: &str) -> Result<Vec<Device>> {
    if selector == "cpu" {
        return Ok(vec![Device::Cpu]);
    }
    if selector == "cuda" {
        return Ok(vec![Device::Cuda(0)]);
    }
    if let Some(list) = selector.strip_prefix("cuda:") {
        let mut devices = Vec::new();
        for part in list.split(',') {
            let idx = part
                .parse::<u32>()
                .map_err(|_| CorrectError::UnsupportedDevice { device: selector.to_string() })?;
            devices.push(Device::Cuda(idx));
        }
        if devices.is_empty() {
            return Err(CorrectError::UnsupportedDevice { device: selector.to_string() });
        }
        return Ok(devices);
    }
    Err(CorrectError::UnsupportedDevice { device: selector.to_string() })
}

/// A padded batch of window features, ready for one engine invocation.
#[derive(Debug)]
pub struct InferenceBatch {
    /// Base matrices stacked to `(items, max_columns, 1 + TOP_K)`,
    /// short items padded with the empty marker.
    pub bases: Array3<u8>,
    /// Quality matrices stacked the same way, padded with zeros.
    pub quals: Array3<f32>,
    /// True (unpadded) column count of each item.
    pub lengths: Vec<usize>,
    /// Supported-column indices of each item.
    pub supported: Vec<Vec<usize>>,
}

/// Pad a set of window features to a common width and stack them.
///
/// Item order is preserved: predictions come back in the same order the
/// features were accumulated.
#[must_use]
pub fn collate(features: &[WindowFeature]) -> InferenceBatch {
    // All features in a batch share one lane depth (target + top-K supports).
    let depth = features.first().map_or(1 + TOP_K, |f| f.bases.ncols());
    debug_assert!(features.iter().all(|f| f.bases.ncols() == depth));
    let max_columns = features.iter().map(|f| f.n_columns).max().unwrap_or(0);

    let mut bases = Array3::from_elem((features.len(), max_columns, depth), EMPTY);
    let mut quals = Array3::<f32>::zeros((features.len(), max_columns, depth));
    let mut lengths = Vec::with_capacity(features.len());
    let mut supported = Vec::with_capacity(features.len());

    for (i, wf) in features.iter().enumerate() {
        bases
            .index_axis_mut(ndarray::Axis(0), i)
            .slice_mut(ndarray::s![..wf.n_columns, ..])
            .assign(&wf.bases);
        quals
            .index_axis_mut(ndarray::Axis(0), i)
            .slice_mut(ndarray::s![..wf.n_columns, ..])
            .assign(&wf.quals);
        lengths.push(wf.n_columns);
        supported.push(wf.supported.clone());
    }

    InferenceBatch { bases, quals, lengths, supported }
}

/// Failure modes of one engine invocation.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The device ran out of memory during the forward pass. Recoverable
    /// once per batch via cache clear + retry.
    #[error("device out of memory: {0}")]
    OutOfMemory(String),
    /// Any other engine failure. Not recoverable.
    #[error("{0}")]
    Failed(String),
}

/// The correction model, behind a device-agnostic interface.
///
/// Implementations accept a padded batch and return, per item, one class
/// prediction (A=0, C=1, G=2, T=3, gap=4) for each of its `lengths[i]`
/// columns. Device selection is a configuration value; the same engine
/// instance serves every worker pool.
pub trait InferenceEngine: Send + Sync {
    /// Run one forward pass over a collated batch.
    ///
    /// # Errors
    ///
    /// [`InferenceError::OutOfMemory`] for transient device-memory
    /// exhaustion, [`InferenceError::Failed`] otherwise.
    fn run_batch(
        &self,
        device: &Device,
        batch: &InferenceBatch,
    ) -> std::result::Result<Vec<Vec<u8>>, InferenceError>;

    /// Release cached device memory after an out-of-memory failure.
    fn clear_device_cache(&self, _device: &Device) {}

    /// Probe the device and derive a batch-slot budget. Returning 0 means the
    /// device has insufficient memory to run at all.
    fn batch_slots_hint(&self, device: &Device) -> usize;
}
