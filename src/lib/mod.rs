#![deny(unsafe_code)]
// Clippy lint configuration for CI
// These lints are allowed because:
// - cast_*: pileup/tensor code intentionally casts between numeric types
// - missing_*_doc: documentation improvements tracked separately
// - needless_pass_by_value: some APIs designed for ownership transfer
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions
)]

//! # lrcorrect - Long-Read Correction Library
//!
//! Reference-free correction of long noisy reads. Given a stream of targets
//! with their all-vs-all overlaps, the library builds per-window
//! multiple-alignment pileups, runs a correction model over batched pileups
//! on one or more compute devices, and reassembles corrected subsequences
//! into output records.
//!
//! ## Overview
//!
//! The heart of the library is [`pipeline::CorrectionPipeline`], a
//! three-stage concurrent pipeline connected by bounded queues:
//!
//! - **Ingestion** ([`pipeline`]) hydrates and validates [`alignments::AlignmentSet`]s,
//!   extracts window features, and decodes trivial windows in place.
//! - **Inference** ([`inference`], [`engine`]) packs variable-length windows
//!   into slot-budgeted batches and invokes the model behind
//!   [`inference::InferenceEngine`], per device.
//! - **Aggregation** ([`decode`], [`registry`]) reassembles windows in index
//!   order as they complete and emits corrected segment records.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use crossbeam_channel::unbounded;
//! use lrcorrect_lib::engine::MajorityVoteEngine;
//! use lrcorrect_lib::features::WindowPileupExtractor;
//! use lrcorrect_lib::pipeline::{CorrectionPipeline, Message, PipelineConfig};
//! use lrcorrect_lib::read_store::InMemoryReadStore;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = Arc::new(InMemoryReadStore::from_fastx("reads.fastq")?);
//! let (input_tx, input_rx) = unbounded::<Message>();
//! let (sink_tx, sink_rx) = unbounded();
//!
//! let pipeline = CorrectionPipeline::spawn(
//!     PipelineConfig::default(),
//!     store,
//!     Arc::new(WindowPileupExtractor::default()),
//!     Arc::new(MajorityVoteEngine::new()),
//!     input_rx,
//!     sink_tx,
//! )?;
//!
//! // Feed alignment sets, drop the sender, drain the sink...
//! drop(input_tx);
//! for record in sink_rx.iter() {
//!     println!(">{}\n{}", record.name, record.seq);
//! }
//! pipeline.wait()?;
//! # Ok(())
//! # }
//! ```

pub mod alignments;
pub mod decode;
pub mod engine;
pub mod errors;
pub mod features;
pub mod inference;
pub mod paf;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod read_store;
pub mod registry;
pub mod windows;
