//! Read correction command.
//!
//! Streams grouped PAF alignments through the correction pipeline and
//! writes corrected reads as FASTA. The read store is loaded up front so
//! ingestion workers can fetch sequences concurrently.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::info;

use lrcorrect_lib::decode::SeqRecord;
use lrcorrect_lib::engine::MajorityVoteEngine;
use lrcorrect_lib::features::WindowPileupExtractor;
use lrcorrect_lib::paf::PafAlignmentReader;
use lrcorrect_lib::pipeline::{CorrectionPipeline, Message, PipelineConfig};
use lrcorrect_lib::read_store::{InMemoryReadStore, ReadStore};

use crate::commands::command::Command;

/// Capacity of the channel feeding alignment sets into the pipeline.
const INPUT_CHANNEL_CAPACITY: usize = 1000;

/// Capacity of the channel carrying corrected records to the writer.
const OUTPUT_CHANNEL_CAPACITY: usize = 512;

/// Correct long noisy reads from their all-vs-all overlaps.
///
/// Consumes a PAF file of overlaps (with `cg:Z:` CIGAR tags, grouped by
/// target read) plus the reads themselves, runs windowed pileup correction,
/// and writes corrected reads as FASTA. Reads whose coverage breaks down
/// mid-sequence are split into multiple records, named `<read>`, `<read>:1`
/// and so on.
#[derive(Parser, Debug, Clone)]
#[command(name = "correct", about = "Correct long reads from all-vs-all overlaps")]
pub struct Correct {
    /// Input PAF file with cg:Z: tags, grouped by target read
    #[arg(short = 'a', long = "alignments")]
    pub alignments: PathBuf,

    /// Input reads as FASTA or FASTQ
    #[arg(short = 'r', long = "reads")]
    pub reads: PathBuf,

    /// Output FASTA file ('-' for stdout)
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Compute device: cpu, cuda, cuda:1 or cuda:0,1
    #[arg(short = 'd', long, default_value = "cpu")]
    pub device: String,

    /// Window size in bases (the model's expected input width)
    #[arg(short = 'w', long = "window-size", default_value = "4096")]
    pub window_size: usize,

    /// Number of ingestion threads
    #[arg(short = 't', long, default_value = "4")]
    pub threads: usize,

    /// Inference workers per device (ignored on cpu)
    #[arg(long = "infer-threads", default_value = "2")]
    pub infer_threads: usize,

    /// Number of decode threads
    #[arg(long = "decode-threads", default_value = "4")]
    pub decode_threads: usize,

    /// Batch-slot budget per inference worker (0 probes device memory)
    #[arg(short = 'b', long = "batch-slots", default_value = "0")]
    pub batch_slots: usize,
}

impl Command for Correct {
    fn execute(&self) -> Result<()> {
        self.validate()?;
        let started = Instant::now();

        let store = Arc::new(
            InMemoryReadStore::from_fastx(&self.reads)
                .with_context(|| format!("Failed to load reads from {}", self.reads.display()))?,
        );
        info!("Loaded {} reads from {}", store.entry_count(), self.reads.display());

        let config = PipelineConfig {
            window_size: self.window_size,
            device: self.device.clone(),
            infer_threads: self.infer_threads,
            ingest_threads: self.threads,
            decode_threads: self.decode_threads,
            batch_slots: self.batch_slots,
            ..Default::default()
        };

        let (input_tx, input_rx) = bounded::<Message>(INPUT_CHANNEL_CAPACITY);
        let (sink_tx, sink_rx) = bounded::<SeqRecord>(OUTPUT_CHANNEL_CAPACITY);

        let pipeline = CorrectionPipeline::spawn(
            config,
            store,
            Arc::new(WindowPileupExtractor::default()),
            Arc::new(MajorityVoteEngine::new()),
            input_rx,
            sink_tx,
        )?;

        let output = self.output.clone();
        let writer_handle =
            thread::spawn(move || -> Result<u64> { write_records(&output, &sink_rx) });

        let mut sets = 0u64;
        for set in PafAlignmentReader::from_path(&self.alignments)? {
            let set = set.with_context(|| {
                format!("Failed to parse alignments from {}", self.alignments.display())
            })?;
            sets += 1;
            if input_tx.send(Message::Alignments(set)).is_err() {
                break;
            }
        }
        drop(input_tx);

        pipeline.wait()?;
        let written = writer_handle
            .join()
            .map_err(|_| anyhow::anyhow!("output writer thread panicked"))??;

        info!(
            "Corrected {sets} reads into {written} records in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

impl Correct {
    fn validate(&self) -> Result<()> {
        for (path, what) in [(&self.alignments, "Alignments PAF"), (&self.reads, "Reads file")] {
            if !path.exists() {
                bail!("{what} not found: {}", path.display());
            }
        }
        if self.window_size == 0 {
            bail!("Window size must be greater than zero");
        }
        Ok(())
    }
}

fn write_records(output: &Path, records: &crossbeam_channel::Receiver<SeqRecord>) -> Result<u64> {
    let mut writer: Box<dyn Write> = if output == Path::new("-") {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        Box::new(BufWriter::new(File::create(output)?))
    };

    let mut written = 0u64;
    for record in records.iter() {
        writeln!(writer, ">{}", record.name)?;
        writeln!(writer, "{}", record.seq)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
