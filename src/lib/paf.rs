//! PAF alignment source.
//!
//! Reads minimap2-style PAF with `cg:Z:` CIGAR tags and yields one
//! [`AlignmentSet`] per target read, grouping consecutive lines that share a
//! target name (the layout minimap2 all-vs-all output has when queries are
//! mapped in file order). Sets come out un-hydrated; the pipeline fetches
//! sequences and validates.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use log::debug;

use crate::alignments::{parse_cigar, AlignmentSet, Overlap, Strand, Support};
use crate::errors::{CorrectError, Result};

/// Streaming reader of grouped PAF alignments.
pub struct PafAlignmentReader<R: BufRead> {
    lines: Lines<R>,
    line_no: usize,
    current: Option<AlignmentSet>,
}

impl PafAlignmentReader<BufReader<File>> {
    /// Open a PAF file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> PafAlignmentReader<R> {
    /// Wrap any buffered reader producing PAF lines.
    pub fn new(reader: R) -> Self {
        Self { lines: reader.lines(), line_no: 0, current: None }
    }

    fn malformed(&self, reason: impl Into<String>) -> CorrectError {
        CorrectError::MalformedPaf { line: self.line_no, reason: reason.into() }
    }

    fn parse_field<T: std::str::FromStr>(&self, field: Option<&str>, what: &str) -> Result<T> {
        field
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| self.malformed(format!("missing or invalid {what}")))
    }

    /// Parse one PAF line into `(target_name, support)`.
    fn parse_line(&self, line: &str) -> Result<(String, Support)> {
        let mut fields = line.split('\t');

        let qname = fields.next().ok_or_else(|| self.malformed("missing query name"))?.to_string();
        let qlen: usize = self.parse_field(fields.next(), "query length")?;
        let qstart: usize = self.parse_field(fields.next(), "query start")?;
        let qend: usize = self.parse_field(fields.next(), "query end")?;
        let strand = match fields.next() {
            Some("+") => Strand::Forward,
            Some("-") => Strand::Reverse,
            _ => return Err(self.malformed("missing or invalid strand")),
        };
        let tname = fields.next().ok_or_else(|| self.malformed("missing target name"))?.to_string();
        let tlen: usize = self.parse_field(fields.next(), "target length")?;
        let tstart: usize = self.parse_field(fields.next(), "target start")?;
        let tend: usize = self.parse_field(fields.next(), "target end")?;

        // Skip residue matches, block length, and mapping quality.
        let cigar_text = fields
            .find_map(|f| f.strip_prefix("cg:Z:"))
            .ok_or_else(|| self.malformed("missing cg:Z: tag"))?;
        let cigar = parse_cigar(cigar_text)?;

        let support = Support {
            name: qname,
            overlap: Overlap { qlen, qstart, qend, strand, tlen, tstart, tend },
            cigar,
            seq: Vec::new(),
            qual: Vec::new(),
        };
        Ok((tname, support))
    }
}

impl<R: BufRead> Iterator for PafAlignmentReader<R> {
    type Item = Result<AlignmentSet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(line) = self.lines.next() else {
                // End of input: flush the group being built, if any.
                return self.current.take().map(Ok);
            };
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if line.is_empty() {
                continue;
            }

            let (tname, support) = match self.parse_line(&line) {
                Ok(parsed) => parsed,
                Err(err) => return Some(Err(err)),
            };
            if support.name == tname {
                debug!("Skipping self-overlap for '{tname}'");
                continue;
            }

            let same_target = self.current.as_ref().is_some_and(|set| set.read_name == tname);
            if same_target {
                self.current.as_mut().expect("group exists").supports.push(support);
            } else {
                // New target: hand any finished group out and start over.
                let finished = self.current.take();
                let mut set = AlignmentSet::new(tname);
                set.supports.push(support);
                self.current = Some(set);
                if finished.is_some() {
                    return finished.map(Ok);
                }
            }
        }
    }
}
