//! Random-access storage of read sequences and qualities.
//!
//! Ingestion workers hydrate alignment sets by name, concurrently, so the
//! store must be cheap to share across threads. The in-memory implementation
//! loads an entire FASTA/FASTQ file up front; FASTA records get a uniform
//! default quality since the file carries none.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use ahash::AHashMap;
use seq_io::fasta::{self, Record as _};
use seq_io::fastq::{self, Record as _};

use crate::errors::{CorrectError, Result};

/// Phred+33 quality assigned to FASTA records (Q30).
pub const DEFAULT_FASTA_QUALITY: u8 = b'?';

/// Random access to read sequences and qualities by name.
///
/// Implementations must tolerate concurrent calls from multiple ingestion
/// workers.
pub trait ReadStore: Send + Sync {
    /// Fetch the forward-strand sequence of a read.
    ///
    /// # Errors
    ///
    /// [`CorrectError::ReadNotFound`] if the name is unknown.
    fn fetch_sequence(&self, name: &str) -> Result<Vec<u8>>;

    /// Fetch the phred+33 quality string of a read.
    ///
    /// # Errors
    ///
    /// [`CorrectError::ReadNotFound`] if the name is unknown.
    fn fetch_quality(&self, name: &str) -> Result<Vec<u8>>;

    /// Number of reads in the store.
    fn entry_count(&self) -> usize;
}

/// A read store backed by a hash map, loaded eagerly from FASTA/FASTQ.
#[derive(Debug, Default)]
pub struct InMemoryReadStore {
    entries: AHashMap<String, (Vec<u8>, Vec<u8>)>,
}

impl InMemoryReadStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: AHashMap::new() }
    }

    /// Insert a read. Sequence is normalized to uppercase.
    pub fn insert(&mut self, name: impl Into<String>, seq: Vec<u8>, qual: Vec<u8>) {
        let mut seq = seq;
        seq.make_ascii_uppercase();
        self.entries.insert(name.into(), (seq, qual));
    }

    /// Load every record of a FASTA or FASTQ file. The format is detected
    /// from the first byte (`>` vs `@`).
    ///
    /// # Errors
    ///
    /// Fails on unreadable or unparseable input.
    pub fn from_fastx(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut first = [0u8; 1];
        let n = file.read(&mut first)?;
        if n == 0 {
            return Err(CorrectError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("empty read file: {}", path.display()),
            )));
        }
        // Re-open from the start for the parser.
        let reader = BufReader::new(File::open(path)?);

        let mut store = Self::new();
        match first[0] {
            b'@' => {
                let mut parser = fastq::Reader::new(reader);
                while let Some(record) = parser.next() {
                    let record = record.map_err(io::Error::other)?;
                    let id = record.id().map_err(io::Error::other)?.to_string();
                    store.insert(id, record.seq().to_vec(), record.qual().to_vec());
                }
            }
            b'>' => {
                let mut parser = fasta::Reader::new(reader);
                while let Some(record) = parser.next() {
                    let record = record.map_err(io::Error::other)?;
                    let id = record.id().map_err(io::Error::other)?.to_string();
                    let seq = record.full_seq().into_owned();
                    let qual = vec![DEFAULT_FASTA_QUALITY; seq.len()];
                    store.insert(id, seq, qual);
                }
            }
            other => {
                return Err(CorrectError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unrecognized read file format (leading byte {:#04x}): {}", other, path.display()),
                )));
            }
        }
        Ok(store)
    }
}

impl ReadStore for InMemoryReadStore {
    fn fetch_sequence(&self, name: &str) -> Result<Vec<u8>> {
        self.entries
            .get(name)
            .map(|(seq, _)| seq.clone())
            .ok_or_else(|| CorrectError::ReadNotFound { name: name.to_string() })
    }

    fn fetch_quality(&self, name: &str) -> Result<Vec<u8>> {
        self.entries
            .get(name)
            .map(|(_, qual)| qual.clone())
            .ok_or_else(|| CorrectError::ReadNotFound { name: name.to_string() })
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_insert_and_fetch() {
        let mut store = InMemoryReadStore::new();
        store.insert("r1", b"acgt".to_vec(), b"IIII".to_vec());
        assert_eq!(store.fetch_sequence("r1").unwrap(), b"ACGT".to_vec());
        assert_eq!(store.fetch_quality("r1").unwrap(), b"IIII".to_vec());
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_missing_read_is_an_error() {
        let store = InMemoryReadStore::new();
        assert!(matches!(
            store.fetch_sequence("nope"),
            Err(CorrectError::ReadNotFound { .. })
        ));
    }

    #[test]
    fn test_load_fastq() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "@r1\nACGT\n+\nIIII\n@r2 extra comment\nGGCC\n+\n!!!!").unwrap();
        file.flush().unwrap();

        let store = InMemoryReadStore::from_fastx(file.path()).unwrap();
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.fetch_sequence("r1").unwrap(), b"ACGT".to_vec());
        assert_eq!(store.fetch_quality("r2").unwrap(), b"!!!!".to_vec());
    }

    #[test]
    fn test_load_fasta_gets_default_quality() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ">r1\nACGTACGT").unwrap();
        file.flush().unwrap();

        let store = InMemoryReadStore::from_fastx(file.path()).unwrap();
        assert_eq!(store.fetch_quality("r1").unwrap(), vec![DEFAULT_FASTA_QUALITY; 8]);
    }
}
