//! Custom error types for lrcorrect operations.

use thiserror::Error;

/// Result type alias for lrcorrect operations
pub type Result<T> = std::result::Result<T, CorrectError>;

/// Error type for lrcorrect operations
#[derive(Error, Debug)]
pub enum CorrectError {
    /// An alignment set failed consistency validation and was rejected wholesale.
    #[error("Inconsistent alignments for read '{read}': {reason}")]
    InconsistentAlignments {
        /// The target read name
        read: String,
        /// Explanation of the inconsistency
        reason: String,
    },

    /// A CIGAR string contained an operation outside the match/insert/delete set.
    #[error("Unknown CIGAR operation '{op}'")]
    UnknownCigarOp {
        /// The unrecognized operation character
        op: char,
    },

    /// The device selector string could not be parsed.
    #[error("Unsupported device: {device}")]
    UnsupportedDevice {
        /// The device string as given on the command line
        device: String,
    },

    /// No usable batch-slot budget could be derived for a device at startup.
    #[error("Insufficient memory to run inference on {device}")]
    InsufficientDeviceMemory {
        /// The device that failed the memory probe
        device: String,
    },

    /// Inference failed on a device after the out-of-memory retry.
    #[error("Inference failed on {device}: {message}")]
    InferenceFailed {
        /// The device the batch was running on
        device: String,
        /// The engine's failure description
        message: String,
    },

    /// A read name was not present in the read store.
    #[error("Read '{name}' not found in read store")]
    ReadNotFound {
        /// The missing read name
        name: String,
    },

    /// A PAF line could not be parsed.
    #[error("Malformed PAF line {line}: {reason}")]
    MalformedPaf {
        /// 1-based line number in the input
        line: usize,
        /// Explanation of the parse failure
        reason: String,
    },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
