//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or parsing a transcript
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The output marker never showed up in the shell's startup noise
    #[error("Output marker not found within the first {limit} bytes of output")]
    BannerOverflow { limit: usize },

    /// The pty transcript did not contain both output delimiters
    #[error("Pty transcript is missing its output delimiters")]
    MissingDelimiter,

    /// An SCP control line could not be parsed
    #[error("Malformed scp record: {0}")]
    MalformedRecord(String),

    /// An SCP control line exceeded the maximum length
    #[error("Scp control line too long: {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLong { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
