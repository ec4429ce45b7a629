//! Marker scanning for raw (non-pty) transcripts
//!
//! Before the real command runs, the remote script prints a unique marker on
//! both stdout and stderr. Everything up to and including the marker is login
//! banner noise and is thrown away; everything after it is command output and
//! is passed through byte for byte.
//!
//! The marker may arrive split across any number of channel reads, so the
//! scanner keeps the last `marker.len() - 1` bytes of unmatched output around
//! between chunks. Older unmatched bytes are discarded immediately, which
//! bounds memory use; once more than `limit` bytes have been discarded without
//! a match the scanner gives up with [`ProtocolError::BannerOverflow`].

use crate::ansi::AnsiStripper;
use crate::error::ProtocolError;

/// Default cap on pre-marker output (1 MiB)
pub const DEFAULT_BANNER_LIMIT: usize = 1024 * 1024;

/// Incremental matcher for a single output stream
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: Vec<u8>,
    /// Unmatched tail that could still be the start of the marker
    tail: Vec<u8>,
    /// Bytes of banner noise dropped so far
    discarded: usize,
    limit: usize,
    found: bool,
}

impl MarkerScanner {
    /// Create a scanner looking for `marker`
    pub fn new(marker: impl Into<Vec<u8>>, limit: usize) -> Self {
        let marker = marker.into();
        let found = marker.is_empty();
        Self {
            marker,
            tail: Vec::new(),
            discarded: 0,
            limit,
            found,
        }
    }

    /// Whether the marker has been seen
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Number of banner bytes discarded so far
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Feed a chunk of output
    ///
    /// Returns the bytes that follow the marker. The result is empty until the
    /// marker has been found.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.found {
            return Ok(chunk.to_vec());
        }

        self.tail.extend_from_slice(chunk);

        if let Some(pos) = find(&self.tail, &self.marker) {
            self.found = true;
            self.discarded += pos;
            let output = self.tail.split_off(pos + self.marker.len());
            self.tail = Vec::new();
            tracing::trace!(discarded = self.discarded, "Output marker found");
            return Ok(output);
        }

        let keep = self.marker.len() - 1;
        if self.tail.len() > keep {
            let drop = self.tail.len() - keep;
            self.tail.drain(..drop);
            self.discarded += drop;
        }

        if self.discarded > self.limit {
            return Err(ProtocolError::BannerOverflow { limit: self.limit });
        }

        Ok(Vec::new())
    }
}

/// Find the first occurrence of `needle` in `haystack`
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Demultiplexer for a raw transcript: one stripper and one scanner per stream
#[derive(Debug)]
pub struct RawTranscript {
    stdout: MarkerScanner,
    stderr: MarkerScanner,
    stdout_ansi: AnsiStripper,
    stderr_ansi: AnsiStripper,
}

impl RawTranscript {
    /// Create a demultiplexer for the given marker
    pub fn new(marker: &str, limit: usize) -> Self {
        Self {
            stdout: MarkerScanner::new(marker.as_bytes(), limit),
            stderr: MarkerScanner::new(marker.as_bytes(), limit),
            stdout_ansi: AnsiStripper::new(),
            stderr_ansi: AnsiStripper::new(),
        }
    }

    /// Feed stdout bytes, returning the command output they contain
    pub fn stdout(&mut self, chunk: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let clean = self.stdout_ansi.strip(chunk);
        self.stdout.push(&clean)
    }

    /// Feed stderr bytes, returning the command output they contain
    pub fn stderr(&mut self, chunk: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let clean = self.stderr_ansi.strip(chunk);
        self.stderr.push(&clean)
    }
}
