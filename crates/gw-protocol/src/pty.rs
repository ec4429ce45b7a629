//! Delimiter extraction for pty transcripts
//!
//! With a pseudo-terminal the remote shell echoes input, prints prompts and
//! merges stderr into stdout. The script wraps the command output between a
//! start and an end delimiter; the whole transcript is collected and the
//! output is cut out once the channel has closed.

use crate::ansi::AnsiStripper;
use crate::error::ProtocolError;
use crate::marker::find;

/// Return the text between the last start delimiter that is followed by an
/// end delimiter, and the first end delimiter after it.
///
/// Echoed script lines contain both delimiters as `printf` arguments before
/// the real output, which is why the last usable start delimiter wins.
pub fn extract_delimited<'a>(transcript: &'a [u8], start: &[u8], end: &[u8]) -> Option<&'a [u8]> {
    if start.is_empty() || end.is_empty() || transcript.len() < start.len() {
        return None;
    }

    let starts: Vec<usize> = transcript
        .windows(start.len())
        .enumerate()
        .filter(|(_, window)| *window == start)
        .map(|(pos, _)| pos)
        .collect();

    starts.into_iter().rev().find_map(|pos| {
        let content_start = pos + start.len();
        let rest = &transcript[content_start..];
        find(rest, end).map(|len| &rest[..len])
    })
}

/// Accumulator for a pty transcript
#[derive(Debug, Default)]
pub struct PtyTranscript {
    buffer: Vec<u8>,
    ansi: AnsiStripper,
}

impl PtyTranscript {
    /// Create an empty transcript
    pub fn new() -> Self {
        Self::default()
    }

    /// Append terminal output
    pub fn push(&mut self, chunk: &[u8]) {
        let clean = self.ansi.strip(chunk);
        self.buffer.extend_from_slice(&clean);
    }

    /// Raw accumulated transcript
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Extract the command output between the delimiters
    pub fn finish(&self, start: &str, end: &str) -> Result<Vec<u8>, ProtocolError> {
        extract_delimited(&self.buffer, start.as_bytes(), end.as_bytes())
            .map(<[u8]>::to_vec)
            .ok_or(ProtocolError::MissingDelimiter)
    }
}
