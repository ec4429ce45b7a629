//! ANSI escape sequence stripping
//!
//! Guest shells happily emit clear-screen and colour sequences from their
//! login scripts. Those bytes must never reach a caller or the marker search,
//! and a sequence may be split across two channel reads, so the stripper
//! keeps its parser state between chunks.

use std::fmt;

use vte::{Parser, Perform};

/// Collects printable characters and C0 controls; every escape, CSI, OSC
/// and DCS/APC/PM/SOS string is dropped by the parser before it gets here.
#[derive(Default)]
struct Collector {
    out: Vec<u8>,
}

impl Perform for Collector {
    fn print(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        self.out.push(byte);
    }
}

/// Stateful ANSI escape stripper for one output stream
#[derive(Default)]
pub struct AnsiStripper {
    parser: Parser,
}

impl fmt::Debug for AnsiStripper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnsiStripper").finish_non_exhaustive()
    }
}

impl AnsiStripper {
    /// Create a new stripper in the ground state
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip escape sequences from a chunk, returning the remaining bytes
    pub fn strip(&mut self, input: &[u8]) -> Vec<u8> {
        let mut collector = Collector {
            out: Vec::with_capacity(input.len()),
        };
        self.parser.advance(&mut collector, input);
        collector.out
    }
}

/// Strip escape sequences from a complete buffer
pub fn strip_ansi(input: &[u8]) -> Vec<u8> {
    AnsiStripper::new().strip(input)
}
