//! gw-protocol: Transcript framing for guestwire
//!
//! This crate holds the I/O-free parts of talking to a guest shell over an
//! SSH channel: the scripts written to the remote shell, the marker and
//! delimiter scanning that separates real command output from shell noise,
//! ANSI escape stripping, and the SCP control records used for file copy.

pub mod ansi;
pub mod error;
pub mod marker;
pub mod pty;
pub mod scp;
pub mod script;

pub use ansi::AnsiStripper;
pub use error::ProtocolError;
pub use marker::{MarkerScanner, RawTranscript, DEFAULT_BANNER_LIMIT};
pub use pty::{extract_delimited, PtyTranscript};
pub use scp::{ScpAck, ScpCodec, ScpMessage, ScpRecord};
pub use script::{Markers, ScriptBuilder};
