//! Terminal output helpers
//!
//! Coloured status lines for the CLI and a [`ProgressSink`] that prints the
//! communicator's progress messages with them.

use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};

use gw_core::traits::ProgressSink;

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Goes to stderr.
pub fn print_error(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an indented, dimmed detail line
pub fn print_detail(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetAttribute(Attribute::Dim),
        Print("    "),
        Print(msg),
        SetAttribute(Attribute::Reset),
        Print("\n")
    );
}

/// Progress sink printing to the terminal
///
/// Quiet sinks only print errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSink {
    quiet: bool,
}

impl TerminalSink {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl ProgressSink for TerminalSink {
    fn info(&self, message: &str) {
        if !self.quiet {
            print_info(message);
        }
    }

    fn detail(&self, message: &str) {
        if !self.quiet {
            print_detail(message);
        }
    }

    fn warn(&self, message: &str) {
        if !self.quiet {
            print_warning(message);
        }
    }

    fn success(&self, message: &str) {
        if !self.quiet {
            print_success(message);
        }
    }

    fn error(&self, message: &str) {
        print_error(message);
    }
}
