//! gw-cli: command-line interface for guestwire
//!
//! Provides the `guestwire` binary for running commands on, and copying
//! files to and from, a VM guest reachable over SSH.

pub mod commands;
pub mod machine;
pub mod output;
