//! gw-core: Core abstractions and configuration for guestwire
//!
//! This crate provides the error taxonomy, configuration structures, domain
//! types and collaborator traits shared by the communicator and the CLI.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{CommError, ErrorKind, TransportError};
pub use types::{CommandResult, ExecOptions, KeyType, KeyTypePreference, OutputEvent};
