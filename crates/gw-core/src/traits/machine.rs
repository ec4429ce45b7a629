//! Machine-side collaborators

use async_trait::async_trait;
use std::path::PathBuf;

use crate::config::SshInfo;
use crate::error::CapabilityError;

/// Capability installing a public key into the guest user's authorized keys
pub const INSERT_PUBLIC_KEY: &str = "insert_public_key";

/// Capability removing a public key from the guest user's authorized keys
pub const REMOVE_PUBLIC_KEY: &str = "remove_public_key";

/// The machine the communicator talks to
#[async_trait]
pub trait Machine: Send + Sync {
    /// Current SSH info, `None` until the guest is reachable
    async fn ssh_info(&self) -> Option<SshInfo>;

    /// Directory for per-machine state such as the generated private key
    fn data_dir(&self) -> PathBuf;
}

/// Guest operating system capabilities
#[async_trait]
pub trait GuestCapabilities: Send + Sync {
    /// Whether the guest implements `name`
    async fn has_capability(&self, name: &str) -> bool;

    /// Invoke a capability
    async fn capability(&self, name: &str, args: &[String]) -> Result<(), CapabilityError>;
}

/// User-facing progress output
pub trait ProgressSink: Send + Sync {
    fn info(&self, message: &str);
    fn detail(&self, message: &str);
    fn warn(&self, message: &str);
    fn success(&self, message: &str);
    fn error(&self, message: &str);
}

/// Sink that forwards progress lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn detail(&self, message: &str) {
        tracing::info!(detail = true, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn success(&self, message: &str) {
        tracing::info!(success = true, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }
}
