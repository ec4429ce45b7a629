//! A machine described entirely by command-line flags

use std::path::PathBuf;

use async_trait::async_trait;

use gw_communicator::generated_key_path;
use gw_core::config::SshInfo;
use gw_core::error::CapabilityError;
use gw_core::traits::{GuestCapabilities, Machine};

/// Guest reachable at a fixed address
///
/// Once a generated key exists in the data dir it is offered before the
/// keys given on the command line.
#[derive(Debug, Clone)]
pub struct StaticMachine {
    info: SshInfo,
    data_dir: PathBuf,
}

impl StaticMachine {
    pub fn new(info: SshInfo, data_dir: PathBuf) -> Self {
        Self { info, data_dir }
    }

    /// Per-host data dir under the user's local data directory
    pub fn default_data_dir(host: &str, port: u16) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("guestwire")
            .join("machines")
            .join(format!("{}-{}", host, port))
    }
}

#[async_trait]
impl Machine for StaticMachine {
    async fn ssh_info(&self) -> Option<SshInfo> {
        let mut info = self.info.clone();
        let generated = generated_key_path(&self.data_dir);
        if generated.exists() && !info.private_key_path.contains(&generated) {
            info.private_key_path.insert(0, generated);
        }
        Some(info)
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }
}

/// Guest without any capabilities
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapabilities;

#[async_trait]
impl GuestCapabilities for NoCapabilities {
    async fn has_capability(&self, _name: &str) -> bool {
        false
    }

    async fn capability(&self, name: &str, _args: &[String]) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unavailable(name.to_string()))
    }
}
