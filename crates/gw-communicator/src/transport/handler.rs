//! Client handler applying the host key policy

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;

use gw_core::config::{EndpointDescriptor, HostKeyPolicy};

/// SSH client handler for one connection
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    /// Name of the host key algorithm the server presented
    host_key_algorithm: Arc<OnceLock<String>>,
}

impl ClientHandler {
    pub(crate) fn new(endpoint: &EndpointDescriptor, host_key_algorithm: Arc<OnceLock<String>>) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            policy: endpoint.host_key_policy,
            known_hosts: endpoint.known_hosts_path.clone(),
            host_key_algorithm,
        }
    }

    fn check_known_hosts(&self, key: &PublicKey) -> Result<bool, russh_keys::Error> {
        match &self.known_hosts {
            Some(path) => russh_keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh_keys::check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn_known_host(&self, key: &PublicKey) -> Result<(), russh_keys::Error> {
        match &self.known_hosts {
            Some(path) => russh_keys::learn_known_hosts_path(&self.host, self.port, key, path),
            None => russh_keys::learn_known_hosts(&self.host, self.port, key),
        }
    }

    /// Whether the policy accepts this key
    pub(crate) fn verify(&self, key: &PublicKey) -> bool {
        if self.policy == HostKeyPolicy::Never {
            return true;
        }

        match self.check_known_hosts(key) {
            Ok(true) => {
                tracing::debug!("Host key matches known_hosts");
                true
            }
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                if let Err(e) = self.learn_known_host(key) {
                    tracing::warn!(error = %e, "Failed to record host key");
                }
                tracing::info!(host = %self.host, "Recorded new host key");
                true
            }
            Ok(false) => {
                tracing::warn!(host = %self.host, "Host key not present in known_hosts");
                false
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "Host key verification failed");
                false
            }
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let _ = self
            .host_key_algorithm
            .set(server_public_key.name().to_string());
        tracing::debug!(
            algorithm = server_public_key.name(),
            "Server host key: {}",
            server_public_key.fingerprint()
        );
        Ok(self.verify(server_public_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::config::{CommunicatorConfig, SshInfo, INSECURE_PUBLIC_KEY};
    use gw_core::KeyType;

    fn host_key() -> PublicKey {
        let body = INSECURE_PUBLIC_KEY.split_whitespace().nth(1).unwrap();
        russh_keys::parse_public_key_base64(body).unwrap()
    }

    fn handler(policy: HostKeyPolicy, known_hosts: PathBuf) -> ClientHandler {
        let mut info = SshInfo::new("127.0.0.1", 2222, "vagrant");
        info.verify_host_key = policy;
        info.known_hosts_path = Some(known_hosts);
        let endpoint = EndpointDescriptor::resolve(&info, &CommunicatorConfig::default());
        ClientHandler::new(&endpoint, Arc::new(OnceLock::new()))
    }

    #[test]
    fn test_never_accepts_anything() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(HostKeyPolicy::Never, dir.path().join("known_hosts"));
        assert!(handler.verify(&host_key()));
        assert!(!dir.path().join("known_hosts").exists());
    }

    #[test]
    fn test_always_rejects_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(HostKeyPolicy::Always, dir.path().join("known_hosts"));
        assert!(!handler.verify(&host_key()));
    }

    #[test]
    fn test_accept_new_records_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        assert!(handler(HostKeyPolicy::AcceptNew, path.clone()).verify(&host_key()));
        assert!(path.exists());
        assert!(handler(HostKeyPolicy::Always, path).verify(&host_key()));
    }

    #[tokio::test]
    async fn test_records_host_key_algorithm() {
        use russh::client::Handler;

        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(HostKeyPolicy::Never, dir.path().join("known_hosts"));
        let algorithm = Arc::clone(&handler.host_key_algorithm);

        assert!(handler.check_server_key(&host_key()).await.unwrap());
        let name = algorithm.get().unwrap();
        assert!(KeyType::Rsa.algorithm_names().any(|n| n == name));
    }
}
