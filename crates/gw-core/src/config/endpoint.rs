//! Guest SSH information and the resolved endpoint descriptor

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::option_duration_secs;
use super::CommunicatorConfig;
use crate::types::{AuthMethod, KeyTypePreference};

/// Host key verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key; guests are recreated with fresh keys all the time
    #[default]
    Never,
    /// Accept and record unknown hosts, reject changed keys
    AcceptNew,
    /// Only accept hosts already present in known_hosts
    Always,
}

/// Connection information reported by the machine
///
/// `None` from the machine means the provider has not made the guest
/// reachable yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Overrides `username` when present
    pub remote_user: Option<String>,
    pub password: Option<String>,
    /// Private keys, tried in order
    pub private_key_path: Vec<PathBuf>,
    /// Command whose stdin/stdout carry the connection
    pub proxy_command: Option<String>,
    pub verify_host_key: HostKeyPolicy,
    pub known_hosts_path: Option<PathBuf>,
    pub forward_agent: bool,
    /// Local environment variables forwarded to every command
    pub forward_env: Vec<String>,
    pub keep_alive: Option<bool>,
    pub connect_retries: Option<u32>,
    #[serde(with = "option_duration_secs")]
    pub connect_retry_delay: Option<Duration>,
}

impl SshInfo {
    /// Minimal info for a host reachable with the given user
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Self::default()
        }
    }
}

/// Everything needed to open one session, resolved at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_paths: Vec<PathBuf>,
    pub proxy_command: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_path: Option<PathBuf>,
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub connect_timeout: Duration,
    pub forward_agent: bool,
    pub forward_env: Vec<String>,
    pub keep_alive: bool,
    pub shell: String,
    pub sudo_command: String,
    pub export_command_template: String,
    pub pty: bool,
    pub key_type: KeyTypePreference,
}

impl EndpointDescriptor {
    /// Merge guest-reported info with the communicator configuration
    pub fn resolve(info: &SshInfo, config: &CommunicatorConfig) -> Self {
        Self {
            host: info.host.clone(),
            port: info.port,
            username: info
                .remote_user
                .clone()
                .unwrap_or_else(|| info.username.clone()),
            password: info.password.clone(),
            private_key_paths: info.private_key_path.clone(),
            proxy_command: info.proxy_command.clone(),
            host_key_policy: info.verify_host_key,
            known_hosts_path: info.known_hosts_path.clone(),
            connect_retries: info.connect_retries.unwrap_or(config.connect_retries),
            connect_retry_delay: info
                .connect_retry_delay
                .unwrap_or(config.connect_retry_delay),
            connect_timeout: config.connect_timeout,
            forward_agent: info.forward_agent,
            forward_env: info.forward_env.clone(),
            keep_alive: info.keep_alive.unwrap_or(config.keep_alive),
            shell: config.shell.clone(),
            sudo_command: config.sudo_command.clone(),
            export_command_template: config.export_command_template.clone(),
            pty: config.pty,
            key_type: config.key_type,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authentication methods to offer, in order
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        let mut methods = vec![AuthMethod::None, AuthMethod::Hostbased];
        if !self.private_key_paths.is_empty() {
            methods.push(AuthMethod::PublicKey);
        }
        if self.password.is_some() {
            methods.push(AuthMethod::Password);
        }
        methods
    }

    /// Human-readable label for the credential in use
    pub fn auth_label(&self) -> &'static str {
        if self.private_key_paths.is_empty() && self.password.is_some() {
            "password"
        } else {
            "private key"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SshInfo {
        SshInfo::new("127.0.0.1", 2222, "vagrant")
    }

    #[test]
    fn test_remote_user_overrides_username() {
        let mut info = info();
        info.remote_user = Some("deploy".to_string());
        let endpoint = EndpointDescriptor::resolve(&info, &CommunicatorConfig::default());
        assert_eq!(endpoint.username, "deploy");
        assert_eq!(endpoint.address(), "127.0.0.1:2222");
    }

    #[test]
    fn test_info_overrides_config() {
        let mut info = info();
        info.connect_retries = Some(1);
        info.connect_retry_delay = Some(Duration::from_secs(9));
        info.keep_alive = Some(false);
        let endpoint = EndpointDescriptor::resolve(&info, &CommunicatorConfig::default());
        assert_eq!(endpoint.connect_retries, 1);
        assert_eq!(endpoint.connect_retry_delay, Duration::from_secs(9));
        assert!(!endpoint.keep_alive);

        let endpoint = EndpointDescriptor::resolve(&self::info(), &CommunicatorConfig::default());
        assert_eq!(endpoint.connect_retries, 5);
        assert!(endpoint.keep_alive);
    }

    #[test]
    fn test_auth_methods() {
        let endpoint = EndpointDescriptor::resolve(&info(), &CommunicatorConfig::default());
        assert_eq!(
            endpoint.auth_methods(),
            [AuthMethod::None, AuthMethod::Hostbased]
        );

        let mut with_key = info();
        with_key.private_key_path = vec![PathBuf::from("/keys/id")];
        let endpoint = EndpointDescriptor::resolve(&with_key, &CommunicatorConfig::default());
        assert_eq!(
            endpoint.auth_methods(),
            [AuthMethod::None, AuthMethod::Hostbased, AuthMethod::PublicKey]
        );
        assert_eq!(endpoint.auth_label(), "private key");

        let mut with_password = info();
        with_password.password = Some("vagrant".to_string());
        let endpoint = EndpointDescriptor::resolve(&with_password, &CommunicatorConfig::default());
        assert_eq!(
            endpoint.auth_methods(),
            [AuthMethod::None, AuthMethod::Hostbased, AuthMethod::Password]
        );
        assert_eq!(endpoint.auth_label(), "password");
    }

    #[test]
    fn test_ssh_info_from_toml() {
        let info: SshInfo = toml::from_str(
            r#"
            host = "10.0.0.5"
            port = 22
            username = "ubuntu"
            private_key_path = ["/home/me/.ssh/id_ed25519"]
            verify_host_key = "accept_new"
            connect_retry_delay = 3
            "#,
        )
        .unwrap();
        assert_eq!(info.verify_host_key, HostKeyPolicy::AcceptNew);
        assert_eq!(info.connect_retry_delay, Some(Duration::from_secs(3)));
        assert_eq!(info.private_key_path.len(), 1);
    }
}
