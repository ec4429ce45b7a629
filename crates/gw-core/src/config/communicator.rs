//! Communicator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::KeyTypePreference;
use gw_protocol::DEFAULT_BANNER_LIMIT;

/// Public half of the well-known insecure keypair shipped with base boxes
pub const INSECURE_PUBLIC_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAABIwAAAQEA6NF8iallvQVp22WDkTkyrtvp9eWW6A8YVr+kz4TjGYe7gHzIw+niNltGEFHzD8+v1I2YJ6oXevct1YeS0o9HZyN1Q9qgCgzUFtdOKLv6IedplqoPkcmF0aYet2PkEDo3MlTBckFXPITAMzF8dJSIFo9D8HfdOV0IAdx4O7PtixWKn5y2hMNG0zQPyUecp4pzC6kivAIhyfHilFR61RGL+GPXQ2MWZWFYbAGjyiYJnAmCP3NOTd0jMZEnDkbUvxhMmBYSdETk1rRgm+R4LOzFUGaHqHDLKLX+FIPKcF96hrucXzcWyLbIbEgE98OHlnVYCzRdK8jlqm8tehUc9c9WhQ== vagrant insecure public key";

/// Settings shared by every connection the communicator makes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    /// Shell exec'd on each channel; the script is fed to its stdin
    pub shell: String,

    /// Sudo wrapper; `%c` is replaced with the shell
    pub sudo_command: String,

    /// Template for environment exports (`%ENV_KEY%`, `%ENV_VALUE%`)
    pub export_command_template: String,

    /// Run commands through a pseudo-terminal
    pub pty: bool,

    /// Replace insecure or password credentials with a generated keypair
    pub insert_key: bool,

    /// Key type for generated keypairs (`auto` or an explicit type)
    pub key_type: KeyTypePreference,

    /// Connect attempts before giving up
    pub connect_retries: u32,

    /// Pause between connect attempts
    #[serde(with = "duration_secs")]
    pub connect_retry_delay: Duration,

    /// Handshake timeout passed to the transport
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Send keep-alive requests on idle sessions
    pub keep_alive: bool,

    /// Maximum pre-marker output discarded before giving up
    pub banner_limit: usize,

    /// Public keys considered insecure; their presence triggers rotation
    pub insecure_public_keys: Vec<String>,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            shell: "bash -l".to_string(),
            sudo_command: "sudo -E -H %c".to_string(),
            export_command_template: "export %ENV_KEY%=\"%ENV_VALUE%\"".to_string(),
            pty: false,
            insert_key: true,
            key_type: KeyTypePreference::Auto,
            connect_retries: 5,
            connect_retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            keep_alive: true,
            banner_limit: DEFAULT_BANNER_LIMIT,
            insecure_public_keys: vec![INSECURE_PUBLIC_KEY.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyType;

    #[test]
    fn test_defaults() {
        let config = CommunicatorConfig::default();
        assert_eq!(config.shell, "bash -l");
        assert_eq!(config.sudo_command, "sudo -E -H %c");
        assert_eq!(config.export_command_template, "export %ENV_KEY%=\"%ENV_VALUE%\"");
        assert!(!config.pty);
        assert!(config.insert_key);
        assert_eq!(config.key_type, KeyTypePreference::Auto);
        assert_eq!(config.connect_retries, 5);
        assert_eq!(config.connect_retry_delay, Duration::from_secs(2));
        assert_eq!(config.banner_limit, 1024 * 1024);
        assert_eq!(config.insecure_public_keys.len(), 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CommunicatorConfig = toml::from_str(
            r#"
            pty = true
            key_type = "ed25519"
            connect_retry_delay = 7
            "#,
        )
        .unwrap();
        assert!(config.pty);
        assert_eq!(config.key_type, KeyTypePreference::Explicit(KeyType::Ed25519));
        assert_eq!(config.connect_retry_delay, Duration::from_secs(7));
        assert_eq!(config.shell, "bash -l");
        assert!(config.insert_key);
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let result: Result<CommunicatorConfig, _> = toml::from_str(r#"key_type = "dsa""#);
        assert!(result.is_err());
    }
}
