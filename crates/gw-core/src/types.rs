//! Core domain types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Default error key attached to `BadExitStatus`
pub const DEFAULT_ERROR_KEY: &str = "ssh_bad_exit_status";

/// Algorithm for a generated keypair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ed25519,
    EcdsaP256,
    EcdsaP384,
    EcdsaP521,
    Rsa,
}

impl KeyType {
    /// Server algorithm names in order of preference, with the key type each maps to
    pub const PREFERENCE: &'static [(&'static str, KeyType)] = &[
        ("ssh-ed25519", KeyType::Ed25519),
        ("ecdsa-sha2-nistp256", KeyType::EcdsaP256),
        ("ecdsa-sha2-nistp384", KeyType::EcdsaP384),
        ("ecdsa-sha2-nistp521", KeyType::EcdsaP521),
        ("rsa-sha2-512", KeyType::Rsa),
        ("rsa-sha2-256", KeyType::Rsa),
        ("ssh-rsa", KeyType::Rsa),
    ];

    /// Used by `auto` when the server reports nothing usable
    pub const FALLBACK: KeyType = KeyType::Rsa;

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::EcdsaP256 => "ecdsa256",
            KeyType::EcdsaP384 => "ecdsa384",
            KeyType::EcdsaP521 => "ecdsa521",
            KeyType::Rsa => "rsa",
        }
    }

    /// Server algorithm names that accept this key type
    pub fn algorithm_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        Self::PREFERENCE
            .iter()
            .filter(move |(_, kind)| kind == self)
            .map(|(name, _)| *name)
    }

    /// Whether any of the server's advertised algorithms accepts this key type
    pub fn supported_by(&self, server: &[String]) -> bool {
        self.algorithm_names()
            .any(|name| server.iter().any(|s| s == name))
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" | "ssh-ed25519" => Ok(KeyType::Ed25519),
            "ecdsa256" | "ecdsa-sha2-nistp256" => Ok(KeyType::EcdsaP256),
            "ecdsa384" | "ecdsa-sha2-nistp384" => Ok(KeyType::EcdsaP384),
            "ecdsa521" | "ecdsa-sha2-nistp521" => Ok(KeyType::EcdsaP521),
            "rsa" | "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => Ok(KeyType::Rsa),
            other => Err(ConfigError::Invalid(format!("unknown key type: {}", other))),
        }
    }
}

/// Configured key type for credential rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyTypePreference {
    /// Pick the best type the server supports
    #[default]
    Auto,
    /// Use this type, failing if the server does not support it
    Explicit(KeyType),
}

impl FromStr for KeyTypePreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(KeyTypePreference::Auto)
        } else {
            s.parse().map(KeyTypePreference::Explicit)
        }
    }
}

impl TryFrom<String> for KeyTypePreference {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyTypePreference> for String {
    fn from(value: KeyTypePreference) -> Self {
        value.to_string()
    }
}

impl fmt::Display for KeyTypePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyTypePreference::Auto => f.write_str("auto"),
            KeyTypePreference::Explicit(kind) => write!(f, "{}", kind),
        }
    }
}

/// Authentication methods offered to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Hostbased,
    PublicKey,
    Password,
}

/// Per-command options
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Shell to exec instead of the configured one
    pub shell: Option<String>,
    /// Wrap the shell in the sudo template
    pub sudo: bool,
    /// Never use the pty transcript, even when pty is configured
    pub force_raw: bool,
    /// Fail with `BadExitStatus` when the exit status is not in `good_exit`
    pub error_check: bool,
    /// Accepted exit statuses
    pub good_exit: Vec<u32>,
    /// Key attached to `BadExitStatus`
    pub error_key: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            shell: None,
            sudo: false,
            force_raw: false,
            error_check: true,
            good_exit: vec![0],
            error_key: DEFAULT_ERROR_KEY.to_string(),
        }
    }
}

impl ExecOptions {
    /// Options with exit status checking disabled
    pub fn unchecked() -> Self {
        Self {
            error_check: false,
            ..Self::default()
        }
    }

    /// Run under sudo
    pub fn with_sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Force the raw transcript
    pub fn raw(mut self) -> Self {
        self.force_raw = true;
        self
    }

    /// Whether `status` is accepted
    pub fn accepts(&self, status: u32) -> bool {
        self.good_exit.contains(&status)
    }
}

/// Result of one command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Whether the pty transcript produced this result
    pub pty: bool,
}

impl CommandResult {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Stdout as lossy UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as lossy UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Output delivered to streaming callers, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_order() {
        let names: Vec<&str> = KeyType::PREFERENCE.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            [
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "rsa-sha2-512",
                "rsa-sha2-256",
                "ssh-rsa"
            ]
        );
    }

    #[test]
    fn test_rsa_algorithm_names() {
        let names: Vec<&str> = KeyType::Rsa.algorithm_names().collect();
        assert_eq!(names, ["rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"]);

        let server = vec!["rsa-sha2-256".to_string()];
        assert!(KeyType::Rsa.supported_by(&server));
        assert!(!KeyType::Ed25519.supported_by(&server));
    }

    #[test]
    fn test_key_type_preference_parse() {
        assert_eq!("auto".parse::<KeyTypePreference>().unwrap(), KeyTypePreference::Auto);
        assert_eq!(
            "ed25519".parse::<KeyTypePreference>().unwrap(),
            KeyTypePreference::Explicit(KeyType::Ed25519)
        );
        assert_eq!(
            "ecdsa384".parse::<KeyTypePreference>().unwrap(),
            KeyTypePreference::Explicit(KeyType::EcdsaP384)
        );
        assert!("dsa".parse::<KeyTypePreference>().is_err());
    }

    #[test]
    fn test_key_type_preference_serde() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Wrapper {
            key_type: KeyTypePreference,
        }

        let parsed: Wrapper = serde_json::from_str(r#"{"key_type":"rsa"}"#).unwrap();
        assert_eq!(parsed.key_type, KeyTypePreference::Explicit(KeyType::Rsa));

        let json = serde_json::to_string(&Wrapper {
            key_type: KeyTypePreference::Auto,
        })
        .unwrap();
        assert_eq!(json, r#"{"key_type":"auto"}"#);
    }

    #[test]
    fn test_exec_options_defaults() {
        let opts = ExecOptions::default();
        assert!(opts.error_check);
        assert!(!opts.sudo);
        assert!(opts.accepts(0));
        assert!(!opts.accepts(1));
        assert_eq!(opts.error_key, "ssh_bad_exit_status");

        let unchecked = ExecOptions::unchecked().raw();
        assert!(!unchecked.error_check);
        assert!(unchecked.force_raw);
    }
}
