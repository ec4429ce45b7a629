//! Credential rotation
//!
//! Guests booted from a base image usually trust a well-known insecure key
//! or a password. On the first successful readiness check the communicator
//! generates a fresh keypair, installs its public half in the guest, removes
//! the insecure key and reconnects. This happens at most once per
//! communicator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_keys::PublicKeyBase64;
use ssh_key::{Algorithm, EcdsaCurve, LineEnding, PrivateKey};

use gw_core::config::EndpointDescriptor;
use gw_core::traits::{INSERT_PUBLIC_KEY, REMOVE_PUBLIC_KEY};
use gw_core::{CommError, ExecOptions, KeyType, KeyTypePreference};
use gw_protocol::script::SSHD_KEY_QUERY;

use crate::communicator::Communicator;
use crate::connection::{Connected, SessionSlot};

/// File name of the generated private key inside the machine data dir
pub(crate) const PRIVATE_KEY_FILE: &str = "private_key";

/// sshd settings listing accepted key algorithms, most specific first
const SSHD_KEY_SETTINGS: [&str; 3] = [
    "pubkeyacceptedalgorithms",
    "pubkeyacceptedkeytypes",
    "hostkeyalgorithms",
];

/// Whether the one-time rotation has been claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyRotationState {
    Pending,
    Claimed,
}

/// A freshly generated keypair in OpenSSH encoding
pub(crate) struct GeneratedKey {
    pub(crate) private_openssh: String,
    pub(crate) public_openssh: String,
}

impl Communicator {
    /// Rotate insecure credentials if needed
    ///
    /// Returns `true` when a new key was installed and the caller must
    /// reconnect.
    pub(crate) async fn maybe_rotate_key(&self, connected: &Connected) -> Result<bool, CommError> {
        if !self.needs_rotation(&connected.endpoint).await {
            return Ok(false);
        }

        {
            let mut state = self.inner.rotation.lock().await;
            if *state == KeyRotationState::Claimed || !self.inner.config.insert_key {
                return Ok(false);
            }
            *state = KeyRotationState::Claimed;
        }

        tracing::info!("Replacing insecure SSH credentials with a generated key");

        let guest = &self.inner.guest;
        if !guest.has_capability(INSERT_PUBLIC_KEY).await
            || !guest.has_capability(REMOVE_PUBLIC_KEY).await
        {
            return Err(CommError::InsertKeyUnsupported);
        }

        let key_type = self.resolve_key_type(connected).await?;
        tracing::debug!(%key_type, "Generating keypair");

        let sink = &self.inner.sink;
        sink.detail("Inserting generated public key within guest...");

        let key = generate_keypair(key_type)?;
        let key_path = self.inner.machine.data_dir().join(PRIVATE_KEY_FILE);
        write_private_key(&key_path, &key.private_openssh)?;

        guest
            .capability(INSERT_PUBLIC_KEY, &[key.public_openssh.clone()])
            .await?;

        sink.detail("Removing insecure key from the guest if it's present...");
        for insecure in &self.inner.config.insecure_public_keys {
            guest
                .capability(REMOVE_PUBLIC_KEY, &[insecure.clone()])
                .await?;
        }

        sink.detail("Key inserted! Disconnecting and reconnecting using new SSH key...");
        tracing::info!(path = %key_path.display(), "Generated key installed");

        Ok(true)
    }

    /// Rotation applies to password-only logins and insecure private keys
    async fn needs_rotation(&self, endpoint: &EndpointDescriptor) -> bool {
        if endpoint.private_key_paths.is_empty() {
            return endpoint.password.is_some();
        }

        let insecure: Vec<&str> = self
            .inner
            .config
            .insecure_public_keys
            .iter()
            .filter_map(|line| key_body(line))
            .collect();

        for path in &endpoint.private_key_paths {
            if let Some(body) = public_key_body(path).await {
                if insecure.contains(&body.as_str()) {
                    return true;
                }
            }
        }
        false
    }

    async fn resolve_key_type(&self, connected: &Connected) -> Result<KeyType, CommError> {
        match connected.endpoint.key_type {
            KeyTypePreference::Auto => match self.supported_key_types(connected).await {
                Ok(supported) => KeyType::PREFERENCE
                    .iter()
                    .find(|(name, _)| supported.iter().any(|s| s == name))
                    .map(|(_, kind)| *kind)
                    .ok_or(CommError::KeyTypeNotSupportedByServer {
                        requested: "auto".to_string(),
                        supported,
                    }),
                Err(CommError::ServerDataUnavailable) => {
                    tracing::debug!(fallback = %KeyType::FALLBACK, "No server key data, using fallback key type");
                    Ok(KeyType::FALLBACK)
                }
                Err(e) => Err(e),
            },
            KeyTypePreference::Explicit(kind) => {
                let supported = self.supported_key_types(connected).await?;
                if kind.supported_by(&supported) {
                    Ok(kind)
                } else {
                    Err(CommError::KeyTypeNotSupportedByServer {
                        requested: kind.to_string(),
                        supported,
                    })
                }
            }
        }
    }

    /// Key algorithms the server accepts, cached per session
    pub(crate) async fn supported_key_types(
        &self,
        connected: &Connected,
    ) -> Result<Vec<String>, CommError> {
        if let Some(cached) = self.cached_key_types(connected).await {
            return Ok(cached);
        }

        let query = format!("sudo {}", SSHD_KEY_QUERY);
        let result = self.execute(&query, ExecOptions::unchecked()).await?;

        let supported = if result.exit_status == 0 {
            parse_sshd_key_settings(&result.stdout_lossy())
        } else {
            tracing::debug!(
                exit_status = result.exit_status,
                "sshd query failed, using negotiated host key algorithms"
            );
            Some(connected.session.host_key_algorithms()).filter(|algs| !algs.is_empty())
        };

        let supported = supported.ok_or(CommError::ServerDataUnavailable)?;
        tracing::debug!(?supported, "Server key algorithms");

        let mut slot = self.inner.slot.lock().await;
        if let SessionSlot::Open(open) = &mut *slot {
            if Arc::ptr_eq(&open.session, &connected.session) {
                open.supported_key_types = Some(supported.clone());
            }
        }

        Ok(supported)
    }

    async fn cached_key_types(&self, connected: &Connected) -> Option<Vec<String>> {
        let slot = self.inner.slot.lock().await;
        match &*slot {
            SessionSlot::Open(open) if Arc::ptr_eq(&open.session, &connected.session) => {
                open.supported_key_types.clone()
            }
            _ => None,
        }
    }
}

/// Pick the accepted algorithm list out of `sshd -T` output
pub(crate) fn parse_sshd_key_settings(output: &str) -> Option<Vec<String>> {
    let settings: Vec<(String, &str)> = output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(char::is_whitespace)?;
            Some((key.to_ascii_lowercase(), value.trim()))
        })
        .collect();

    SSHD_KEY_SETTINGS.iter().find_map(|wanted| {
        settings
            .iter()
            .find(|(key, _)| key == wanted)
            .map(|(_, value)| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
    })
}

/// Base64 body of an OpenSSH public key line
fn key_body(line: &str) -> Option<&str> {
    line.split_whitespace().nth(1)
}

/// Base64 public key derived from a private key file
async fn public_key_body(path: &Path) -> Option<String> {
    let secret = match tokio::fs::read_to_string(path).await {
        Ok(secret) => secret,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot read private key");
            return None;
        }
    };
    let key = match russh_keys::decode_secret_key(&secret, None) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot read private key");
            return None;
        }
    };
    key.clone_public_key()
        .ok()
        .map(|public| public.public_key_base64())
}

pub(crate) fn generate_keypair(kind: KeyType) -> Result<GeneratedKey, CommError> {
    let algorithm = match kind {
        KeyType::Ed25519 => Algorithm::Ed25519,
        KeyType::EcdsaP256 => Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
        KeyType::EcdsaP384 => Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        },
        KeyType::EcdsaP521 => Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP521,
        },
        KeyType::Rsa => Algorithm::Rsa { hash: None },
    };

    let private = PrivateKey::random(&mut rand::rngs::OsRng, algorithm)
        .map_err(|e| CommError::KeyGeneration(e.to_string()))?;
    let private_openssh = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| CommError::KeyGeneration(e.to_string()))?
        .to_string();
    let public_openssh = private
        .public_key()
        .to_openssh()
        .map_err(|e| CommError::KeyGeneration(e.to_string()))?;

    Ok(GeneratedKey {
        private_openssh,
        public_openssh,
    })
}

fn write_private_key(path: &Path, contents: &str) -> Result<(), CommError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, contents)?;

    Ok(())
}

/// Path of the generated key for a machine data dir
pub fn generated_key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PRIVATE_KEY_FILE)
}
