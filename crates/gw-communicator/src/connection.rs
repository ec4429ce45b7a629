//! Session establishment and reuse

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gw_core::config::EndpointDescriptor;
use gw_core::traits::TransportSession;
use gw_core::{CommError, ErrorKind, TransportError};

use crate::communicator::Communicator;
use crate::retry::RetryPolicy;

/// How long a reused session gets to answer the liveness probe
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single connect attempt, handshake and auth included
pub(crate) const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of the communicator's session
pub(crate) enum SessionSlot {
    Unopened,
    Open(OpenSession),
    Closed,
}

pub(crate) struct OpenSession {
    pub(crate) session: Arc<dyn TransportSession>,
    pub(crate) endpoint: Arc<EndpointDescriptor>,
    /// Key algorithms the server accepts, probed lazily
    pub(crate) supported_key_types: Option<Vec<String>>,
}

/// A usable session borrowed for one command or transfer
#[derive(Clone)]
pub(crate) struct Connected {
    pub(crate) session: Arc<dyn TransportSession>,
    pub(crate) endpoint: Arc<EndpointDescriptor>,
}

impl Communicator {
    /// Return a working session, reusing the current one when it passes the
    /// liveness probe and connecting otherwise
    pub(crate) async fn connect(
        &self,
        retries: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<Connected, CommError> {
        let mut slot = self.inner.slot.lock().await;

        if let SessionSlot::Open(open) = std::mem::replace(&mut *slot, SessionSlot::Closed) {
            if !open.session.is_closed() {
                match tokio::time::timeout(PROBE_TIMEOUT, open.session.probe()).await {
                    Ok(Ok(())) => {
                        tracing::trace!("Reusing SSH session");
                        let connected = Connected {
                            session: Arc::clone(&open.session),
                            endpoint: Arc::clone(&open.endpoint),
                        };
                        *slot = SessionSlot::Open(open);
                        return Ok(connected);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "SSH session failed liveness probe, reconnecting");
                    }
                    Err(_) => {
                        tracing::debug!("SSH session liveness probe timed out, reconnecting");
                    }
                }
            } else {
                tracing::debug!("SSH session closed by transport, reconnecting");
            }

            if let Ok(Err(e)) = tokio::time::timeout(PROBE_TIMEOUT, open.session.close()).await {
                tracing::debug!(error = %e, "Failed to close stale SSH session");
            }
        }

        let info = self
            .inner
            .machine
            .ssh_info()
            .await
            .ok_or(CommError::SshNotReady)?;
        let endpoint = Arc::new(EndpointDescriptor::resolve(&info, &self.inner.config));

        check_key_permissions(&endpoint.private_key_paths)?;

        let policy = RetryPolicy::new(
            retries.unwrap_or(endpoint.connect_retries),
            retry_delay.unwrap_or(endpoint.connect_retry_delay),
        );

        tracing::info!(
            address = %endpoint.address(),
            user = %endpoint.username,
            attempts = policy.attempts,
            "Connecting to guest over SSH"
        );

        let transport = Arc::clone(&self.inner.transport);
        let session = policy
            .run(|attempt| {
                let transport = Arc::clone(&transport);
                let endpoint = Arc::clone(&endpoint);
                async move {
                    tracing::debug!(attempt, "SSH connect attempt");
                    match tokio::time::timeout(ATTEMPT_TIMEOUT, transport.connect(&endpoint)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::new(
                            ErrorKind::ConnectionTimeout,
                            format!("no connection within {:?}", ATTEMPT_TIMEOUT),
                        )),
                    }
                }
            })
            .await?;

        tracing::info!(address = %endpoint.address(), "SSH session established");

        *slot = SessionSlot::Open(OpenSession {
            session: Arc::clone(&session),
            endpoint: Arc::clone(&endpoint),
            supported_key_types: None,
        });

        Ok(Connected { session, endpoint })
    }
}

/// Private keys must belong to the current user and be unreadable by others
#[cfg(unix)]
fn check_key_permissions(paths: &[PathBuf]) -> Result<(), CommError> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };

    for path in paths {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                // A missing key is reported by the transport when it loads it
                tracing::debug!(path = %path.display(), error = %e, "Cannot stat private key");
                continue;
            }
        };

        if metadata.uid() != euid {
            return Err(CommError::KeyBadOwner {
                path: path.to_path_buf(),
            });
        }

        if metadata.mode() & 0o077 != 0 {
            tracing::info!(path = %path.display(), "Tightening private key permissions to 0600");
            tighten(path).map_err(|source| CommError::KeyBadPermissions {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    fn tighten(path: &Path) -> std::io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    }

    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_paths: &[PathBuf]) -> Result<(), CommError> {
    Ok(())
}
