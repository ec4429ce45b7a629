//! Readiness detection
//!
//! `ready` answers whether the guest can run commands right now.
//! `wait_for_ready` keeps asking until it can or the deadline passes, telling
//! the user why it is still waiting.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use gw_core::config::{EndpointDescriptor, SshInfo};
use gw_core::{CommError, ExecOptions};

use crate::communicator::Communicator;

/// Pause between address polls and between failed attempts
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum time before the same warning is shown again
const WARNING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    WaitingForAddress,
    Connecting,
    ShellCheck,
    KeyRotation,
    Ready,
    TimedOut,
}

/// Suppresses repeats of the same message within an interval
#[derive(Debug)]
pub struct MessageThrottle {
    interval: Duration,
    shown: HashMap<String, Instant>,
}

impl MessageThrottle {
    /// Create a throttle with the given repeat interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shown: HashMap::new(),
        }
    }

    /// Whether `message` should be shown now; records it if so
    pub fn should_show(&mut self, message: &str) -> bool {
        let now = Instant::now();
        match self.shown.get(message) {
            Some(last) if now.duration_since(*last) <= self.interval => false,
            _ => {
                self.shown.insert(message.to_string(), now);
                true
            }
        }
    }
}

impl Communicator {
    /// Whether the guest is reachable, runs a sane shell and has
    /// non-insecure credentials
    ///
    /// Connection failures of any kind yield `Ok(false)`.
    pub async fn ready(&self) -> Result<bool, CommError> {
        loop {
            tracing::debug!("Checking whether SSH is ready");

            let connected = match self.connect(None, None).await {
                Ok(connected) => connected,
                Err(e) => {
                    tracing::info!(error = %e, "SSH not up");
                    return Ok(false);
                }
            };

            tracing::debug!(stage = ?Stage::ShellCheck, "Verifying remote shell");
            let check = self.execute("", ExecOptions::unchecked().raw()).await?;
            if check.exit_status != 0 {
                tracing::warn!(exit_status = check.exit_status, "Remote shell check failed");
                return Err(CommError::InvalidShell);
            }

            tracing::debug!(stage = ?Stage::KeyRotation, "Checking credentials");
            if self.maybe_rotate_key(&connected).await? {
                // Reconnect with the new key; the rotation is claimed so the
                // second pass goes straight through
                self.reset().await;
                continue;
            }

            tracing::info!(stage = ?Stage::Ready, "SSH is ready");
            return Ok(true);
        }
    }

    /// Wait until the guest is ready or `timeout` elapses
    ///
    /// Returns `Ok(false)` on timeout. Errors that waiting cannot fix are
    /// returned immediately. When the deadline passes the in-flight attempt is
    /// dropped; the transport may keep its socket open until its own timeout.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<bool, CommError> {
        match tokio::time::timeout(timeout, self.wait_loop()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(stage = ?Stage::TimedOut, ?timeout, "Timed out waiting for SSH");
                Ok(false)
            }
        }
    }

    async fn wait_loop(&self) -> Result<bool, CommError> {
        let mut throttle = MessageThrottle::new(WARNING_INTERVAL);

        tracing::debug!(stage = ?Stage::WaitingForAddress, "Waiting for the guest SSH address");
        let info = loop {
            if let Some(info) = self.inner.machine.ssh_info().await {
                break info;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        self.announce(&info);

        loop {
            tracing::debug!(stage = ?Stage::Connecting, "Attempting SSH connection");
            match self.connect(Some(1), None).await {
                Ok(_) => match self.ready().await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) if e.is_fatal_for_readiness() => return Err(e),
                    Err(e) => tracing::warn!(error = %e, "Readiness check failed, retrying"),
                },
                Err(e) if e.is_fatal_for_readiness() => return Err(e),
                Err(e) => match e.readiness_message() {
                    Some(message) => {
                        if throttle.should_show(message) {
                            self.inner
                                .sink
                                .detail(&format!("Warning: {} Retrying...", message));
                        }
                    }
                    None => tracing::debug!(error = %e, "SSH not ready yet"),
                },
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Show the SSH address once per communicator lifetime
    fn announce(&self, info: &SshInfo) {
        if self.inner.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoint = EndpointDescriptor::resolve(info, &self.inner.config);
        let sink = &self.inner.sink;
        sink.detail(&format!("SSH address: {}", endpoint.address()));
        sink.detail(&format!("SSH username: {}", endpoint.username));
        sink.detail(&format!("SSH auth method: {}", endpoint.auth_label()));
    }
}
