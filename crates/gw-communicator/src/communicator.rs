//! The communicator handle

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::Mutex;

use gw_core::config::CommunicatorConfig;
use gw_core::traits::{GuestCapabilities, Machine, ProgressSink, Transport};

use crate::connection::SessionSlot;
use crate::keys::KeyRotationState;
use crate::transport::RusshTransport;

/// SSH communicator for one machine
///
/// Cheap to clone; all clones share the same session and rotation state.
#[derive(Clone)]
pub struct Communicator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) guest: Arc<dyn GuestCapabilities>,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: CommunicatorConfig,
    /// Guards create, replace and close of the session only
    pub(crate) slot: Mutex<SessionSlot>,
    /// Guards the one-time credential rotation claim only
    pub(crate) rotation: Mutex<KeyRotationState>,
    /// Set once the SSH address has been shown to the user
    pub(crate) announced: AtomicBool,
}

impl Communicator {
    /// Create a communicator that connects with russh
    pub fn new(
        machine: Arc<dyn Machine>,
        guest: Arc<dyn GuestCapabilities>,
        sink: Arc<dyn ProgressSink>,
        config: CommunicatorConfig,
    ) -> Self {
        Self::with_transport(machine, guest, sink, config, Arc::new(RusshTransport::new()))
    }

    /// Create a communicator on top of a custom transport
    pub fn with_transport(
        machine: Arc<dyn Machine>,
        guest: Arc<dyn GuestCapabilities>,
        sink: Arc<dyn ProgressSink>,
        config: CommunicatorConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                machine,
                guest,
                sink,
                transport,
                config,
                slot: Mutex::new(SessionSlot::Unopened),
                rotation: Mutex::new(KeyRotationState::Pending),
                announced: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this communicator was created with
    pub fn config(&self) -> &CommunicatorConfig {
        &self.inner.config
    }

    /// Close the current session; the next operation reconnects
    pub async fn reset(&self) {
        let previous = {
            let mut slot = self.inner.slot.lock().await;
            std::mem::replace(&mut *slot, SessionSlot::Closed)
        };

        if let SessionSlot::Open(open) = previous {
            tracing::debug!(address = %open.endpoint.address(), "Closing SSH session");
            if let Err(e) = open.session.close().await {
                tracing::debug!(error = %e, "Error while closing SSH session");
            }
        }
    }
}
