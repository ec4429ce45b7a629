//! Transport traits
//!
//! The communicator never talks to an SSH library directly. A [`Transport`]
//! opens sessions, a [`TransportSession`] opens exec channels, and an
//! [`ExecChannel`] carries one remote command.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::config::EndpointDescriptor;
use crate::error::TransportError;

/// Something that happened on an exec channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    /// Remote side will send no more data
    Eof,
    /// Channel closed; no further events follow
    Close,
}

/// One remote command
#[async_trait]
pub trait ExecChannel: Send {
    /// Allocate a pseudo-terminal
    async fn request_pty(&mut self) -> Result<(), TransportError>;

    /// Ask the server to forward the local agent
    async fn request_agent_forwarding(&mut self) -> Result<(), TransportError>;

    /// Set an environment variable for the command
    async fn set_env(&mut self, name: &str, value: &str) -> Result<(), TransportError>;

    /// Start the command
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Write to the command's stdin
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the command's stdin
    async fn eof(&mut self) -> Result<(), TransportError>;

    /// Wait for the next event; `Ok(None)` when the channel is gone
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, TransportError>;
}

/// An authenticated connection
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open a new exec channel
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>, TransportError>;

    /// Host key algorithms negotiated or advertised during the handshake
    fn host_key_algorithms(&self) -> Vec<String>;

    /// Whether the transport already knows the connection is gone
    fn is_closed(&self) -> bool;

    /// Disconnect
    async fn close(&self) -> Result<(), TransportError>;

    /// Round-trip a no-op command to prove the session still works
    async fn probe(&self) -> Result<(), TransportError> {
        let mut channel = self.open_channel().await?;
        channel.exec("").await?;
        while let Some(event) = channel.next_event().await? {
            if event == ChannelEvent::Close {
                break;
            }
        }
        Ok(())
    }
}

/// Opens sessions to an endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}
