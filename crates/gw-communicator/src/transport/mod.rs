//! SSH transport backed by russh
//!
//! Connects directly or through a proxy command, authenticates with the
//! methods the endpoint offers, and exposes each exec channel as an
//! [`ExecChannel`].

mod handler;
mod proxy;

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::KeyPair;

use gw_core::config::EndpointDescriptor;
use gw_core::traits::{ChannelEvent, ExecChannel, Transport, TransportSession};
use gw_core::types::AuthMethod;
use gw_core::{ErrorKind, TransportError};

use handler::ClientHandler;
pub use proxy::{expand_proxy_command, ProxyStream};

/// Keepalive interval when the endpoint asks for keepalives
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Map a russh error onto a transport error kind
pub(crate) fn classify(err: &russh::Error) -> ErrorKind {
    match err {
        russh::Error::IO(e) => ErrorKind::from_io(e),
        russh::Error::Disconnect | russh::Error::HUP => ErrorKind::Disconnected,
        russh::Error::UnknownKey => ErrorKind::HostKeyRejected,
        russh::Error::ConnectionTimeout => ErrorKind::ConnectionTimeout,
        other => {
            let message = other.to_string().to_lowercase();
            if message.contains("timeout") || message.contains("timed out") {
                ErrorKind::ConnectionTimeout
            } else if message.contains("unknown server key") {
                ErrorKind::HostKeyRejected
            } else {
                ErrorKind::Other
            }
        }
    }
}

fn transport_error(err: russh::Error) -> TransportError {
    TransportError::new(classify(&err), err.to_string())
}

/// Opens russh sessions
#[derive(Debug, Default)]
pub struct RusshTransport {}

impl RusshTransport {
    /// Create a transport
    pub fn new() -> Self {
        Self {}
    }

    fn client_config(endpoint: &EndpointDescriptor) -> Arc<Config> {
        let config = Config {
            keepalive_interval: endpoint.keep_alive.then_some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        Arc::new(config)
    }

    async fn handshake(
        &self,
        endpoint: &EndpointDescriptor,
        handler: ClientHandler,
    ) -> Result<Handle<ClientHandler>, TransportError> {
        let config = Self::client_config(endpoint);

        let handshake = async {
            match &endpoint.proxy_command {
                Some(template) => {
                    let command = expand_proxy_command(template, endpoint);
                    tracing::debug!(%command, "Connecting through proxy command");
                    let stream = ProxyStream::spawn(&command)?;
                    client::connect_stream(config, stream, handler)
                        .await
                        .map_err(transport_error)
                }
                None => {
                    tracing::debug!("Connecting to {}", endpoint.address());
                    client::connect(config, (endpoint.host.as_str(), endpoint.port), handler)
                        .await
                        .map_err(transport_error)
                }
            }
        };

        tokio::time::timeout(endpoint.connect_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::new(
                    ErrorKind::ConnectionTimeout,
                    format!("connection to {} timed out", endpoint.address()),
                )
            })?
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        endpoint: &EndpointDescriptor,
    ) -> Result<(), TransportError> {
        let user = endpoint.username.as_str();

        for method in endpoint.auth_methods() {
            let accepted = match method {
                AuthMethod::None => handle
                    .authenticate_none(user)
                    .await
                    .map_err(transport_error)?,
                AuthMethod::Hostbased => {
                    tracing::debug!("Hostbased authentication unavailable, skipping");
                    false
                }
                AuthMethod::PublicKey => {
                    let mut accepted = false;
                    for path in &endpoint.private_key_paths {
                        let Some(key) = load_key(path).await? else {
                            continue;
                        };
                        tracing::debug!(key = %path.display(), "Offering public key");
                        if handle
                            .authenticate_publickey(user, Arc::new(key))
                            .await
                            .map_err(transport_error)?
                        {
                            accepted = true;
                            break;
                        }
                    }
                    accepted
                }
                AuthMethod::Password => match &endpoint.password {
                    Some(password) => handle
                        .authenticate_password(user, password)
                        .await
                        .map_err(transport_error)?,
                    None => false,
                },
            };

            if accepted {
                tracing::debug!(?method, "Authenticated as '{}'", user);
                return Ok(());
            }
        }

        Err(TransportError::new(
            ErrorKind::AuthenticationFailed,
            format!("all authentication methods failed for '{}'", user),
        ))
    }
}

/// Load a private key; missing files are skipped
async fn load_key(path: &Path) -> Result<Option<KeyPair>, TransportError> {
    let secret = match tokio::fs::read_to_string(path).await {
        Ok(secret) => secret,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(key = %path.display(), "Private key not found, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    russh_keys::decode_secret_key(&secret, None).map(Some).map_err(|e| {
        let message = format!("failed to load {}: {}", path.display(), e);
        if e.to_string().to_lowercase().contains("unsupported") {
            TransportError::new(ErrorKind::KeyTypeNotSupported, message)
        } else {
            TransportError::new(ErrorKind::Other, message)
        }
    })
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let host_key_algorithm = Arc::new(OnceLock::new());
        let handler = ClientHandler::new(endpoint, Arc::clone(&host_key_algorithm));

        let mut handle = self.handshake(endpoint, handler).await?;
        Self::authenticate(&mut handle, endpoint).await?;

        Ok(Arc::new(RusshSession {
            handle,
            host_key_algorithm,
        }))
    }
}

/// An authenticated russh session
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    host_key_algorithm: Arc<OnceLock<String>>,
}

#[async_trait]
impl TransportSession for RusshSession {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::new(ErrorKind::ChannelOpenFailed, e.to_string()))?;
        Ok(Box::new(RusshChannel {
            channel,
            closed: false,
        }))
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        self.host_key_algorithm.get().cloned().into_iter().collect()
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(transport_error)
    }
}

/// One russh session channel
pub struct RusshChannel {
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ExecChannel for RusshChannel {
    async fn request_pty(&mut self) -> Result<(), TransportError> {
        self.channel
            .request_pty(true, "vt100", 80, 24, 0, 0, &[])
            .await
            .map_err(transport_error)
    }

    async fn request_agent_forwarding(&mut self) -> Result<(), TransportError> {
        self.channel
            .agent_forward(false)
            .await
            .map_err(transport_error)
    }

    async fn set_env(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        self.channel
            .set_env(false, name, value)
            .await
            .map_err(transport_error)
    }

    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.channel
            .exec(true, command)
            .await
            .map_err(transport_error)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await.map_err(transport_error)
    }

    async fn eof(&mut self) -> Result<(), TransportError> {
        self.channel.eof().await.map_err(transport_error)
    }

    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, TransportError> {
        if self.closed {
            return Ok(None);
        }

        loop {
            let event = match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => ChannelEvent::Stdout(Bytes::copy_from_slice(&data)),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext != SSH_EXTENDED_DATA_STDERR {
                        tracing::debug!(ext, "Treating extended data as stderr");
                    }
                    ChannelEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => ChannelEvent::ExitStatus(exit_status),
                Some(ChannelMsg::Eof) => ChannelEvent::Eof,
                Some(ChannelMsg::Close) => {
                    self.closed = true;
                    ChannelEvent::Close
                }
                Some(other) => {
                    tracing::trace!(?other, "Ignoring channel message");
                    continue;
                }
                None => {
                    self.closed = true;
                    return Err(TransportError::new(
                        ErrorKind::ConnectionReset,
                        "channel ended without closing",
                    ));
                }
            };
            return Ok(Some(event));
        }
    }
}
