//! Remote command execution
//!
//! Every command runs on a fresh channel. The channel execs the login shell
//! (wrapped in sudo when requested) and the command is delivered as a script
//! on stdin. Without a pty the script prints a marker on both streams before
//! the command so login banners can be cut off; with a pty the output is
//! wrapped in start/end delimiters and extracted once the channel closes.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gw_core::config::EndpointDescriptor;
use gw_core::traits::{ChannelEvent, ExecChannel, TransportSession};
use gw_core::{CommError, CommandResult, ErrorKind, ExecOptions, OutputEvent, TransportError};
use gw_protocol::script::{shell_command, AUTH_SOCK_QUERY};
use gw_protocol::{Markers, PtyTranscript, RawTranscript, ScriptBuilder};

use crate::communicator::Communicator;
use crate::connection::Connected;

/// Buffered output events per streaming command
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// A command running in the background
///
/// Output arrives on [`CommandStream::recv`] in the order the transport
/// delivered it; [`CommandStream::finish`] waits for the final result.
pub struct CommandStream {
    events: mpsc::Receiver<OutputEvent>,
    handle: JoinHandle<Result<CommandResult, CommError>>,
}

impl CommandStream {
    /// Next output event, `None` once the command has finished
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Wait for the command result
    pub async fn finish(self) -> Result<CommandResult, CommError> {
        drop(self.events);
        self.handle
            .await
            .map_err(|e| CommError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

enum Transcript {
    Raw(RawTranscript),
    Pty(PtyTranscript),
}

impl Communicator {
    /// Run a command and collect its output
    pub async fn execute(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, CommError> {
        let connected = self.connect(None, None).await?;
        self.run(&connected, command, &opts, None).await
    }

    /// Run a command, delivering output as it arrives
    pub fn execute_streaming(&self, command: &str, opts: ExecOptions) -> CommandStream {
        let (tx, events) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let this = self.clone();
        let command = command.to_string();

        let handle = tokio::spawn(async move {
            let connected = this.connect(None, None).await?;
            this.run(&connected, &command, &opts, Some(tx)).await
        });

        CommandStream { events, handle }
    }

    /// Run a command through the sudo template
    pub async fn sudo(&self, command: &str, opts: ExecOptions) -> Result<CommandResult, CommError> {
        self.execute(command, opts.with_sudo()).await
    }

    /// Whether a command exits with status 0
    pub async fn test(&self, command: &str) -> Result<bool, CommError> {
        let result = self.execute(command, ExecOptions::unchecked()).await?;
        Ok(result.exit_status == 0)
    }

    pub(crate) async fn run(
        &self,
        connected: &Connected,
        command: &str,
        opts: &ExecOptions,
        events: Option<mpsc::Sender<OutputEvent>>,
    ) -> Result<CommandResult, CommError> {
        let agent_socket = if connected.endpoint.forward_agent && opts.sudo {
            let socket = self.agent_socket(connected).await?;
            if socket.is_none() {
                self.inner
                    .sink
                    .warn("SSH agent forwarding is enabled but no agent socket was found in the guest");
            }
            socket
        } else {
            None
        };

        let result = self
            .run_script(connected, command, opts, agent_socket.as_deref(), events)
            .await?;

        if opts.error_check && !opts.accepts(result.exit_status) {
            return Err(CommError::BadExitStatus {
                key: opts.error_key.clone(),
                command: command.to_string(),
                exit_status: result.exit_status,
                stdout: result.stdout_lossy(),
                stderr: result.stderr_lossy(),
            });
        }

        tracing::debug!(exit_status = result.exit_status, "Remote command finished");
        Ok(result)
    }

    async fn run_script(
        &self,
        connected: &Connected,
        command: &str,
        opts: &ExecOptions,
        agent_socket: Option<&str>,
        events: Option<mpsc::Sender<OutputEvent>>,
    ) -> Result<CommandResult, CommError> {
        let endpoint = &connected.endpoint;
        let use_pty = endpoint.pty && !opts.force_raw && !command.is_empty();
        let markers = Markers::generate();

        let mut builder = ScriptBuilder::new(&endpoint.export_command_template, &markers);
        if let Some(socket) = agent_socket {
            builder = builder.export("SSH_AUTH_SOCK", socket);
        }
        let script = if use_pty {
            builder.pty(command)
        } else {
            builder.raw(command)
        };
        let shell = shell_command(
            &endpoint.shell,
            opts.shell.as_deref(),
            opts.sudo.then_some(endpoint.sudo_command.as_str()),
        );

        tracing::debug!(command, shell = %shell, pty = use_pty, "Executing remote command");

        let mut channel = open_command_channel(&connected.session, endpoint, use_pty).await?;
        channel.exec(&shell).await?;
        channel.write(script.as_bytes()).await?;
        channel.eof().await?;

        let transcript = if use_pty {
            Transcript::Pty(PtyTranscript::new())
        } else {
            Transcript::Raw(RawTranscript::new(&markers.banner, self.inner.config.banner_limit))
        };

        collect(channel.as_mut(), transcript, &markers, events.as_ref()).await
    }

    /// Find the forwarded agent socket as seen by the unprivileged user
    async fn agent_socket(&self, connected: &Connected) -> Result<Option<String>, CommError> {
        let result = self
            .run_script(connected, AUTH_SOCK_QUERY, &ExecOptions::unchecked().raw(), None, None)
            .await?;
        let socket = result
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string);
        tracing::debug!(socket = ?socket, "Resolved forwarded agent socket");
        Ok(socket)
    }
}

async fn open_command_channel(
    session: &Arc<dyn TransportSession>,
    endpoint: &EndpointDescriptor,
    use_pty: bool,
) -> Result<Box<dyn ExecChannel>, CommError> {
    let mut channel = session.open_channel().await.map_err(|e| {
        TransportError::new(ErrorKind::ChannelOpenFailed, e.message)
    })?;

    if endpoint.forward_agent {
        channel.request_agent_forwarding().await?;
    }
    for name in &endpoint.forward_env {
        if let Ok(value) = std::env::var(name) {
            channel.set_env(name, &value).await?;
        }
    }
    if use_pty {
        channel.request_pty().await?;
    }

    Ok(channel)
}

async fn emit(events: Option<&mpsc::Sender<OutputEvent>>, event: OutputEvent) {
    if let Some(tx) = events {
        // The caller may have stopped listening; the result is still collected
        let _ = tx.send(event).await;
    }
}

/// Drain a command channel into a result
async fn collect(
    channel: &mut dyn ExecChannel,
    mut transcript: Transcript,
    markers: &Markers,
    events: Option<&mpsc::Sender<OutputEvent>>,
) -> Result<CommandResult, CommError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    loop {
        let event = match channel.next_event().await {
            Ok(event) => event,
            Err(e) if is_reset(&e) => {
                // The guest went away mid-command, usually a reboot
                tracing::info!(error = %e, "Connection reset while waiting for command; assuming success");
                emit(events, OutputEvent::ExitStatus(0)).await;
                return Ok(CommandResult {
                    exit_status: 0,
                    stdout,
                    stderr,
                    pty: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        match event {
            Some(ChannelEvent::Stdout(data)) => match &mut transcript {
                Transcript::Raw(raw) => {
                    let out = raw.stdout(&data)?;
                    if !out.is_empty() {
                        stdout.extend_from_slice(&out);
                        emit(events, OutputEvent::Stdout(Bytes::from(out))).await;
                    }
                }
                Transcript::Pty(pty) => pty.push(&data),
            },
            Some(ChannelEvent::Stderr(data)) => match &mut transcript {
                Transcript::Raw(raw) => {
                    let out = raw.stderr(&data)?;
                    if !out.is_empty() {
                        stderr.extend_from_slice(&out);
                        emit(events, OutputEvent::Stderr(Bytes::from(out))).await;
                    }
                }
                Transcript::Pty(pty) => pty.push(&data),
            },
            Some(ChannelEvent::ExitStatus(status)) => exit_status = Some(status),
            Some(ChannelEvent::Eof) => {}
            Some(ChannelEvent::Close) | None => break,
        }
    }

    let exit_status = exit_status.ok_or(CommError::NoExitStatus)?;

    let pty = match transcript {
        Transcript::Pty(pty) => {
            let output = pty.finish(&markers.pty_start, &markers.pty_end).map_err(|e| {
                tracing::debug!(error = %e, transcript_len = pty.as_bytes().len(), "Pty delimiters missing");
                CommError::InvalidShell
            })?;
            if !output.is_empty() {
                emit(events, OutputEvent::Stdout(Bytes::copy_from_slice(&output))).await;
            }
            stdout = output;
            true
        }
        Transcript::Raw(_) => false,
    };

    emit(events, OutputEvent::ExitStatus(exit_status)).await;

    Ok(CommandResult {
        exit_status,
        stdout,
        stderr,
        pty,
    })
}

fn is_reset(err: &TransportError) -> bool {
    matches!(
        err.kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
