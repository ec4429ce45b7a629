//! File transfer over scp
//!
//! Each upload runs `scp -t` on its own channel and each download runs
//! `scp -r -f`; the control records are handled by [`gw_protocol::ScpCodec`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use gw_core::traits::{ChannelEvent, ExecChannel, TransportSession};
use gw_core::{CommError, ErrorKind, ExecOptions, TransportError};
use gw_protocol::script::{mkdir_command, scp_sink_command, scp_source_command};
use gw_protocol::{ScpAck, ScpCodec, ScpMessage, ScpRecord};

use crate::communicator::Communicator;

const CHUNK_SIZE: usize = 32 * 1024;

/// Exit status of a shell that could not find the command
const COMMAND_NOT_FOUND: u32 = 127;

impl Communicator {
    /// Copy a local file or directory to the guest
    ///
    /// A directory source ending in `/.` copies its contents into `to`; any
    /// other directory is copied to `to/<name>`. A file copied to a path
    /// ending in `/` keeps its name.
    pub async fn upload(&self, from: &Path, to: &str) -> Result<(), CommError> {
        let connected = self.connect(None, None).await?;
        let metadata = tokio::fs::metadata(from).await?;
        let name = local_name(from)?;

        tracing::info!(from = %from.display(), to, "Uploading");

        if metadata.is_dir() {
            let root = if contents_only(from) {
                to.trim_end_matches('/').to_string()
            } else {
                join_remote(to, &name)
            };
            self.upload_dir(&connected.session, from, &root).await
        } else {
            let dest = if to.ends_with('/') {
                join_remote(to, &name)
            } else {
                to.to_string()
            };
            if let Some(parent) = remote_parent(&dest) {
                self.mkdir(parent).await?;
            }
            send_file(&connected.session, from, &dest, &name).await
        }
    }

    /// Copy a file or directory from the guest
    ///
    /// When `to` is an existing directory the remote entry is created inside
    /// it; otherwise it is written to `to` itself.
    pub async fn download(&self, from: &str, to: &Path) -> Result<(), CommError> {
        let connected = self.connect(None, None).await?;
        tracing::info!(from, to = %to.display(), "Downloading");

        let channel = connected.session.open_channel().await.map_err(channel_open)?;
        let mut peer = ScpPeer::new(channel, from, &to.display().to_string());
        peer.channel.exec(&scp_source_command(from, true)).await?;
        receive(&mut peer, to).await
    }

    async fn mkdir(&self, dir: &str) -> Result<(), CommError> {
        self.execute(&mkdir_command(dir), ExecOptions::default())
            .await
            .map(|_| ())
    }

    async fn upload_dir(
        &self,
        session: &Arc<dyn TransportSession>,
        local_root: &Path,
        remote_root: &str,
    ) -> Result<(), CommError> {
        let mut pending = vec![(local_root.to_path_buf(), remote_root.to_string())];

        while let Some((local, remote)) = pending.pop() {
            self.mkdir(&remote).await?;

            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(&local).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|entry| entry.file_name());

            let mut subdirs = Vec::new();
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                let dest = join_remote(&remote, &name);
                if entry.file_type().await?.is_dir() {
                    subdirs.push((path, dest));
                } else {
                    send_file(session, &path, &dest, &name).await?;
                }
            }
            // Depth first, in name order
            pending.extend(subdirs.into_iter().rev());
        }

        Ok(())
    }
}

/// One scp process on the far side of a channel
struct ScpPeer {
    channel: Box<dyn ExecChannel>,
    buffer: BytesMut,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    closed: bool,
    from: String,
    to: String,
}

impl ScpPeer {
    fn new(channel: Box<dyn ExecChannel>, from: &str, to: &str) -> Self {
        Self {
            channel,
            buffer: BytesMut::new(),
            stderr: Vec::new(),
            exit_status: None,
            closed: false,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Read one more event into the buffers; false once the channel is gone
    async fn fill(&mut self) -> Result<bool, CommError> {
        if self.closed {
            return Ok(false);
        }
        match self.channel.next_event().await? {
            Some(ChannelEvent::Stdout(data)) => self.buffer.extend_from_slice(&data),
            Some(ChannelEvent::Stderr(data)) => self.stderr.extend_from_slice(&data),
            Some(ChannelEvent::ExitStatus(status)) => self.exit_status = Some(status),
            Some(ChannelEvent::Eof) => {}
            Some(ChannelEvent::Close) | None => self.closed = true,
        }
        Ok(true)
    }

    async fn read_ack(&mut self) -> Result<(), CommError> {
        loop {
            if let Some(ack) = ScpAck::decode(&mut self.buffer)? {
                return match ack.message() {
                    None => Ok(()),
                    Some(message) => Err(self.remote_error(message)),
                };
            }
            if !self.fill().await? {
                return Err(self.exit_error());
            }
        }
    }

    async fn send_ack(&mut self) -> Result<(), CommError> {
        let mut buf = BytesMut::new();
        ScpAck::Ok.encode(&mut buf);
        self.channel.write(&buf).await?;
        Ok(())
    }

    /// Wait for the remote scp to exit
    async fn finish(&mut self) -> Result<(), CommError> {
        while self.fill().await? {}
        match self.exit_status {
            Some(0) => Ok(()),
            _ => Err(self.exit_error()),
        }
    }

    fn remote_error(&self, message: &str) -> CommError {
        if message.contains("Permission denied") {
            CommError::ScpPermissionDenied {
                from: self.from.clone(),
                to: self.to.clone(),
            }
        } else {
            CommError::Scp(message.to_string())
        }
    }

    fn exit_error(&self) -> CommError {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        match self.exit_status {
            Some(COMMAND_NOT_FOUND) => CommError::ScpUnavailable,
            _ if stderr.contains("Permission denied") => self.remote_error(&stderr),
            Some(status) => CommError::Scp(format!("scp exited with status {}: {}", status, stderr)),
            None => CommError::Scp(format!("scp closed the channel unexpectedly: {}", stderr)),
        }
    }
}

async fn send_file(
    session: &Arc<dyn TransportSession>,
    local: &Path,
    remote: &str,
    name: &str,
) -> Result<(), CommError> {
    let mut file = tokio::fs::File::open(local).await?;
    let metadata = file.metadata().await?;

    tracing::debug!(from = %local.display(), to = remote, size = metadata.len(), "Sending file");

    let channel = session.open_channel().await.map_err(channel_open)?;
    let mut peer = ScpPeer::new(channel, &local.display().to_string(), remote);
    peer.channel.exec(&scp_sink_command(remote)).await?;
    peer.read_ack().await?;

    let mut header = BytesMut::new();
    ScpCodec::new().encode(
        ScpRecord::File {
            mode: file_mode(&metadata),
            size: metadata.len(),
            name: name.to_string(),
        },
        &mut header,
    )?;
    peer.channel.write(&header).await?;
    peer.read_ack().await?;

    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        peer.channel.write(&chunk[..n]).await?;
    }
    peer.send_ack().await?;
    peer.read_ack().await?;

    peer.channel.eof().await?;
    peer.finish().await
}

/// Sink side of `scp -f`
async fn receive(peer: &mut ScpPeer, to: &Path) -> Result<(), CommError> {
    let mut codec = ScpCodec::new();
    let into_existing = tokio::fs::metadata(to)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    let mut dirs: Vec<PathBuf> = Vec::new();

    peer.send_ack().await?;

    loop {
        let message = match codec.decode(&mut peer.buffer)? {
            Some(message) => message,
            None => {
                if peer.fill().await? {
                    continue;
                }
                if peer.buffer.is_empty() {
                    break;
                }
                return Err(CommError::Scp("truncated scp control record".to_string()));
            }
        };

        let record = match message {
            ScpMessage::Record(record) => record,
            ScpMessage::Warning(message) | ScpMessage::Fatal(message) => {
                return Err(peer.remote_error(&message));
            }
        };

        match record {
            ScpRecord::Times { .. } => {}
            ScpRecord::Directory { mode, name } => {
                let path = target_path(to, into_existing, &dirs, &name);
                tokio::fs::create_dir_all(&path).await?;
                set_mode(&path, mode).await;
                dirs.push(path);
            }
            ScpRecord::EndDirectory => {
                dirs.pop();
            }
            ScpRecord::File { mode, size, name } => {
                let path = target_path(to, into_existing, &dirs, &name);
                tracing::debug!(path = %path.display(), size, "Receiving file");
                peer.send_ack().await?;
                receive_contents(peer, &path, size).await?;
                set_mode(&path, mode).await;
                peer.read_ack().await?;
            }
        }
        peer.send_ack().await?;
    }

    match peer.exit_status {
        Some(0) => Ok(()),
        _ => Err(peer.exit_error()),
    }
}

async fn receive_contents(peer: &mut ScpPeer, path: &Path, size: u64) -> Result<(), CommError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut remaining = size;

    while remaining > 0 {
        if peer.buffer.is_empty() && !peer.fill().await? {
            return Err(CommError::Scp(format!(
                "connection closed with {} bytes of {} outstanding",
                remaining,
                path.display()
            )));
        }
        let take = remaining.min(peer.buffer.len() as u64) as usize;
        let data = peer.buffer.split_to(take);
        file.write_all(&data).await?;
        remaining -= take as u64;
    }

    file.flush().await?;
    Ok(())
}

fn target_path(to: &Path, into_existing: bool, dirs: &[PathBuf], name: &str) -> PathBuf {
    match dirs.last() {
        Some(dir) => dir.join(name),
        None if into_existing => to.join(name),
        None => to.to_path_buf(),
    }
}

fn channel_open(e: TransportError) -> TransportError {
    TransportError::new(ErrorKind::ChannelOpenFailed, e.message)
}

fn contents_only(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text == "." || text.ends_with("/.")
}

/// Name a local path is copied under
fn local_name(path: &Path) -> Result<String, CommError> {
    // A trailing `/.` is not a component, so `src/.` is named `src`
    if let Some(name) = path.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let canonical = std::fs::canonicalize(path)?;
    canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| CommError::Scp(format!("cannot determine a name for {}", path.display())))
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn remote_parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

async fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(mode & 0o7777);
        if let Err(e) = tokio::fs::set_permissions(path, permissions).await {
            tracing::debug!(path = %path.display(), error = %e, "Cannot set file mode");
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}
