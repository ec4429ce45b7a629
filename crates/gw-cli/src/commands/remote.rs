//! Commands that talk to the guest

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;

use gw_communicator::Communicator;
use gw_core::config::{CommunicatorConfig, SshInfo};
use gw_core::{CommError, ExecOptions, OutputEvent};

use crate::machine::{NoCapabilities, StaticMachine};
use crate::output::{print_error, print_success, TerminalSink};

/// Where and how to reach the guest
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub keys: Vec<PathBuf>,
    pub password: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl Target {
    fn ssh_info(&self) -> SshInfo {
        let mut info = SshInfo::new(self.host.clone(), self.port, self.user.clone());
        info.private_key_path = self.keys.clone();
        info.password = self.password.clone();
        info
    }
}

/// Build a communicator for `target`
pub fn communicator(target: &Target, config: CommunicatorConfig, quiet: bool) -> Communicator {
    let data_dir = target
        .data_dir
        .clone()
        .unwrap_or_else(|| StaticMachine::default_data_dir(&target.host, target.port));
    tracing::debug!("Using data dir {:?}", data_dir);

    let machine = StaticMachine::new(target.ssh_info(), data_dir);
    Communicator::new(
        Arc::new(machine),
        Arc::new(NoCapabilities),
        Arc::new(TerminalSink::new(quiet)),
        config,
    )
}

fn exit_code(status: u32) -> i32 {
    i32::try_from(status).unwrap_or(1)
}

/// Run a command, streaming its output; returns the remote exit status
pub async fn exec_command(
    comm: &Communicator,
    command: &str,
    sudo: bool,
    error_check: bool,
) -> Result<i32> {
    let mut opts = if error_check {
        ExecOptions::default()
    } else {
        ExecOptions::unchecked()
    };
    if sudo {
        opts = opts.with_sudo();
    }

    let mut stream = comm.execute_streaming(command, opts);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(event) = stream.recv().await {
        match event {
            OutputEvent::Stdout(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            OutputEvent::Stderr(data) => {
                stderr.write_all(&data).await?;
                stderr.flush().await?;
            }
            OutputEvent::ExitStatus(status) => {
                tracing::debug!(status, "Remote command finished");
            }
        }
    }

    match stream.finish().await {
        Ok(result) => Ok(exit_code(result.exit_status)),
        Err(CommError::BadExitStatus { exit_status, .. }) => {
            print_error(&format!("Command exited with status {}", exit_status));
            Ok(exit_code(exit_status))
        }
        Err(e) => Err(e.into()),
    }
}

/// Exit 0 when the command succeeds, 1 otherwise
pub async fn test_command(comm: &Communicator, command: &str) -> Result<i32> {
    Ok(if comm.test(command).await? { 0 } else { 1 })
}

/// Copy a local file or directory to the guest
pub async fn upload_command(comm: &Communicator, from: &Path, to: &str) -> Result<()> {
    comm.upload(from, to).await?;
    print_success(&format!("Uploaded {} to {}", from.display(), to));
    Ok(())
}

/// Copy a guest file or directory to the host
pub async fn download_command(comm: &Communicator, from: &str, to: &Path) -> Result<()> {
    comm.download(from, to).await?;
    print_success(&format!("Downloaded {} to {}", from, to.display()));
    Ok(())
}

/// Wait for the guest to accept commands
pub async fn wait_command(comm: &Communicator, timeout: Duration) -> Result<i32> {
    if comm.wait_for_ready(timeout).await? {
        print_success("Machine is ready");
        Ok(0)
    } else {
        print_error(&format!(
            "Timed out after {}s waiting for SSH",
            timeout.as_secs()
        ));
        Ok(1)
    }
}
