//! guestwire CLI
//!
//! Runs commands on a VM guest over SSH, waits for it to become reachable,
//! and copies files in both directions.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guestwire::commands::{self, Target};
use guestwire::output::print_error;

#[derive(Parser)]
#[command(name = "guestwire")]
#[command(author, version, about = "Run commands on VM guests over SSH")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Guest address
    #[arg(long, global = true, env = "GUESTWIRE_HOST")]
    host: Option<String>,

    /// Guest SSH port
    #[arg(long, global = true, default_value_t = 22, env = "GUESTWIRE_PORT")]
    port: u16,

    /// Remote user (defaults to the local user)
    #[arg(long, global = true, env = "GUESTWIRE_USER")]
    user: Option<String>,

    /// Private key to offer; may be repeated
    #[arg(long = "key", global = true)]
    keys: Vec<PathBuf>,

    /// Password to offer after keys
    #[arg(long, global = true, env = "GUESTWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory for per-machine state such as the generated key
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Run commands in a pseudo-terminal
    #[arg(long, global = true)]
    pty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on the guest and mirror its exit status
    Exec {
        /// Command line to run
        command: String,
        /// Run through the sudo template
        #[arg(long)]
        sudo: bool,
        /// Do not report a non-zero exit status as an error
        #[arg(long)]
        no_error_check: bool,
    },

    /// Exit 0 if a command succeeds on the guest, 1 otherwise
    Test {
        /// Command line to run
        command: String,
    },

    /// Copy a local file or directory to the guest
    Upload {
        /// Local path; a trailing `/.` copies the directory contents
        from: PathBuf,
        /// Remote destination
        to: String,
    },

    /// Copy a file or directory from the guest
    Download {
        /// Remote path
        from: String,
        /// Local destination
        to: PathBuf,
    },

    /// Wait until the guest accepts commands
    Wait {
        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the config file path
    Path,
}

impl Cli {
    fn target(&self) -> Result<Target> {
        let host = self
            .host
            .clone()
            .context("No guest address given; pass --host or set GUESTWIRE_HOST")?;

        Ok(Target {
            host,
            port: self.port,
            user: self.user.clone().unwrap_or_else(whoami::username),
            keys: self.keys.clone(),
            password: self.password.clone(),
            data_dir: self.data_dir.clone(),
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    if let Commands::Config { action } = &cli.command {
        match action {
            ConfigAction::Show => commands::config_show(cli.config.as_ref())?,
            ConfigAction::Path => commands::config_path(cli.config.as_ref()),
        }
        return Ok(0);
    }

    let mut config = commands::load_communicator_config(cli.config.as_ref())?;
    if cli.pty {
        config.pty = true;
    }
    let target = cli.target()?;
    let comm = commands::communicator(&target, config, cli.quiet);

    let code = match &cli.command {
        Commands::Exec {
            command,
            sudo,
            no_error_check,
        } => commands::exec_command(&comm, command, *sudo, !*no_error_check).await?,

        Commands::Test { command } => commands::test_command(&comm, command).await?,

        Commands::Upload { from, to } => {
            commands::upload_command(&comm, from, to).await?;
            0
        }

        Commands::Download { from, to } => {
            commands::download_command(&comm, from, to).await?;
            0
        }

        Commands::Wait { timeout } => {
            commands::wait_command(&comm, Duration::from_secs(*timeout)).await?
        }

        Commands::Config { .. } => 0,
    };

    comm.reset().await;
    Ok(code)
}
