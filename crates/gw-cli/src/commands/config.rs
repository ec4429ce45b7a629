//! Config command implementations

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::output::{print_info, print_warning};
use gw_core::config::{self, CommunicatorConfig};

/// Config file to use: the explicit one or the default location
pub fn config_file(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load the communicator configuration
///
/// A missing default file yields the built-in defaults; a missing explicit
/// file is an error.
pub fn load_communicator_config(config_path: Option<&PathBuf>) -> Result<CommunicatorConfig> {
    let path = config_file(config_path);

    if config_path.is_none() && !path.exists() {
        tracing::debug!("No config file at {:?}, using defaults", path);
        return Ok(CommunicatorConfig::default());
    }

    config::load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))
}

/// Show the effective configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_file(config_path);

    if path.exists() {
        print_info(&format!("Configuration file: {:?}", path));
    } else {
        print_warning(&format!("No configuration file found at {:?}, showing defaults", path));
    }
    println!();

    let config = load_communicator_config(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);

    Ok(())
}

/// Print the config file path
pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", config_file(config_path).display());
}
