//! CLI command implementations

mod config;
mod remote;

pub use config::{config_path, config_show, load_communicator_config};
pub use remote::{
    communicator, download_command, exec_command, test_command, upload_command, wait_command,
    Target,
};
