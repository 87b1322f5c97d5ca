pub mod config;
pub mod mount;
pub mod resolve;
pub mod tree;

pub use config::handle_config_command;
pub use mount::run_mount;
pub use resolve::print_resolution;
pub use tree::print_tree;

use std::path::Path;

use convergefs::config::{load_config, load_config_from, validate_config, Config};
use convergefs::error::Result;

use crate::cli::MountArgs;

/// The configuration file, with command-line roots layered on top.
pub fn effective_config(config_file: Option<&Path>, roots: &MountArgs) -> Result<Config> {
    let mut config = match config_file {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    if let Some(write_target) = &roots.write_target {
        config.write_target = Some(write_target.to_string_lossy().into_owned());
    }
    if !roots.folders.is_empty() {
        config.virtual_folders = roots
            .folders
            .iter()
            .map(|folder| folder.to_string_lossy().into_owned())
            .collect();
    }
    if roots.no_async {
        config.async_io.enabled = false;
    }

    validate_config(&config)?;
    Ok(config)
}
