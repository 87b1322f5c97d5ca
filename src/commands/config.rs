use std::path::Path;

use crate::cli::ConfigAction;
use convergefs::config::{get_config_path, load_config, load_config_from};
use convergefs::error::Result;

pub fn handle_config_command(action: Option<ConfigAction>, config_file: Option<&Path>) -> Result<()> {
    let config_path = match config_file {
        Some(path) => path.to_path_buf(),
        None => get_config_path()?,
    };

    match action {
        Some(ConfigAction::Path) => {
            println!("Config location: {}", config_path.display());
        }
        None | Some(ConfigAction::Show) => {
            let config = match config_file {
                Some(path) => load_config_from(path)?,
                None => load_config()?,
            };
            println!("Config file: {}", config_path.display());
            if !config_path.exists() {
                println!("  (not present, showing defaults)");
            }
            println!();
            println!("Current configuration:");
            println!("  Roots:");
            println!(
                "    write_target: {}",
                config.write_target.as_deref().unwrap_or("(unset)")
            );
            if config.virtual_folders.is_empty() {
                println!("    virtual_folders: (none)");
            } else {
                println!("    virtual_folders:");
                for folder in &config.virtual_folders {
                    println!("      - {}", folder);
                }
            }
            println!("  Async I/O:");
            println!("    enabled: {}", config.async_io.enabled);
            println!("    worker_threads: {}", config.async_io.get_worker_threads());
            println!("  Pools:");
            println!(
                "    max_request_contexts: {}",
                limit(config.pools.max_request_contexts)
            );
            println!(
                "    max_async_operations: {}",
                limit(config.pools.max_async_operations)
            );
            println!("  Mount:");
            println!("    fuse_ttl_secs: {}", config.mount.get_fuse_ttl_secs());
            println!("    fs_name: {}", config.mount.get_fs_name());
            println!("    namespace_prefix: {}", config.mount.get_namespace_prefix());
        }
    }
    Ok(())
}

fn limit(value: Option<usize>) -> String {
    value.map_or_else(|| "unlimited".to_string(), |n| n.to_string())
}
