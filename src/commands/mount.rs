use std::path::Path;
use std::sync::Arc;

use convergefs::config::Config;
use convergefs::error::{ConvergeError, Result};
use convergefs::vfs::{mount_fuse, ConvergenceFs};

/// Mount the union and block until Ctrl-C, then unmount.
pub fn run_mount(mount_point: &Path, config: &Config) -> Result<()> {
    let options = config.to_mount_options()?;
    let union_fs = Arc::new(ConvergenceFs::new(options));

    let handle = mount_fuse(
        mount_point,
        Arc::clone(&union_fs),
        &config.mount.get_fs_name(),
        config.mount.get_fuse_ttl_secs(),
    )?;

    println!(
        "Mounted union of {} roots at {} ({} nodes)",
        union_fs.folders().len(),
        mount_point.display(),
        union_fs.node_count()
    );
    println!("Press Ctrl-C to unmount.");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .map_err(|e| ConvergeError::Mount(format!("Failed to wait for Ctrl-C: {}", e)))?;
    drop(runtime);

    let stats = union_fs.context_stats();
    tracing::info!(
        "Shutting down: {} open handles, {} request contexts allocated",
        union_fs.open_handles(),
        stats.allocated
    );
    handle.unmount()?;
    println!("Unmounted {}", mount_point.display());
    Ok(())
}
