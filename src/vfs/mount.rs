use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ConvergeError, Result};
use crate::vfs::convergence::ConvergenceFs;
use crate::vfs::fuse::ConvergenceFuse;

const MOUNT_TIMEOUT: Duration = Duration::from_millis(2000);
const CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// A live kernel mount. Dropping it unmounts without draining the union;
/// call [`MountHandle::unmount`] for an orderly shutdown.
pub struct MountHandle {
    session: Option<fuser::BackgroundSession>,
    fs: Arc<ConvergenceFs>,
    mount_point: PathBuf,
}

impl MountHandle {
    pub fn fs(&self) -> &Arc<ConvergenceFs> {
        &self.fs
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Detach from the kernel, then close open handles and drain the pools.
    pub fn unmount(mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            tracing::info!("Unmounting {}", self.mount_point.display());
            session.join();
        }
        match self.fs.unmount() {
            Ok(()) | Err(ConvergeError::NotMounted) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Mount the union at `mount_point` on a background session thread.
///
/// The union is initialized before the kernel sees it, so root or pool
/// failures surface here instead of inside the FUSE `init` callback.
///
/// # Arguments
/// * `mount_point` - Directory the union appears under; created if missing
/// * `union_fs` - The union, mounted or not
/// * `fs_name` - Name shown in the mount table
/// * `ttl_secs` - Cache TTL in seconds for FUSE attributes and entries
pub fn mount_fuse(
    mount_point: &Path,
    union_fs: Arc<ConvergenceFs>,
    fs_name: &str,
    ttl_secs: u64,
) -> Result<MountHandle> {
    fs::create_dir_all(mount_point).map_err(|e| {
        ConvergeError::Config(format!(
            "Failed to create mount directory {}: {}",
            mount_point.display(),
            e
        ))
    })?;

    if !union_fs.is_mounted() {
        union_fs.init()?;
    }

    let mount_options = vec![
        fuser::MountOption::FSName(fs_name.to_string()),
        fuser::MountOption::AutoUnmount,
    ];

    tracing::info!("Mounting FUSE filesystem at {}", mount_point.display());
    let adapter = ConvergenceFuse::new(Arc::clone(&union_fs), ttl_secs);
    let session = match fuser::spawn_mount2(adapter, mount_point, &mount_options) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("FUSE mount error: {}", e);
            let _ = union_fs.unmount();
            return Err(ConvergeError::Fuse(format!("FUSE mount failed: {}", e)));
        }
    };

    let handle = MountHandle {
        session: Some(session),
        fs: union_fs,
        mount_point: mount_point.to_path_buf(),
    };

    // The session thread answers requests once the kernel has the mount;
    // a readable mount point is the signal that it does.
    let start = Instant::now();
    loop {
        if mount_point.is_dir() && fs::read_dir(mount_point).is_ok() {
            tracing::debug!("FUSE mount verified accessible");
            break;
        }
        if start.elapsed() >= MOUNT_TIMEOUT {
            let _ = handle.unmount();
            return Err(ConvergeError::Fuse(format!(
                "FUSE mount timed out - mount point not accessible after {} ms",
                MOUNT_TIMEOUT.as_millis()
            )));
        }
        std::thread::sleep(CHECK_INTERVAL);
    }

    Ok(handle)
}

/// Unmount a stale mount left behind by a crashed process.
///
/// Returns Ok(true) if the unmount command succeeded, Ok(false) if the
/// path may already be unmounted.
pub fn unmount_fuse(mount_path: &Path) -> Result<bool> {
    let unmount_result = if cfg!(target_os = "macos") {
        std::process::Command::new("diskutil")
            .arg("unmount")
            .arg("force")
            .arg(mount_path)
            .status()
    } else {
        std::process::Command::new("fusermount")
            .arg("-u")
            .arg(mount_path)
            .status()
    };

    match unmount_result {
        Ok(status) => Ok(status.success()),
        Err(e) => {
            tracing::warn!("Failed to run unmount command: {}", e);
            Ok(false)
        }
    }
}
