use crate::error::{ConvergeError, Result};
use crate::vfs::options::{MountOptions, DEFAULT_NAMESPACE_PREFIX};
use crate::vfs::async_io::DEFAULT_WORKER_THREADS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::paths::expand_tilde;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncIoConfig {
    #[serde(default = "super::default_async_io_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

impl Default for AsyncIoConfig {
    fn default() -> Self {
        Self {
            enabled: super::default_async_io_enabled(),
            worker_threads: None,
        }
    }
}

impl AsyncIoConfig {
    pub fn get_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_contexts: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_async_operations: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_prefix: Option<String>,
}

impl MountConfig {
    pub fn get_fuse_ttl_secs(&self) -> u64 {
        self.fuse_ttl_secs
            .unwrap_or_else(super::default_fuse_ttl_secs)
    }

    pub fn get_fs_name(&self) -> String {
        self.fs_name.clone().unwrap_or_else(super::default_fs_name)
    }

    pub fn get_namespace_prefix(&self) -> String {
        self.namespace_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE_PREFIX.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_target: Option<String>,
    /// Read-only roots in registration order; later entries take priority.
    #[serde(default)]
    pub virtual_folders: Vec<String>,
    #[serde(default)]
    pub async_io: AsyncIoConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub mount: MountConfig,
}

impl Config {
    pub fn write_target_path(&self) -> Option<PathBuf> {
        self.write_target.as_deref().map(expand_tilde)
    }

    pub fn virtual_folder_paths(&self) -> Vec<PathBuf> {
        self.virtual_folders
            .iter()
            .map(|folder| expand_tilde(folder))
            .collect()
    }

    /// Construction-time options for the union. Call after `validate_config`.
    pub fn to_mount_options(&self) -> Result<MountOptions> {
        let write_target = self
            .write_target_path()
            .ok_or_else(|| ConvergeError::Config("No write target configured".to_string()))?;

        let mut options = MountOptions::new(write_target).with_async_io(self.async_io.enabled);
        options.virtual_folders = self.virtual_folder_paths();
        options.worker_threads = self.async_io.get_worker_threads();
        options.max_request_contexts = self.pools.max_request_contexts;
        options.max_async_operations = self.pools.max_async_operations;
        options.namespace_prefix = self.mount.get_namespace_prefix();
        Ok(options)
    }
}

/// Reject configurations the union cannot be built from. A missing write
/// target directory is fine (it is created at mount); a missing virtual
/// folder is not.
pub fn validate_config(config: &Config) -> Result<()> {
    let write_target = config.write_target_path().ok_or_else(|| {
        ConvergeError::Config(
            "No write target configured (set write_target or pass --write-target)".to_string(),
        )
    })?;

    if write_target.exists() && !write_target.is_dir() {
        return Err(ConvergeError::InvalidRoot(write_target));
    }

    let canonical_target = write_target
        .canonicalize()
        .unwrap_or_else(|_| write_target.clone());
    for folder in config.virtual_folder_paths() {
        if !folder.is_dir() {
            return Err(ConvergeError::InvalidRoot(folder));
        }
        let canonical = folder.canonicalize().unwrap_or_else(|_| folder.clone());
        if canonical == canonical_target {
            return Err(ConvergeError::Config(format!(
                "Virtual folder {} is also the write target",
                folder.display()
            )));
        }
    }

    if config.async_io.worker_threads == Some(0) {
        return Err(ConvergeError::Config(
            "async_io.worker_threads must be at least 1".to_string(),
        ));
    }

    if config.pools.max_request_contexts == Some(0) {
        tracing::warn!("pools.max_request_contexts is 0; every open will fail");
    }

    Ok(())
}
