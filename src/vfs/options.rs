use std::path::PathBuf;

use crate::vfs::async_io::DEFAULT_WORKER_THREADS;

pub const DEFAULT_NAMESPACE_PREFIX: &str = "/convergefs";

/// Construction-time settings. Immutable once mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub write_target: PathBuf,
    /// Read-only roots in registration order; later entries win.
    pub virtual_folders: Vec<PathBuf>,
    pub async_io: bool,
    pub worker_threads: usize,
    pub max_request_contexts: Option<usize>,
    pub max_async_operations: Option<usize>,
    pub namespace_prefix: String,
}

impl MountOptions {
    pub fn new(write_target: impl Into<PathBuf>) -> Self {
        MountOptions {
            write_target: write_target.into(),
            virtual_folders: Vec::new(),
            async_io: true,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_request_contexts: None,
            max_async_operations: None,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
        }
    }

    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.virtual_folders.push(folder.into());
        self
    }

    pub fn with_async_io(mut self, enabled: bool) -> Self {
        self.async_io = enabled;
        self
    }
}
