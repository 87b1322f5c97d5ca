use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConvergeError, Result};
use crate::vfs::types::RootId;

/// The ordered set of physical roots behind one mount.
///
/// Slot 0 is always the write target. The remaining slots are the read-only
/// virtual folders in registration order; a later registration outranks an
/// earlier one. The list never changes while mounted.
#[derive(Debug, Clone)]
pub struct VirtualFolders {
    roots: Vec<PathBuf>,
}

impl VirtualFolders {
    pub fn new(write_target: PathBuf, folders: Vec<PathBuf>) -> Self {
        let mut roots = Vec::with_capacity(folders.len() + 1);
        roots.push(write_target);
        roots.extend(folders);
        VirtualFolders { roots }
    }

    pub fn write_target(&self) -> &Path {
        &self.roots[0]
    }

    /// Physical directory of a root. Unknown ids fall back to the write target.
    pub fn root_path(&self, root: RootId) -> &Path {
        self.roots
            .get(root.index())
            .map(PathBuf::as_path)
            .unwrap_or_else(|| self.write_target())
    }

    /// Number of roots, the write target included, so never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Read-only roots in registration order.
    pub fn folders(&self) -> &[PathBuf] {
        &self.roots[1..]
    }

    /// Roots from most to least preferred: write target, then the virtual
    /// folders most-recently-registered first.
    pub fn priority_order(&self) -> impl Iterator<Item = RootId> + '_ {
        std::iter::once(RootId::WRITE_TARGET).chain((1..self.roots.len()).rev().map(RootId))
    }

    /// Priority rank of a root; lower is preferred.
    pub fn rank(&self, root: RootId) -> usize {
        if root.is_write_target() {
            0
        } else {
            self.roots.len() - root.index()
        }
    }

    pub fn physical_path(&self, root: RootId, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.root_path(root).to_path_buf()
        } else {
            self.root_path(root).join(relative)
        }
    }

    /// Check every root before mounting. The write target is created when
    /// missing; virtual folders must already exist.
    pub fn prepare(&self) -> Result<()> {
        let write_target = self.write_target();
        if !write_target.exists() {
            fs::create_dir_all(write_target).map_err(|e| {
                ConvergeError::Config(format!(
                    "Failed to create write target {}: {}",
                    write_target.display(),
                    e
                ))
            })?;
        }

        for root in &self.roots {
            if !root.is_dir() {
                return Err(ConvergeError::InvalidRoot(root.clone()));
            }
        }

        let canonical_target = write_target
            .canonicalize()
            .unwrap_or_else(|_| write_target.to_path_buf());
        for folder in self.folders() {
            let canonical = folder.canonicalize().unwrap_or_else(|_| folder.clone());
            if canonical == canonical_target {
                return Err(ConvergeError::Config(format!(
                    "Virtual folder {} is also the write target",
                    folder.display()
                )));
            }
        }

        Ok(())
    }
}
