use glob::{MatchOptions, Pattern};
use std::sync::Arc;

use crate::vfs::async_io::{CompletionSink, Issued, IoRequest};
use crate::vfs::convert::{OpResult, Status};
use crate::vfs::types::{FindData, NodeAttrs, NodeId, OpenRequest};

/// Dispatcher-visible handle number, one per successful `create_file`.
pub type FileHandle = u64;

/// What a successful `create_file` hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFile {
    pub handle: FileHandle,
    pub node: Option<NodeId>,
    pub is_directory: bool,
    pub attrs: NodeAttrs,
    /// A new physical object was created.
    pub created: bool,
}

const PATTERN_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// The operation set every filesystem personality provides.
pub trait FileSystemOps: Send + Sync {
    fn create_file(&self, path: &str, request: &OpenRequest) -> OpResult<OpenedFile>;

    /// The last user reference to the handle went away.
    fn cleanup(&self, handle: FileHandle) -> OpResult<()>;

    /// The handle is released. Delete-on-close is applied here.
    fn close_file(&self, handle: FileHandle) -> OpResult<()>;

    fn read_file(
        &self,
        handle: FileHandle,
        request: IoRequest,
        sink: &Arc<dyn CompletionSink>,
    ) -> Issued;

    fn write_file(
        &self,
        handle: FileHandle,
        request: IoRequest,
        sink: &Arc<dyn CompletionSink>,
    ) -> Issued;

    fn flush_file_buffers(&self, handle: FileHandle) -> OpResult<()>;

    fn get_file_information(&self, handle: FileHandle) -> OpResult<NodeAttrs>;

    fn set_end_of_file(&self, handle: FileHandle, length: u64) -> OpResult<()>;

    fn find_files(&self, handle: FileHandle) -> OpResult<Vec<FindData>>;

    /// `find_files` filtered by a case-insensitive glob.
    fn find_files_with_pattern(&self, handle: FileHandle, pattern: &str) -> OpResult<Vec<FindData>> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            tracing::debug!("find_files_with_pattern: bad pattern {:?}: {}", pattern, e);
            Status::InvalidParameter
        })?;
        Ok(self
            .find_files(handle)?
            .into_iter()
            .filter(|entry| pattern.matches_with(&entry.name, PATTERN_OPTIONS))
            .collect())
    }

    fn move_file(&self, handle: FileHandle, new_path: &str, replace_if_exists: bool) -> OpResult<()>;

    fn delete_file(&self, path: &str) -> OpResult<()> {
        delete_via_close(self, path, false)
    }

    fn delete_directory(&self, path: &str) -> OpResult<()> {
        delete_via_close(self, path, true)
    }
}

fn delete_via_close<F: FileSystemOps + ?Sized>(fs: &F, path: &str, directory: bool) -> OpResult<()> {
    let opened = fs.create_file(path, &OpenRequest::delete_on_close(directory))?;
    let cleaned = fs.cleanup(opened.handle);
    let closed = fs.close_file(opened.handle);
    cleaned.and(closed)
}
