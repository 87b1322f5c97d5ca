//! Passthrough personality and the physical plumbing shared with the
//! union personality: handle table, context pool, async subsystem and the
//! helpers that touch the physical roots.

use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(target_os = "macos")]
use std::ffi::CString;

use crate::error::{ConvergeError, Result};
use crate::vfs::async_io::{read_sync, write_sync, AsyncIo, CompletionSink, IoHooks, IoRequest, Issued, NoHooks};
use crate::vfs::context::{CompletionChannels, OpenInfo, RequestContext, RequestContextPool};
use crate::vfs::convert::{metadata_to_attrs, OpResult, Status};
use crate::vfs::operations::{FileHandle, FileSystemOps, OpenedFile};
use crate::vfs::options::MountOptions;
use crate::vfs::pool::PoolStats;
use crate::vfs::tree::split_components;
use crate::vfs::types::{CreateOptions, Disposition, FindData, NodeAttrs, NodeId, OpenRequest};

/// Turn a virtual path into a path relative to a root. `..` never escapes.
pub fn virtual_relative(path: &str) -> OpResult<PathBuf> {
    let mut relative = PathBuf::new();
    for component in split_components(path) {
        match Path::new(component).components().next() {
            Some(Component::Normal(_)) => relative.push(component),
            _ => return Err(Status::InvalidParameter),
        }
    }
    Ok(relative)
}

/// Reject a file request on a directory and a directory request on a file.
pub(crate) fn check_kind(is_directory: bool, options: &CreateOptions) -> OpResult<()> {
    if is_directory && options.non_directory_file {
        return Err(Status::FileIsADirectory);
    }
    if !is_directory && options.directory_file {
        return Err(Status::NotADirectory);
    }
    Ok(())
}

/// Open (or create) the physical object behind a request. Returns the
/// handle and whether a new object was created.
pub(crate) fn open_physical(
    path: &Path,
    request: &OpenRequest,
    directory: bool,
) -> io::Result<(File, bool)> {
    let disposition = request.disposition;

    if directory {
        let mut created = false;
        if disposition.may_create() {
            match fs::create_dir(path) {
                Ok(()) => created = true,
                Err(e)
                    if e.kind() == io::ErrorKind::AlreadyExists
                        && disposition != Disposition::Create => {}
                Err(e) => return Err(e),
            }
        }
        return File::open(path).map(|file| (file, created));
    }

    let existed = fs::symlink_metadata(path).is_ok();
    let access = request.access;
    let mut options = OpenOptions::new();
    options
        .read(access.read || !access.wants_write())
        .write(access.wants_write() || disposition.may_create() || disposition.truncates());
    match disposition {
        Disposition::Supersede | Disposition::OverwriteIf => {
            options.create(true).truncate(true);
        }
        Disposition::Create => {
            options.create_new(true);
        }
        Disposition::OpenIf => {
            options.create(true);
        }
        Disposition::Overwrite => {
            options.truncate(true);
        }
        Disposition::Open => {}
    }

    let file = options.open(path)?;
    Ok((file, !existed))
}

/// Create every missing directory up to and including `dir`. Directories
/// that already exist count as success.
pub(crate) fn ensure_dir_chain(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(target_os = "macos")]
fn clone_file_optimized(src: &Path, dest: &Path) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let src_cstr = CString::new(src.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    let dest_cstr = CString::new(dest.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

    // SAFETY: both paths are null-terminated CStrings that outlive the call.
    unsafe {
        if libc::clonefile(src_cstr.as_ptr(), dest_cstr.as_ptr(), 0) == 0 {
            return Ok(());
        }
    }
    fs::copy(src, dest)?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn clone_file_optimized(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest)?;
    Ok(())
}

/// Copy a file from a read-only root into the write target at `dest`.
///
/// Missing ancestors of `dest` below `base` are created first. When
/// `with_content` is false only an empty file is created. On failure
/// everything this call created is removed again.
pub(crate) fn copy_up(src: &Path, dest: &Path, base: &Path, with_content: bool) -> io::Result<()> {
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    if let Some(parent_dir) = dest.parent() {
        let mut dirs_to_create: Vec<PathBuf> = Vec::new();
        let mut current = parent_dir.to_path_buf();
        while !current.exists() && current.starts_with(base) {
            dirs_to_create.push(current.clone());
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        for dir in dirs_to_create.iter().rev() {
            match fs::create_dir(dir) {
                Ok(()) => created_dirs.push(dir.clone()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    remove_created(&created_dirs);
                    return Err(e);
                }
            }
        }
    }

    let copied = if with_content {
        clone_file_optimized(src, dest).and_then(|()| make_owner_writable(dest))
    } else {
        File::create(dest).map(|_| ())
    };

    if let Err(e) = copied {
        let _ = fs::remove_file(dest);
        remove_created(&created_dirs);
        return Err(e);
    }
    Ok(())
}

/// Copy a whole directory from a read-only root into the write target at
/// `dest`, creating missing ancestors. Files keep their content.
pub(crate) fn copy_up_tree(src: &Path, dest: &Path) -> io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        ensure_dir_chain(&to)?;
        for entry in fs::read_dir(&from)? {
            let entry = entry?;
            let target = to.join(entry.file_name());
            if entry.path().is_dir() {
                pending.push((entry.path(), target));
            } else {
                clone_file_optimized(&entry.path(), &target)?;
                make_owner_writable(&target)?;
            }
        }
    }
    Ok(())
}

fn make_owner_writable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.mode() & 0o200 == 0 {
        perms.set_mode(perms.mode() | 0o200);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn remove_created(dirs: &[PathBuf]) {
    for dir in dirs.iter().rev() {
        let _ = fs::remove_dir(dir);
    }
}

/// Remove a physical object. An object that is already gone is not an error.
pub(crate) fn remove_physical(path: &Path, is_directory: bool) -> io::Result<()> {
    let removed = if is_directory {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("remove: {} was already gone", path.display());
            Ok(())
        }
        other => other,
    }
}

pub(crate) fn rename_physical(src: &Path, dst: &Path, replace: bool) -> io::Result<()> {
    if !replace && fs::symlink_metadata(dst).is_ok() {
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    fs::rename(src, dst)
}

pub(crate) fn attrs_of(file: &File, name: &str) -> io::Result<NodeAttrs> {
    file.metadata().map(|meta| metadata_to_attrs(&meta, name))
}

pub(crate) fn file_name(relative: &Path) -> &str {
    relative.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Thin passthrough over one physical root. The union personality reuses
/// its handle table, pools and I/O paths.
pub struct Mirror {
    root: PathBuf,
    contexts: RequestContextPool,
    async_io: Option<AsyncIo>,
    hooks: Arc<dyn IoHooks>,
    open: DashMap<FileHandle, Arc<RequestContext>>,
    next_handle: AtomicU64,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>, options: &MountOptions) -> Self {
        Self::with_hooks(root, options, Arc::new(NoHooks))
    }

    pub fn with_hooks(root: impl Into<PathBuf>, options: &MountOptions, hooks: Arc<dyn IoHooks>) -> Self {
        let async_io = options.async_io.then(|| {
            AsyncIo::new(
                Arc::clone(&hooks),
                options.worker_threads,
                options.max_async_operations,
            )
        });
        Mirror {
            root: root.into(),
            contexts: RequestContextPool::new(options.max_request_contexts),
            async_io,
            hooks,
            open: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initialize the context pool and start the async workers if enabled.
    pub fn init(&self) -> Result<()> {
        if !self.contexts.init() {
            return Err(ConvergeError::Mount(
                "request-context pool already initialized".to_string(),
            ));
        }
        if let Some(io) = &self.async_io {
            io.start()?;
        }
        Ok(())
    }

    /// Refuse new opens, release every outstanding handle, then drain both
    /// pools. Returns the number of handles that were still open.
    pub fn shutdown(&self) -> usize {
        self.contexts.begin_unmount();

        let handles: Vec<FileHandle> = self.open.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for handle in handles {
            if let Some((_, context)) = self.open.remove(&handle) {
                context.mark_closed();
                self.release(context);
                closed += 1;
            }
        }

        let contexts = self.contexts.cleanup();
        let operations = self.async_io.as_ref().map_or(0, AsyncIo::shutdown);
        tracing::info!(
            "shutdown: closed {} open handles, released {} request contexts and {} operation contexts",
            closed,
            contexts,
            operations
        );
        closed
    }

    pub fn is_async(&self) -> bool {
        self.async_io.as_ref().is_some_and(AsyncIo::is_running)
    }

    fn channels(&self) -> Option<&dyn CompletionChannels> {
        self.async_io
            .as_ref()
            .map(|io| io as &dyn CompletionChannels)
    }

    /// Bind an opened physical handle to a pooled context and publish it.
    pub fn register(&self, file: File, info: OpenInfo, node: Option<NodeId>) -> OpResult<FileHandle> {
        let Some(context) = self.contexts.pop(file, self.channels()) else {
            return Err(if self.contexts.is_unmounting() {
                Status::Unsuccessful
            } else {
                Status::MemoryNotAllocated
            });
        };
        context.set_info(info);
        context.set_node(node);

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open.insert(handle, context);
        Ok(handle)
    }

    pub fn context(&self, handle: FileHandle) -> OpResult<Arc<RequestContext>> {
        self.open
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Status::InvalidHandle)
    }

    /// Remove a handle from the table; the caller must `release` it.
    pub fn take(&self, handle: FileHandle) -> OpResult<Arc<RequestContext>> {
        self.open
            .remove(&handle)
            .map(|(_, context)| context)
            .ok_or(Status::InvalidHandle)
    }

    /// Return a context to the pool. Waits for in-flight async operations.
    pub fn release(&self, context: Arc<RequestContext>) {
        self.contexts.push(context, self.channels());
    }

    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    pub fn context_stats(&self) -> PoolStats {
        self.contexts.stats()
    }

    pub fn operation_stats(&self) -> Option<PoolStats> {
        self.async_io.as_ref().map(AsyncIo::operation_stats)
    }

    pub fn read(
        &self,
        context: &Arc<RequestContext>,
        mut request: IoRequest,
        sink: &Arc<dyn CompletionSink>,
    ) -> Issued {
        match &self.async_io {
            Some(io) if io.is_running() => io.read_async(context, request, Arc::clone(sink)),
            _ => {
                let status = read_sync(context, &mut request, self.hooks.as_ref());
                Issued::Completed(request, status)
            }
        }
    }

    pub fn write(
        &self,
        context: &Arc<RequestContext>,
        mut request: IoRequest,
        sink: &Arc<dyn CompletionSink>,
    ) -> Issued {
        match &self.async_io {
            Some(io) if io.is_running() => io.write_async(context, request, Arc::clone(sink)),
            _ => {
                let status = write_sync(context, &mut request, self.hooks.as_ref());
                Issued::Completed(request, status)
            }
        }
    }

    fn physical(&self, virtual_path: &str) -> PathBuf {
        self.root.join(virtual_path)
    }
}

impl FileSystemOps for Mirror {
    fn create_file(&self, path: &str, request: &OpenRequest) -> OpResult<OpenedFile> {
        let relative = virtual_relative(path)?;
        let physical = self.root.join(&relative);
        tracing::debug!("mirror create_file: {:?} ({:?})", relative, request.disposition);

        let existing = fs::metadata(&physical).ok();
        let is_directory = existing
            .as_ref()
            .map_or(request.options.directory_file, |meta| meta.is_dir());
        check_kind(is_directory, &request.options)?;

        match &existing {
            Some(_) if request.disposition == Disposition::Create => {
                return Err(Status::ObjectNameCollision)
            }
            None if !request.disposition.may_create() => return Err(Status::ObjectNameNotFound),
            None if !physical.parent().is_some_and(Path::is_dir) => {
                return Err(Status::ObjectPathNotFound)
            }
            _ => {}
        }

        if request.options.delete_on_close && is_directory && existing.is_some() {
            let mut entries = fs::read_dir(&physical)?;
            if entries.next().is_some() {
                return Err(Status::DirectoryNotEmpty);
            }
        }

        let (file, created) = open_physical(&physical, request, is_directory)?;
        let attrs = attrs_of(&file, file_name(&relative))?;
        let info = OpenInfo {
            request: request.clone(),
            virtual_path: relative.to_string_lossy().into_owned(),
            is_directory,
            delete_on_close: request.options.delete_on_close,
        };
        let handle = self.register(file, info, None)?;

        Ok(OpenedFile {
            handle,
            node: None,
            is_directory,
            attrs,
            created,
        })
    }

    fn cleanup(&self, handle: FileHandle) -> OpResult<()> {
        let context = self.context(handle)?;
        if !context.mark_cleaned_up() {
            tracing::debug!("mirror cleanup: handle {} already cleaned up", handle);
        }
        Ok(())
    }

    fn close_file(&self, handle: FileHandle) -> OpResult<()> {
        let context = self.take(handle)?;
        context.mark_closed();
        let info = context.info();
        self.release(context);

        if info.delete_on_close {
            remove_physical(&self.physical(&info.virtual_path), info.is_directory)?;
            tracing::debug!("mirror close_file: deleted {:?}", info.virtual_path);
        }
        Ok(())
    }

    fn read_file(&self, handle: FileHandle, request: IoRequest, sink: &Arc<dyn CompletionSink>) -> Issued {
        match self.context(handle) {
            Ok(context) => self.read(&context, request, sink),
            Err(status) => Issued::Completed(request, status),
        }
    }

    fn write_file(&self, handle: FileHandle, request: IoRequest, sink: &Arc<dyn CompletionSink>) -> Issued {
        match self.context(handle) {
            Ok(context) => self.write(&context, request, sink),
            Err(status) => Issued::Completed(request, status),
        }
    }

    fn flush_file_buffers(&self, handle: FileHandle) -> OpResult<()> {
        self.context(handle)?.handle()?.sync_all()?;
        Ok(())
    }

    fn get_file_information(&self, handle: FileHandle) -> OpResult<NodeAttrs> {
        let context = self.context(handle)?;
        let info = context.info();
        let file = context.handle()?;
        Ok(attrs_of(&file, file_name(Path::new(&info.virtual_path)))?)
    }

    fn set_end_of_file(&self, handle: FileHandle, length: u64) -> OpResult<()> {
        let context = self.context(handle)?;
        if context.info().is_directory {
            return Err(Status::FileIsADirectory);
        }
        context.handle()?.set_len(length)?;
        Ok(())
    }

    fn find_files(&self, handle: FileHandle) -> OpResult<Vec<FindData>> {
        let context = self.context(handle)?;
        let info = context.info();
        if !info.is_directory {
            return Err(Status::NotADirectory);
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(self.physical(&info.virtual_path))?.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Ok(meta) = entry.metadata() {
                found.push(FindData {
                    attrs: metadata_to_attrs(&meta, &name),
                    name,
                    id: None,
                });
            }
        }
        found.sort_by_key(|entry| entry.name.to_lowercase());
        Ok(found)
    }

    fn move_file(&self, handle: FileHandle, new_path: &str, replace_if_exists: bool) -> OpResult<()> {
        let context = self.context(handle)?;
        let destination = virtual_relative(new_path)?;
        if destination.as_os_str().is_empty() {
            return Err(Status::InvalidParameter);
        }
        let source = self.physical(&context.info().virtual_path);
        rename_physical(&source, &self.root.join(&destination), replace_if_exists)?;
        context.set_virtual_path(destination.to_string_lossy().into_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::types::Access;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelSink(Mutex<mpsc::Sender<(IoRequest, Status)>>);

    impl CompletionSink for ChannelSink {
        fn complete(&self, request: IoRequest, status: Status) {
            let _ = self.0.lock().send((request, status));
        }
    }

    fn finish(issued: Issued, rx: &mpsc::Receiver<(IoRequest, Status)>) -> (IoRequest, Status) {
        match issued {
            Issued::Completed(request, status) => (request, status),
            Issued::Pending => rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        }
    }

    fn mirror(async_io: bool) -> (tempfile::TempDir, Mirror) {
        let dir = tempfile::tempdir().unwrap();
        let options = MountOptions::new(dir.path()).with_async_io(async_io);
        let mirror = Mirror::new(dir.path(), &options);
        mirror.init().unwrap();
        (dir, mirror)
    }

    #[test]
    fn test_virtual_relative_rejects_parent_components() {
        assert_eq!(
            virtual_relative("/docs\\readme.txt").unwrap(),
            PathBuf::from("docs/readme.txt")
        );
        assert_eq!(virtual_relative("docs/../etc"), Err(Status::InvalidParameter));
    }

    #[test]
    fn test_copy_up_creates_ancestors_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("lower/a/b.txt");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"lower").unwrap();
        let mut perms = fs::metadata(&src).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&src, perms).unwrap();

        let base = dir.path().join("upper");
        fs::create_dir(&base).unwrap();
        let dest = base.join("a/b.txt");
        copy_up(&src, &dest, &base, true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"lower");
        assert!(!fs::metadata(&dest).unwrap().permissions().readonly());

        let empty = base.join("c/d/e.txt");
        copy_up(&src, &empty, &base, false).unwrap();
        assert_eq!(fs::metadata(&empty).unwrap().len(), 0);
    }

    #[test]
    fn test_open_physical_dispositions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");

        let open = OpenRequest::open_existing(Access::read_only());
        assert!(open_physical(&path, &open, false).is_err());

        let (_, created) =
            open_physical(&path, &OpenRequest::create_file(Disposition::Create), false).unwrap();
        assert!(created);
        let err = open_physical(&path, &OpenRequest::create_file(Disposition::Create), false)
            .unwrap_err();
        assert_eq!(Status::from(&err), Status::ObjectNameCollision);

        fs::write(&path, b"abc").unwrap();
        let (_, created) =
            open_physical(&path, &OpenRequest::create_file(Disposition::OverwriteIf), false)
                .unwrap();
        assert!(!created);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_mirror_sync_create_write_list_move_delete() {
        let (dir, mirror) = mirror(false);
        fs::create_dir(dir.path().join("docs")).unwrap();
        let (tx, rx) = mpsc::channel();
        let sink: Arc<dyn CompletionSink> = Arc::new(ChannelSink(Mutex::new(tx)));

        let opened = mirror
            .create_file("docs/a.txt", &OpenRequest::create_file(Disposition::Create))
            .unwrap();
        assert!(opened.created);
        let (done, status) = finish(
            mirror.write_file(opened.handle, IoRequest::write(1, 0, b"abc".to_vec()), &sink),
            &rx,
        );
        assert_eq!(status, Status::Success);
        assert_eq!(done.bytes_transferred, 3);
        mirror.close_file(opened.handle).unwrap();

        let listing = mirror
            .create_file("docs", &OpenRequest::open_existing(Access::read_only()))
            .unwrap();
        assert!(listing.is_directory);
        let names: Vec<String> = mirror
            .find_files_with_pattern(listing.handle, "*.TXT")
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["a.txt"]);
        mirror.close_file(listing.handle).unwrap();

        let opened = mirror
            .create_file("docs/a.txt", &OpenRequest::open_existing(Access::read_write()))
            .unwrap();
        mirror.move_file(opened.handle, "docs/b.txt", false).unwrap();
        mirror.close_file(opened.handle).unwrap();
        assert!(dir.path().join("docs/b.txt").exists());

        mirror.delete_file("docs/b.txt").unwrap();
        assert!(!dir.path().join("docs/b.txt").exists());
        assert_eq!(mirror.open_handles(), 0);
    }

    #[test]
    fn test_mirror_async_read() {
        let (dir, mirror) = mirror(true);
        fs::write(dir.path().join("f.bin"), b"payload").unwrap();
        let (tx, rx) = mpsc::channel();
        let sink: Arc<dyn CompletionSink> = Arc::new(ChannelSink(Mutex::new(tx)));

        let opened = mirror
            .create_file("f.bin", &OpenRequest::open_existing(Access::read_only()))
            .unwrap();
        let issued = mirror.read_file(opened.handle, IoRequest::read(9, 3, 16), &sink);
        assert!(matches!(issued, Issued::Pending));
        let (done, status) = finish(issued, &rx);
        assert_eq!(status, Status::Success);
        assert_eq!(done.buffer, b"load");

        mirror.close_file(opened.handle).unwrap();
        assert_eq!(mirror.shutdown(), 0);
        assert_eq!(mirror.context_stats(), PoolStats::default());
    }

    #[test]
    fn test_file_information_and_truncate() {
        let (dir, mirror) = mirror(false);
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/info.txt"), b"0123456789").unwrap();

        let opened = mirror
            .create_file("docs/info.txt", &OpenRequest::open_existing(Access::read_write()))
            .unwrap();
        let info = mirror.get_file_information(opened.handle).unwrap();
        assert_eq!(info.size, 10);
        assert!(!info.is_directory);

        mirror.set_end_of_file(opened.handle, 4).unwrap();
        assert_eq!(mirror.get_file_information(opened.handle).unwrap().size, 4);
        mirror.close_file(opened.handle).unwrap();
        assert_eq!(fs::read(dir.path().join("docs/info.txt")).unwrap(), b"0123");
    }

    #[test]
    fn test_kind_mismatch_and_directory_not_empty() {
        let (dir, mirror) = mirror(false);
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/x"), b"").unwrap();

        let err = mirror
            .create_file("d", &OpenRequest::create_file(Disposition::OpenIf))
            .unwrap_err();
        assert_eq!(err, Status::FileIsADirectory);
        assert_eq!(mirror.delete_directory("d"), Err(Status::DirectoryNotEmpty));
        assert_eq!(mirror.delete_directory("d/x"), Err(Status::NotADirectory));
    }

    #[test]
    fn test_shutdown_closes_outstanding_handles() {
        let (dir, mirror) = mirror(true);
        fs::write(dir.path().join("f"), b"x").unwrap();
        mirror
            .create_file("f", &OpenRequest::open_existing(Access::read_only()))
            .unwrap();

        assert_eq!(mirror.shutdown(), 1);
        assert_eq!(mirror.open_handles(), 0);
        assert!(mirror
            .create_file("f", &OpenRequest::open_existing(Access::read_only()))
            .is_err());
    }
}
