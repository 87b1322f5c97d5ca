//! Kernel bridge: translates FUSE callbacks into [`FileSystemOps`] calls on
//! a [`ConvergenceFs`].
//!
//! Inode numbers are packed [`NodeId`]s, so the tree needs no separate inode
//! table. Reads and writes that go to the async workers park their reply in
//! a token map; the completion sink answers the kernel from the worker.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::vfs::async_io::{CompletionSink, IoRequest, Issued};
use crate::vfs::convergence::ConvergenceFs;
use crate::vfs::convert::{attrs_to_fileattr, OpResult, Status};
use crate::vfs::operations::{FileHandle, FileSystemOps, OpenedFile};
use crate::vfs::types::{Access, CreateOptions, Disposition, NodeAttrs, NodeId, OpenRequest, PathStyle};

/// Linux `renameat2` flag; the value is the same on macOS for `RENAME_EXCL`.
const RENAME_NOREPLACE: u32 = 1;

/// A kernel reply waiting for an async transfer to finish.
enum PendingReply {
    Read(ReplyData),
    Write(ReplyWrite),
}

impl PendingReply {
    fn answer(self, request: IoRequest, status: Status) {
        match (self, status) {
            (PendingReply::Read(reply), Status::Success) => {
                let n = (request.bytes_transferred as usize).min(request.buffer.len());
                reply.data(&request.buffer[..n]);
            }
            (PendingReply::Write(reply), Status::Success) => {
                reply.written(request.bytes_transferred as u32);
            }
            (PendingReply::Read(reply), status) => reply.error(status.errno()),
            (PendingReply::Write(reply), status) => reply.error(status.errno()),
        }
    }
}

/// Completion sink that routes finished transfers back to their kernel reply.
#[derive(Default)]
struct FuseCompletions {
    pending: DashMap<u64, PendingReply>,
}

impl CompletionSink for FuseCompletions {
    fn complete(&self, request: IoRequest, status: Status) {
        match self.pending.remove(&request.token) {
            Some((_, reply)) => reply.answer(request, status),
            None => tracing::warn!("completion for unknown token {}", request.token),
        }
    }
}

/// Map POSIX open flags onto an open request.
pub(crate) fn open_request(flags: i32, creating: bool) -> OpenRequest {
    let access = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => Access {
            write: true,
            ..Default::default()
        },
        libc::O_RDWR => Access::read_write(),
        _ => Access::read_only(),
    };
    let access = Access {
        append: flags & libc::O_APPEND != 0,
        ..access
    };

    let truncate = flags & libc::O_TRUNC != 0;
    let disposition = match (creating, flags & libc::O_EXCL != 0, truncate) {
        (true, true, _) => Disposition::Create,
        (true, false, true) => Disposition::OverwriteIf,
        (true, false, false) => Disposition::OpenIf,
        (false, _, true) => Disposition::Overwrite,
        (false, _, false) => Disposition::Open,
    };

    OpenRequest {
        access,
        disposition,
        options: CreateOptions {
            non_directory_file: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn open_directory_request() -> OpenRequest {
    OpenRequest {
        access: Access::read_only(),
        disposition: Disposition::Open,
        options: CreateOptions {
            directory_file: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct ConvergenceFuse {
    fs: Arc<ConvergenceFs>,
    ttl: Duration,
    uid: u32,
    gid: u32,
    completions: Arc<FuseCompletions>,
    sink: Arc<dyn CompletionSink>,
    next_token: u64,
}

impl ConvergenceFuse {
    pub fn new(fs: Arc<ConvergenceFs>, ttl_secs: u64) -> Self {
        let completions = Arc::new(FuseCompletions::default());
        let sink: Arc<dyn CompletionSink> = completions.clone();
        // SAFETY: getuid/getgid cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        ConvergenceFuse {
            fs,
            ttl: Duration::from_secs(ttl_secs),
            uid,
            gid,
            completions,
            sink,
            next_token: 0,
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }

    fn file_attr(&self, attrs: &NodeAttrs, ino: u64) -> FileAttr {
        attrs_to_fileattr(attrs, ino, self.uid, self.gid)
    }

    /// Attributes of a live node. Nodes waiting for their delete are hidden
    /// from lookups but still answer `getattr` for open handles.
    fn node_attr(&self, id: NodeId, include_pending: bool) -> Option<FileAttr> {
        let node = self.fs.tree().node(id)?;
        let state = node.read();
        if state.delete_pending && !include_pending {
            return None;
        }
        Some(self.file_attr(&state.attrs, id.to_ino()))
    }

    fn opened_attr(&self, opened: &OpenedFile) -> FileAttr {
        let ino = opened.node.map_or(0, NodeId::to_ino);
        self.file_attr(&opened.attrs, ino)
    }

    fn path_of(&self, ino: u64) -> Result<String, libc::c_int> {
        let id = NodeId::from_ino(ino).ok_or(libc::ENOENT)?;
        self.fs
            .tree()
            .construct_path(id, PathStyle::Rooted)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let base = self.path_of(parent)?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), name))
    }

    /// Cleanup and close in one step, reporting the first failure.
    fn close(&self, handle: FileHandle) -> OpResult<()> {
        let cleaned = self.fs.cleanup(handle);
        let closed = self.fs.close_file(handle);
        cleaned.and(closed)
    }

    /// Apply the creation mode to a freshly created object.
    fn apply_mode(&self, path: &str, mode: u32) {
        let Ok((physical, _)) = self.fs.resolve(path) else {
            return;
        };
        if let Err(e) = fs::set_permissions(&physical, fs::Permissions::from_mode(mode & 0o7777)) {
            tracing::debug!("chmod {:o} on {} failed: {}", mode, physical.display(), e);
        }
    }

    /// Change permission bits. A file owned by a read-only folder is copied
    /// up first; such directories cannot change.
    fn chmod(&self, path: &str, ino: u64, mode: u32) -> OpResult<()> {
        let (_, root) = self.fs.resolve(path)?;
        if !root.is_write_target() {
            let opened = self
                .fs
                .create_file(path, &OpenRequest::open_existing(Access::read_write()))?;
            self.close(opened.handle)?;
        }
        let (physical, root) = self.fs.resolve(path)?;
        if !root.is_write_target() {
            return Err(Status::AccessDenied);
        }

        fs::set_permissions(&physical, fs::Permissions::from_mode(mode & 0o7777))?;
        let meta = fs::metadata(&physical)?;
        if let Some(node) = NodeId::from_ino(ino).and_then(|id| self.fs.tree().node(id)) {
            node.write().attrs.mode = meta.mode() & 0o7777;
        }
        Ok(())
    }

    /// Answer an issued transfer: either it already finished or the sink
    /// will answer from a worker.
    fn settle(&self, token: u64, issued: Issued) {
        if let Issued::Completed(request, status) = issued {
            if let Some((_, reply)) = self.completions.pending.remove(&token) {
                reply.answer(request, status);
            }
        }
    }
}

impl Filesystem for ConvergenceFuse {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        if !self.fs.is_mounted() {
            if let Err(e) = self.fs.init() {
                tracing::error!("union init failed: {}", e);
                return Err(libc::EIO);
            }
        }
        tracing::info!("convergefs FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("convergefs FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (Some(parent_id), Some(name)) = (NodeId::from_ino(parent), name.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        tracing::trace!("lookup(parent={}, name={:?})", parent, name);

        match self
            .fs
            .tree()
            .child(parent_id, name)
            .and_then(|id| self.node_attr(id, false))
        {
            Some(attr) => reply.entry(&self.ttl, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        if let Some(fh) = fh {
            match self.fs.get_file_information(fh) {
                Ok(attrs) => {
                    reply.attr(&self.ttl, &self.file_attr(&attrs, ino));
                    return;
                }
                Err(status) => tracing::trace!("getattr: handle {} unusable: {}", fh, status),
            }
        }

        match NodeId::from_ino(ino).and_then(|id| self.node_attr(id, true)) {
            Some(attr) => reply.attr(&self.ttl, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!("setattr(ino={}, size={:?}, mode={:?})", ino, size, mode);
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Some(length) = size {
            let result = match fh {
                Some(fh) => self.fs.set_end_of_file(fh, length),
                None => self
                    .fs
                    .create_file(&path, &OpenRequest::open_existing(Access::read_write()))
                    .and_then(|opened| {
                        let resized = self.fs.set_end_of_file(opened.handle, length);
                        resized.and(self.close(opened.handle))
                    }),
            };
            if let Err(status) = result {
                reply.error(status.errno());
                return;
            }
        }

        if let Some(mode) = mode {
            if let Err(status) = self.chmod(&path, ino, mode) {
                reply.error(status.errno());
                return;
            }
        }

        match NodeId::from_ino(ino).and_then(|id| self.node_attr(id, true)) {
            Some(attr) => reply.attr(&self.ttl, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        tracing::debug!("mkdir({})", path);

        match self.fs.create_file(&path, &OpenRequest::create_directory()) {
            Ok(opened) => {
                self.apply_mode(&path, mode & !umask);
                let attr = self.opened_attr(&opened);
                if let Err(status) = self.close(opened.handle) {
                    tracing::warn!("mkdir: closing {} failed: {}", path, status);
                }
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(status) => reply.error(status.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.child_path(parent, name) {
            Ok(path) => match self.fs.delete_file(&path) {
                Ok(()) => reply.ok(),
                Err(status) => reply.error(status.errno()),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.child_path(parent, name) {
            Ok(path) => match self.fs.delete_directory(&path) {
                Ok(()) => reply.ok(),
                Err(status) => reply.error(status.errno()),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (source, destination) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(source), Ok(destination)) => (source, destination),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };
        tracing::debug!("rename({} -> {}, flags={:#x})", source, destination, flags);

        let request = OpenRequest::open_existing(Access {
            delete: true,
            ..Default::default()
        });
        let opened = match self.fs.create_file(&source, &request) {
            Ok(opened) => opened,
            Err(status) => {
                reply.error(status.errno());
                return;
            }
        };
        let replace = flags & RENAME_NOREPLACE == 0;
        let moved = self.fs.move_file(opened.handle, &destination, replace);
        let closed = self.close(opened.handle);

        match moved.and(closed) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.create_file(&path, &open_request(flags, false)) {
            Ok(opened) => reply.opened(opened.handle, 0),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        tracing::debug!("create({}, flags={:#x})", path, flags);

        match self.fs.create_file(&path, &open_request(flags, true)) {
            Ok(opened) => {
                if opened.created {
                    self.apply_mode(&path, mode & !umask);
                }
                let attr = self.opened_attr(&opened);
                reply.created(&self.ttl, &attr, 0, opened.handle, flags as u32);
            }
            Err(status) => reply.error(status.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let token = self.token();
        self.completions.pending.insert(token, PendingReply::Read(reply));
        let request = IoRequest::read(token, offset as u64, size as usize);
        let issued = self.fs.read_file(fh, request, &self.sink);
        self.settle(token, issued);
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let token = self.token();
        self.completions.pending.insert(token, PendingReply::Write(reply));
        let request = IoRequest::write(token, offset as u64, data.to_vec());
        let issued = self.fs.write_file(fh, request, &self.sink);
        self.settle(token, issued);
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush_file_buffers(fh) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.flush_file_buffers(fh) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        tracing::debug!("release(ino={}, fh={})", ino, fh);
        match self.close(fh) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.create_file(&path, &open_directory_request()) {
            Ok(opened) => reply.opened(opened.handle, 0),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::trace!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let found = match self.fs.find_files(fh) {
            Ok(found) => found,
            Err(status) => {
                reply.error(status.errno());
                return;
            }
        };

        let parent_ino = NodeId::from_ino(ino)
            .and_then(|id| self.fs.tree().node(id))
            .and_then(|node| node.parent())
            .map_or(ino, NodeId::to_ino);

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        entries.extend(found.into_iter().filter_map(|entry| {
            let kind = if entry.attrs.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entry.id.map(|id| (id.to_ino(), kind, entry.name))
        }));

        for (idx, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (idx + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.close(fh) {
            Ok(()) => reply.ok(),
            Err(status) => reply.error(status.errno()),
        }
    }
}
