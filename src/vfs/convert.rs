use fuser::{FileAttr, FileType};
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::prelude::MetadataExt;
use std::time::UNIX_EPOCH;

use crate::vfs::types::{attributes, NodeAttrs};

/// Status codes reported back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Pending,
    ObjectNameNotFound,
    ObjectPathNotFound,
    ObjectNameCollision,
    FileIsADirectory,
    NotADirectory,
    DirectoryNotEmpty,
    AccessDenied,
    InvalidHandle,
    InvalidParameter,
    MemoryNotAllocated,
    DeletePending,
    Unsuccessful,
    /// A native error code with no closer translation.
    Io(i32),
}

pub type OpResult<T> = std::result::Result<T, Status>;

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Errno equivalent for the FUSE reply path.
    pub fn errno(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Pending => libc::EINPROGRESS,
            Status::ObjectNameNotFound => libc::ENOENT,
            Status::ObjectPathNotFound => libc::ENOENT,
            Status::ObjectNameCollision => libc::EEXIST,
            Status::FileIsADirectory => libc::EISDIR,
            Status::NotADirectory => libc::ENOTDIR,
            Status::DirectoryNotEmpty => libc::ENOTEMPTY,
            Status::AccessDenied => libc::EACCES,
            Status::InvalidHandle => libc::EBADF,
            Status::InvalidParameter => libc::EINVAL,
            Status::MemoryNotAllocated => libc::ENOMEM,
            Status::DeletePending => libc::ENOENT,
            Status::Unsuccessful => libc::EIO,
            Status::Io(code) => code,
        }
    }

    fn from_errno(code: i32) -> Status {
        match code {
            libc::ENOENT => Status::ObjectNameNotFound,
            libc::ENOTDIR => Status::NotADirectory,
            libc::EISDIR => Status::FileIsADirectory,
            libc::EEXIST => Status::ObjectNameCollision,
            libc::ENOTEMPTY => Status::DirectoryNotEmpty,
            libc::EACCES | libc::EPERM | libc::EROFS => Status::AccessDenied,
            libc::EBADF => Status::InvalidHandle,
            libc::EINVAL => Status::InvalidParameter,
            libc::ENOMEM => Status::MemoryNotAllocated,
            other => Status::Io(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Io(code) => write!(f, "Io({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<&io::Error> for Status {
    /// Map a native error into the status taxonomy.
    /// The raw OS code is preferred; the `ErrorKind` is only a fallback.
    fn from(e: &io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            return Status::from_errno(code);
        }

        match e.kind() {
            io::ErrorKind::NotFound => Status::ObjectNameNotFound,
            io::ErrorKind::PermissionDenied => Status::AccessDenied,
            io::ErrorKind::AlreadyExists => Status::ObjectNameCollision,
            io::ErrorKind::InvalidInput => Status::InvalidParameter,
            io::ErrorKind::InvalidData => Status::InvalidParameter,
            io::ErrorKind::OutOfMemory => Status::MemoryNotAllocated,
            io::ErrorKind::Unsupported => Status::Io(libc::ENOTSUP),
            io::ErrorKind::TimedOut => Status::Io(libc::ETIMEDOUT),
            io::ErrorKind::Interrupted => Status::Io(libc::EINTR),
            io::ErrorKind::WriteZero => Status::Io(libc::ENOSPC),
            io::ErrorKind::BrokenPipe => Status::Io(libc::EPIPE),
            io::ErrorKind::WouldBlock => Status::Io(libc::EAGAIN),
            _ => Status::Unsuccessful,
        }
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        Status::from(&e)
    }
}

/// Build the cached node metadata from a physical stat result.
pub(crate) fn metadata_to_attrs(meta: &Metadata, name: &str) -> NodeAttrs {
    let is_directory = meta.is_dir();

    let mut flags = 0;
    if is_directory {
        flags |= attributes::DIRECTORY;
    }
    if meta.permissions().readonly() {
        flags |= attributes::READONLY;
    }
    if name.starts_with('.') {
        flags |= attributes::HIDDEN;
    }
    if flags == 0 {
        flags = attributes::NORMAL;
    }

    NodeAttrs {
        is_directory,
        size: if is_directory { 0 } else { meta.len() },
        attributes: flags,
        mode: meta.mode() & 0o7777,
        creation_time: meta.created().unwrap_or(UNIX_EPOCH),
        last_access_time: meta.accessed().unwrap_or(UNIX_EPOCH),
        last_write_time: meta.modified().unwrap_or(UNIX_EPOCH),
    }
}

/// Kernel-facing attributes for a node. Ownership is reported as the
/// mounting user since the roots may belong to anyone.
pub(crate) fn attrs_to_fileattr(attrs: &NodeAttrs, ino: u64, uid: u32, gid: u32) -> FileAttr {
    let kind = if attrs.is_directory {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: attrs.last_access_time,
        mtime: attrs.last_write_time,
        ctime: attrs.last_write_time,
        crtime: attrs.creation_time,
        kind,
        perm: (attrs.mode & 0o7777) as u16,
        nlink: if attrs.is_directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}
