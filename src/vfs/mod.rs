pub mod async_io;
pub mod branch;
pub mod builder;
pub mod context;
pub mod convergence;
mod convert;
pub mod folders;
pub mod fuse;
pub mod mirror;
pub mod mount;
pub mod node;
pub mod operations;
pub mod options;
pub mod pool;
pub mod tree;
pub mod types;

pub use async_io::{AsyncIo, CompletionSink, IoHooks, IoRequest, Issued};
pub use convergence::{ConvergenceFs, ListingEntry};
pub use convert::{OpResult, Status};
pub use fuse::ConvergenceFuse;
pub use mirror::Mirror;
pub use mount::{mount_fuse, unmount_fuse, MountHandle};
pub use operations::{FileHandle, FileSystemOps, OpenedFile};
pub use options::MountOptions;
pub use pool::{ObjectPool, PoolStats};
pub use tree::VirtualTree;
pub use types::{
    Access, CreateOptions, Disposition, EntryKind, FindData, NodeAttrs, NodeId, OpenRequest,
    PathStyle, RootId,
};
