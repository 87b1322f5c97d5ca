use std::time::SystemTime;

/// Attribute flag bits cached on every node.
pub mod attributes {
    pub const READONLY: u32 = 0x0001;
    pub const HIDDEN: u32 = 0x0002;
    pub const DIRECTORY: u32 = 0x0010;
    pub const ARCHIVE: u32 = 0x0020;
    pub const NORMAL: u32 = 0x0080;
}

/// Stable handle to a node in the tree arena.
///
/// The generation guards against a recycled slot being mistaken for the node
/// that previously lived there; holders of a stale id simply get `None` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeId {
    pub const ROOT: NodeId = NodeId {
        index: 0,
        generation: 0,
    };

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    /// Packs the id into a FUSE inode number. The root maps to inode 1.
    pub fn to_ino(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    pub fn from_ino(ino: u64) -> Option<NodeId> {
        let low = (ino & 0xffff_ffff) as u32;
        if low == 0 {
            return None;
        }
        Some(NodeId {
            index: low - 1,
            generation: (ino >> 32) as u32,
        })
    }
}

/// Index into the virtual folder list. `RootId::WRITE_TARGET` is always the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(pub(crate) usize);

impl RootId {
    pub const WRITE_TARGET: RootId = RootId(0);

    pub fn is_write_target(self) -> bool {
        self == Self::WRITE_TARGET
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Which kind of node a lookup is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Any,
    File,
    Folder,
}

impl EntryKind {
    pub fn accepts(self, is_directory: bool) -> bool {
        match self {
            EntryKind::Any => true,
            EntryKind::File => !is_directory,
            EntryKind::Folder => is_directory,
        }
    }
}

/// Metadata cached on a node so listings never touch the physical roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttrs {
    pub is_directory: bool,
    pub size: u64,
    pub attributes: u32,
    pub mode: u32,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub last_write_time: SystemTime,
}

impl NodeAttrs {
    pub fn directory() -> Self {
        NodeAttrs {
            is_directory: true,
            size: 0,
            attributes: attributes::DIRECTORY,
            mode: 0o755,
            creation_time: SystemTime::UNIX_EPOCH,
            last_access_time: SystemTime::UNIX_EPOCH,
            last_write_time: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.attributes & attributes::READONLY != 0
    }
}

/// How `create_file` treats an existing or missing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Replace if present, create otherwise.
    Supersede,
    /// Fail unless present.
    #[default]
    Open,
    /// Fail if present.
    Create,
    /// Open if present, create otherwise.
    OpenIf,
    /// Truncate if present, fail otherwise.
    Overwrite,
    /// Truncate if present, create otherwise.
    OverwriteIf,
}

impl Disposition {
    pub fn may_create(self) -> bool {
        matches!(
            self,
            Disposition::Supersede
                | Disposition::Create
                | Disposition::OpenIf
                | Disposition::OverwriteIf
        )
    }

    pub fn truncates(self) -> bool {
        matches!(
            self,
            Disposition::Supersede | Disposition::Overwrite | Disposition::OverwriteIf
        )
    }
}

/// Requested access rights for an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub delete: bool,
}

impl Access {
    pub fn read_only() -> Self {
        Access {
            read: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Access {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    pub fn wants_write(&self) -> bool {
        self.write || self.append
    }
}

/// Kernel-level creation options that accompany a create-file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateOptions {
    pub directory_file: bool,
    pub non_directory_file: bool,
    pub delete_on_close: bool,
}

/// Everything the dispatcher hands over for a create-file request.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    pub access: Access,
    pub share_mode: u32,
    pub disposition: Disposition,
    pub options: CreateOptions,
    pub process_id: u32,
}

impl OpenRequest {
    pub fn open_existing(access: Access) -> Self {
        OpenRequest {
            access,
            ..Default::default()
        }
    }

    pub fn create_file(disposition: Disposition) -> Self {
        OpenRequest {
            access: Access::read_write(),
            disposition,
            options: CreateOptions {
                non_directory_file: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn create_directory() -> Self {
        OpenRequest {
            access: Access::read_only(),
            disposition: Disposition::Create,
            options: CreateOptions {
                directory_file: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Open an existing entry for deletion when its last handle closes.
    pub fn delete_on_close(directory: bool) -> Self {
        OpenRequest {
            access: Access {
                delete: true,
                ..Default::default()
            },
            disposition: Disposition::Open,
            options: CreateOptions {
                directory_file: directory,
                non_directory_file: !directory,
                delete_on_close: true,
            },
            ..Default::default()
        }
    }
}

/// One row of an enumeration result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    pub name: String,
    /// Absent for listings that do not come from the union tree.
    pub id: Option<NodeId>,
    pub attrs: NodeAttrs,
}

/// Shape of a path produced by walking from a node to the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle<'a> {
    /// `docs/readme.txt`
    Bare,
    /// `/docs/readme.txt`
    Rooted,
    /// `<prefix>/docs/readme.txt`, for display.
    Namespaced(&'a str),
}
