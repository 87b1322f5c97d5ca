//! The union personality.
//!
//! Paths are resolved through the [`VirtualTree`]; the physical work is
//! delegated to the [`Mirror`] plumbing. New objects always land in the
//! write target; files owned by a read-only folder are copied up before
//! they are opened for writing.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{ConvergeError, Result};
use crate::vfs::async_io::{CompletionSink, IoHooks, IoRequest, Issued};
use crate::vfs::branch::BranchLock;
use crate::vfs::builder::{build_subtree, build_tree, remerge_subtree};
use crate::vfs::context::{OpenInfo, RequestContext};
use crate::vfs::convert::{metadata_to_attrs, OpResult, Status};
use crate::vfs::folders::VirtualFolders;
use crate::vfs::mirror::{
    attrs_of, check_kind, copy_up, copy_up_tree, ensure_dir_chain, file_name, open_physical,
    remove_physical, rename_physical, virtual_relative, Mirror,
};
use crate::vfs::node::{child_key, VirtualNode};
use crate::vfs::operations::{FileHandle, FileSystemOps, OpenedFile};
use crate::vfs::options::MountOptions;
use crate::vfs::pool::PoolStats;
use crate::vfs::tree::{Navigation, VirtualTree};
use crate::vfs::types::{Disposition, EntryKind, FindData, NodeAttrs, NodeId, OpenRequest, PathStyle, RootId};

/// Re-validation rounds for lookups that race with structural changes.
const LOCATE_ATTEMPTS: usize = 16;

/// Keeps cached node metadata in step with completed transfers.
struct NodeCacheHooks {
    tree: Arc<VirtualTree>,
}

impl NodeCacheHooks {
    fn node(&self, context: &RequestContext) -> Option<Arc<VirtualNode>> {
        context.node().and_then(|id| self.tree.node(id))
    }
}

impl IoHooks for NodeCacheHooks {
    fn read_completed(&self, context: &RequestContext, _request: &IoRequest, status: Status) {
        if !status.is_success() {
            return;
        }
        if let Some(node) = self.node(context) {
            node.write().attrs.last_access_time = SystemTime::now();
        }
    }

    fn write_completed(&self, context: &RequestContext, request: &IoRequest, status: Status) {
        if !status.is_success() || request.bytes_transferred == 0 {
            return;
        }
        if let Some(node) = self.node(context) {
            let mut state = node.write();
            let end = request.offset + request.bytes_transferred;
            if end > state.attrs.size {
                state.attrs.size = end;
            }
            let now = SystemTime::now();
            state.attrs.last_write_time = now;
            state.attrs.last_access_time = now;
        }
    }
}

/// One row of [`ConvergenceFs::listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub path: String,
    pub root: RootId,
    pub attrs: NodeAttrs,
}

/// Union filesystem over one write target and any number of read-only
/// virtual folders.
pub struct ConvergenceFs {
    tree: Arc<VirtualTree>,
    mirror: Mirror,
    options: MountOptions,
    mounted: AtomicBool,
}

impl ConvergenceFs {
    pub fn new(options: MountOptions) -> Self {
        let folders = VirtualFolders::new(
            options.write_target.clone(),
            options.virtual_folders.clone(),
        );
        let tree = Arc::new(VirtualTree::new(Arc::new(folders)));
        let hooks = Arc::new(NodeCacheHooks {
            tree: Arc::clone(&tree),
        });
        let mirror = Mirror::with_hooks(options.write_target.clone(), &options, hooks);
        ConvergenceFs {
            tree,
            mirror,
            options,
            mounted: AtomicBool::new(false),
        }
    }

    /// Construct and [`init`](Self::init) in one step.
    pub fn mount(options: MountOptions) -> Result<Self> {
        let fs = Self::new(options);
        fs.init()?;
        Ok(fs)
    }

    /// Check the roots, initialize both pools, start the async workers and
    /// build the union tree. Returns the node count.
    pub fn init(&self) -> Result<usize> {
        if self.is_mounted() {
            return Err(ConvergeError::Mount("already mounted".to_string()));
        }
        self.tree.folders().prepare()?;
        self.mirror.init()?;
        let count = build_tree(&self.tree).map_err(|status| {
            ConvergeError::Mount(format!("building the union tree failed: {}", status))
        })?;
        self.mounted.store(true, Ordering::SeqCst);
        tracing::info!(
            "mounted union of {} roots over {} ({} nodes, async io {})",
            self.tree.folders().len(),
            self.options.write_target.display(),
            count,
            if self.mirror.is_async() { "on" } else { "off" }
        );
        Ok(count)
    }

    /// Stop accepting opens, close what is still open, drain both pools and
    /// drop the tree.
    pub fn unmount(&self) -> Result<()> {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return Err(ConvergeError::NotMounted);
        }
        let closed = self.mirror.shutdown();
        self.tree.clear();
        tracing::info!("unmounted ({} handles were still open)", closed);
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn tree(&self) -> &Arc<VirtualTree> {
        &self.tree
    }

    pub fn folders(&self) -> &Arc<VirtualFolders> {
        self.tree.folders()
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Rebuild the whole tree from the physical roots. Node ids held by
    /// open handles do not survive a rebuild.
    pub fn rebuild(&self) -> OpResult<usize> {
        build_tree(&self.tree)
    }

    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    pub fn open_handles(&self) -> usize {
        self.mirror.open_handles()
    }

    pub fn context_stats(&self) -> PoolStats {
        self.mirror.context_stats()
    }

    pub fn operation_stats(&self) -> Option<PoolStats> {
        self.mirror.operation_stats()
    }

    /// Display path of a node under the configured namespace prefix.
    pub fn namespaced_path(&self, id: NodeId) -> Option<String> {
        self.tree
            .construct_path(id, PathStyle::Namespaced(&self.options.namespace_prefix))
    }

    /// Every node below the root in depth-first name order.
    pub fn listing(&self) -> Vec<ListingEntry> {
        let mut entries = Vec::new();
        let mut pending = Vec::new();
        self.push_children(NodeId::ROOT, &mut pending);

        while let Some((id, root, attrs)) = pending.pop() {
            if let Some(path) = self.tree.construct_path(id, PathStyle::Rooted) {
                entries.push(ListingEntry { path, root, attrs });
            }
            if attrs.is_directory {
                self.push_children(id, &mut pending);
            }
        }
        entries
    }

    fn push_children(&self, id: NodeId, pending: &mut Vec<(NodeId, RootId, NodeAttrs)>) {
        let mut children = Vec::new();
        self.tree.walk_children(id, |node, state| {
            children.push((node.id(), state.root, state.attrs));
            true
        });
        pending.extend(children.into_iter().rev());
    }

    /// Physical location and owning root of a virtual path. A path that is
    /// not in the tree resolves to where it would be created: the write
    /// target.
    pub fn resolve(&self, virtual_path: &str) -> OpResult<(PathBuf, RootId)> {
        let relative = virtual_relative(virtual_path)?;
        let nav = self.tree.navigate(NodeId::ROOT, virtual_path, EntryKind::Any);

        if let Some(id) = nav.node.filter(|id| !id.is_root()) {
            if let (Some(node), Some(physical)) = (self.tree.node(id), self.tree.physical_path(id)) {
                tracing::trace!("resolve: {:?} -> {} (root {})", relative, physical.display(), node.root().index());
                return Ok((physical, node.root()));
            }
        }

        let physical = self
            .tree
            .folders()
            .physical_path(RootId::WRITE_TARGET, &relative);
        tracing::trace!("resolve: {:?} not in tree, -> {}", relative, physical.display());
        Ok((physical, RootId::WRITE_TARGET))
    }

    /// Navigate to `path` with the branch the result hangs off pinned in
    /// shared mode.
    fn locate(&self, path: &str) -> OpResult<(Navigation, BranchLock)> {
        for _ in 0..LOCATE_ATTEMPTS {
            let nav = self.tree.navigate(NodeId::ROOT, path, EntryKind::Any);
            let anchor = nav.node.unwrap_or(nav.last_scanned);
            let branch = match BranchLock::shared(&self.tree, anchor) {
                Ok(branch) => branch,
                Err(Status::ObjectPathNotFound) => continue,
                Err(status) => return Err(status),
            };
            if self.tree.navigate(NodeId::ROOT, path, EntryKind::Any) == nav {
                return Ok((nav, branch));
            }
        }
        Err(Status::Unsuccessful)
    }

    /// Exclusive branch on the current parent of `node`, re-checked after
    /// the locks are held.
    fn lock_parent(&self, node: &VirtualNode) -> OpResult<(NodeId, BranchLock)> {
        for _ in 0..LOCATE_ATTEMPTS {
            let parent = node.parent().ok_or(Status::AccessDenied)?;
            let branch = BranchLock::exclusive(&self.tree, parent)?;
            if self.tree.node(node.id()).is_none() {
                return Err(Status::ObjectNameNotFound);
            }
            if node.parent() == Some(parent) {
                return Ok((parent, branch));
            }
        }
        Err(Status::Unsuccessful)
    }

    /// Exclusive branches on both parents of a move, in the global lock order.
    fn lock_move(&self, node: &VirtualNode, dst_parent_path: &str) -> OpResult<(NodeId, NodeId, BranchLock)> {
        for _ in 0..LOCATE_ATTEMPTS {
            let src_parent = node.parent().ok_or(Status::AccessDenied)?;
            let dst_parent = self
                .tree
                .lookup(dst_parent_path, EntryKind::Folder)
                .ok_or(Status::ObjectPathNotFound)?;
            let branch = BranchLock::exclusive_pair(&self.tree, src_parent, dst_parent)?;

            if self.tree.node(node.id()).is_none() {
                return Err(Status::ObjectNameNotFound);
            }
            if node.parent() == Some(src_parent)
                && self.tree.lookup(dst_parent_path, EntryKind::Folder) == Some(dst_parent)
            {
                return Ok((src_parent, dst_parent, branch));
            }
        }
        Err(Status::Unsuccessful)
    }

    /// Bring a file owned by a read-only folder into the write target and
    /// rebind the node to it.
    fn copy_up_node(&self, node: &VirtualNode, with_content: bool) -> OpResult<()> {
        let (_parent, _branch) = self.lock_parent(node)?;
        let source_root = node.root();
        if source_root.is_write_target() {
            return Ok(());
        }

        let id = node.id();
        let source = self.tree.physical_path(id).ok_or(Status::ObjectNameNotFound)?;
        let relative = self.tree.relative_path(id).ok_or(Status::ObjectNameNotFound)?;
        let folders = self.tree.folders();
        let dest = folders.physical_path(RootId::WRITE_TARGET, &relative);

        copy_up(&source, &dest, folders.write_target(), with_content).map_err(|e| {
            tracing::error!("copy-up of {} failed: {}", source.display(), e);
            Status::from(&e)
        })?;
        let meta = fs::metadata(&dest)?;

        let mut state = node.write();
        state.root = RootId::WRITE_TARGET;
        state.attrs = metadata_to_attrs(&meta, &state.name);
        tracing::info!(
            "copy-up: {:?} from root {} into the write target",
            relative,
            source_root.index()
        );
        Ok(())
    }

    fn open_existing(&self, id: NodeId, request: &OpenRequest) -> OpResult<(fs::File, bool, NodeAttrs)> {
        let node = self.tree.node(id).ok_or(Status::ObjectNameNotFound)?;
        let (is_directory, delete_pending, has_children) = {
            let state = node.read();
            (
                state.attrs.is_directory,
                state.delete_pending,
                !state.children.is_empty(),
            )
        };

        if delete_pending {
            return Err(Status::DeletePending);
        }
        check_kind(is_directory, &request.options)?;
        if request.disposition == Disposition::Create {
            return Err(Status::ObjectNameCollision);
        }
        if request.options.delete_on_close && is_directory && has_children {
            return Err(Status::DirectoryNotEmpty);
        }

        let truncates = request.disposition.truncates();
        if !is_directory
            && !node.root().is_write_target()
            && (request.access.wants_write() || truncates)
        {
            self.copy_up_node(&node, !truncates)?;
        }

        let physical = self.tree.physical_path(id).ok_or(Status::ObjectNameNotFound)?;
        let (file, _) = open_physical(&physical, request, is_directory)?;

        let mut state = node.write();
        if state.delete_pending {
            return Err(Status::DeletePending);
        }
        if truncates {
            state.attrs = attrs_of(&file, &state.name)?;
        }
        state.open_handles += 1;
        if request.options.delete_on_close {
            state.delete_pending = true;
        }
        let attrs = state.attrs;
        Ok((file, is_directory, attrs))
    }

    fn open_new(
        &self,
        nav: &Navigation,
        relative: &std::path::Path,
        request: &OpenRequest,
    ) -> OpResult<(fs::File, NodeId, NodeAttrs)> {
        let parent = nav.attach_point().ok_or(Status::ObjectPathNotFound)?;
        if !request.disposition.may_create() {
            return Err(Status::ObjectNameNotFound);
        }
        let parent_node = self.tree.node(parent).ok_or(Status::ObjectPathNotFound)?;
        if !parent_node.is_directory() {
            return Err(Status::NotADirectory);
        }

        let name = file_name(relative).to_string();
        let is_directory = request.options.directory_file;
        let physical = self
            .tree
            .folders()
            .physical_path(RootId::WRITE_TARGET, relative);
        if let Some(dir) = physical.parent() {
            ensure_dir_chain(dir)?;
        }
        let (file, _) = open_physical(&physical, request, is_directory)?;
        let attrs = attrs_of(&file, &name)?;

        let _branch = BranchLock::exclusive(&self.tree, parent)?;
        let id = match self.tree.child(parent, &name) {
            // Another opener inserted it while we were creating the object.
            Some(existing) => existing,
            None => self
                .tree
                .add_child(parent, &name, attrs, RootId::WRITE_TARGET)?,
        };
        let node = self.tree.node(id).ok_or(Status::ObjectNameNotFound)?;
        let mut state = node.write();
        state.open_handles += 1;
        if request.options.delete_on_close {
            state.delete_pending = true;
        }
        tracing::debug!("create_file: new {:?} in the write target", relative);
        Ok((file, id, state.attrs))
    }

    /// Drop one open reference; the last one applies a pending delete.
    fn release_node(&self, id: NodeId) -> OpResult<()> {
        let Some(node) = self.tree.node(id) else {
            return Ok(());
        };
        let (remaining, delete_pending) = {
            let mut state = node.write();
            state.open_handles = state.open_handles.saturating_sub(1);
            (state.open_handles, state.delete_pending)
        };
        if remaining > 0 || !delete_pending {
            return Ok(());
        }
        self.delete_node(&node)
    }

    /// Remove the physical object behind `node`, detach it and re-probe the
    /// path so a lower-priority copy becomes visible.
    fn delete_node(&self, node: &VirtualNode) -> OpResult<()> {
        let (parent, _branch) = self.lock_parent(node)?;
        let id = node.id();
        let (name, is_directory, has_children) = {
            let state = node.read();
            (
                state.name.clone(),
                state.attrs.is_directory,
                !state.children.is_empty(),
            )
        };

        if has_children {
            node.write().delete_pending = false;
            return Err(Status::DirectoryNotEmpty);
        }

        let physical = self.tree.physical_path(id).ok_or(Status::ObjectNameNotFound)?;
        if let Err(e) = remove_physical(&physical, is_directory) {
            tracing::warn!("delete of {} failed: {}", physical.display(), e);
            node.write().delete_pending = false;
            return Err(Status::from(&e));
        }

        self.tree.detach(id);
        match build_subtree(&self.tree, parent, &name)? {
            Some(fallback) => tracing::debug!(
                "delete: {:?} falls back to root {}",
                name,
                self.tree.node(fallback).map_or(0, |n| n.root().index())
            ),
            None => tracing::debug!("delete: {:?} is gone from every root", name),
        }
        Ok(())
    }

    fn refresh_node(&self, context: &RequestContext, file: &fs::File) -> OpResult<NodeAttrs> {
        match context.node().and_then(|id| self.tree.node(id)) {
            Some(node) => {
                let mut state = node.write();
                state.attrs = attrs_of(file, &state.name)?;
                Ok(state.attrs)
            }
            None => {
                let info = context.info();
                Ok(attrs_of(file, file_name(std::path::Path::new(&info.virtual_path)))?)
            }
        }
    }
}

impl FileSystemOps for ConvergenceFs {
    fn create_file(&self, path: &str, request: &OpenRequest) -> OpResult<OpenedFile> {
        let relative = virtual_relative(path)?;
        tracing::debug!("create_file: {:?} ({:?})", relative, request.disposition);

        let nav = {
            let (nav, _shared) = self.locate(path)?;
            nav
        };

        let (file, node, is_directory, attrs, created) = match nav.node {
            Some(id) => {
                let (file, is_directory, attrs) = self.open_existing(id, request)?;
                (file, id, is_directory, attrs, false)
            }
            None => {
                let (file, id, attrs) = self.open_new(&nav, &relative, request)?;
                (file, id, attrs.is_directory, attrs, true)
            }
        };

        let info = OpenInfo {
            request: request.clone(),
            virtual_path: relative.to_string_lossy().into_owned(),
            is_directory,
            delete_on_close: request.options.delete_on_close,
        };
        let handle = match self.mirror.register(file, info, Some(node)) {
            Ok(handle) => handle,
            Err(status) => {
                if let Some(n) = self.tree.node(node) {
                    let mut state = n.write();
                    state.open_handles = state.open_handles.saturating_sub(1);
                    if request.options.delete_on_close {
                        state.delete_pending = false;
                    }
                }
                return Err(status);
            }
        };

        Ok(OpenedFile {
            handle,
            node: Some(node),
            is_directory,
            attrs,
            created,
        })
    }

    fn cleanup(&self, handle: FileHandle) -> OpResult<()> {
        let context = self.mirror.context(handle)?;
        if !context.mark_cleaned_up() {
            tracing::debug!("cleanup: handle {} already cleaned up", handle);
        }
        Ok(())
    }

    fn close_file(&self, handle: FileHandle) -> OpResult<()> {
        let context = self.mirror.take(handle)?;
        context.mark_closed();
        let node = context.node();
        self.mirror.release(context);

        match node {
            Some(id) => self.release_node(id),
            None => Ok(()),
        }
    }

    fn read_file(&self, handle: FileHandle, request: IoRequest, sink: &Arc<dyn CompletionSink>) -> Issued {
        match self.mirror.context(handle) {
            Ok(context) => self.mirror.read(&context, request, sink),
            Err(status) => Issued::Completed(request, status),
        }
    }

    fn write_file(&self, handle: FileHandle, request: IoRequest, sink: &Arc<dyn CompletionSink>) -> Issued {
        let context = match self.mirror.context(handle) {
            Ok(context) => context,
            Err(status) => return Issued::Completed(request, status),
        };
        let opened_with = context.info().request;
        if !opened_with.access.wants_write() && !opened_with.disposition.may_create() {
            return Issued::Completed(request, Status::AccessDenied);
        }
        self.mirror.write(&context, request, sink)
    }

    fn flush_file_buffers(&self, handle: FileHandle) -> OpResult<()> {
        let context = self.mirror.context(handle)?;
        let file = context.handle()?;
        file.sync_all()?;
        self.refresh_node(&context, &file)?;
        Ok(())
    }

    fn get_file_information(&self, handle: FileHandle) -> OpResult<NodeAttrs> {
        let context = self.mirror.context(handle)?;
        let file = context.handle()?;
        self.refresh_node(&context, &file)
    }

    fn set_end_of_file(&self, handle: FileHandle, length: u64) -> OpResult<()> {
        let context = self.mirror.context(handle)?;
        if context.info().is_directory {
            return Err(Status::FileIsADirectory);
        }
        let file = context.handle()?;
        file.set_len(length)?;
        self.refresh_node(&context, &file)?;
        Ok(())
    }

    fn find_files(&self, handle: FileHandle) -> OpResult<Vec<FindData>> {
        let context = self.mirror.context(handle)?;
        if !context.info().is_directory {
            return Err(Status::NotADirectory);
        }
        let id = context.node().ok_or(Status::InvalidHandle)?;

        let _branch = BranchLock::shared(&self.tree, id)?;
        let mut found = Vec::new();
        self.tree.walk_children(id, |node, state| {
            found.push(FindData {
                name: state.name.clone(),
                id: Some(node.id()),
                attrs: state.attrs,
            });
            true
        });
        Ok(found)
    }

    fn move_file(&self, handle: FileHandle, new_path: &str, replace_if_exists: bool) -> OpResult<()> {
        let context = self.mirror.context(handle)?;
        let id = context.node().ok_or(Status::InvalidHandle)?;
        let node = self.tree.node(id).ok_or(Status::ObjectNameNotFound)?;

        let destination = virtual_relative(new_path)?;
        let dst_name = file_name(&destination).to_string();
        if dst_name.is_empty() {
            return Err(Status::InvalidParameter);
        }
        let dst_parent_path = destination
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (src_parent, dst_parent, _branch) = self.lock_move(&node, &dst_parent_path)?;

        // A directory cannot move below itself.
        if self.tree.walk_to_root(dst_parent, |n, _| n.id() != id) == Some(id) {
            return Err(Status::InvalidParameter);
        }

        let (src_name, is_directory, src_root) = {
            let state = node.read();
            (state.name.clone(), state.attrs.is_directory, state.root)
        };
        let folders = self.tree.folders();
        let src_physical = self.tree.physical_path(id).ok_or(Status::ObjectNameNotFound)?;
        let dst_physical = folders.physical_path(RootId::WRITE_TARGET, &destination);
        let same_entry = src_parent == dst_parent && child_key(&src_name) == child_key(&dst_name);
        let existing = self.tree.child(dst_parent, &dst_name).filter(|dst| *dst != id);

        if let Some(dst) = existing {
            if !replace_if_exists {
                return Err(Status::ObjectNameCollision);
            }
            let dst_node = self.tree.node(dst).ok_or(Status::ObjectNameNotFound)?;
            if is_directory || dst_node.is_directory() {
                return Err(Status::AccessDenied);
            }
        }

        if let Some(dir) = dst_physical.parent() {
            ensure_dir_chain(dir)?;
        }
        if src_root.is_write_target() {
            rename_physical(&src_physical, &dst_physical, existing.is_some() || same_entry)?;
        } else {
            // Read-only roots are never modified: the entry is copied into
            // the write target under its new name and the original stays.
            let copied = if is_directory {
                copy_up_tree(&src_physical, &dst_physical)
            } else {
                copy_up(&src_physical, &dst_physical, folders.write_target(), true)
            };
            copied.map_err(|e| {
                tracing::error!("move: copy-up of {} failed: {}", src_physical.display(), e);
                Status::from(&e)
            })?;
        }
        let meta = fs::metadata(&dst_physical)?;

        // The node keeps its id, so every open handle stays bound to it. A
        // replaced destination node is released by the relocation.
        self.tree.relocate(id, dst_parent, &dst_name)?;
        {
            let mut state = node.write();
            state.root = RootId::WRITE_TARGET;
            state.attrs = metadata_to_attrs(&meta, &dst_name);
        }
        if is_directory {
            // Entries other roots contributed under the old path stay there.
            remerge_subtree(&self.tree, id)?;
        }
        if !same_entry {
            build_subtree(&self.tree, src_parent, &src_name)?;
        }

        context.set_virtual_path(destination.to_string_lossy().into_owned());
        tracing::debug!("move_file: {:?} -> {:?}", src_name, destination);
        Ok(())
    }
}
