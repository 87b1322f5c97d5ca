use fxhash::FxHashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::vfs::branch::BranchLock;
use crate::vfs::convert::{metadata_to_attrs, OpResult, Status};
use crate::vfs::folders::VirtualFolders;
use crate::vfs::node::child_key;
use crate::vfs::tree::VirtualTree;
use crate::vfs::types::{NodeAttrs, NodeId, PathStyle, RootId};

/// Rebuild the whole union tree from the physical roots.
///
/// Roots are merged in priority order (write target, then the newest virtual
/// folder first), one directory level at a time, so the pending work never
/// holds more than a single level of the tree. Returns the live node count.
pub fn build_tree(tree: &VirtualTree) -> OpResult<usize> {
    let _guard = BranchLock::exclusive(tree, NodeId::ROOT)?;

    tree.clear();
    if let Ok(meta) = fs::metadata(tree.folders().write_target()) {
        tree.root().write().attrs = metadata_to_attrs(&meta, "");
    }

    let added = merge_levels(tree, vec![(NodeId::ROOT, PathBuf::new())])?;
    let count = tree.node_count();
    tracing::info!(
        "build_tree: merged {} entries from {} roots ({} nodes)",
        added,
        tree.folders().len(),
        count
    );
    Ok(count)
}

/// Re-merge a single virtual entry `parent/name` across all roots.
///
/// The highest priority root holding a physical object at that path wins;
/// when no root has one, any existing node is removed. The caller holds an
/// exclusive branch lock on `parent`.
pub fn build_subtree(tree: &VirtualTree, parent: NodeId, name: &str) -> OpResult<Option<NodeId>> {
    let parent_rel = tree
        .relative_path(parent)
        .ok_or(Status::ObjectPathNotFound)?;
    let relative = parent_rel.join(name);

    let folders = tree.folders();
    let winner = folders.priority_order().find_map(|root| {
        let physical = folders.physical_path(root, &relative);
        fs::metadata(&physical).ok().map(|meta| (root, meta))
    });

    let Some((root, meta)) = winner else {
        if tree.remove_child(parent, name).is_some() {
            tracing::debug!("build_subtree: {:?} no longer exists in any root", relative);
        }
        return Ok(None);
    };

    let attrs = metadata_to_attrs(&meta, name);
    let id = tree.add_child(parent, name, attrs, root)?;
    if attrs.is_directory {
        merge_levels(tree, vec![(id, relative.clone())])?;
    }
    tracing::debug!(
        "build_subtree: {:?} now owned by root {}",
        relative,
        root.index()
    );
    Ok(Some(id))
}

/// Breadth-first merge: for each directory on the current level, scan that
/// relative path in every root and add entries not claimed by a more
/// preferred root.
fn merge_levels(tree: &VirtualTree, mut level: Vec<(NodeId, PathBuf)>) -> OpResult<usize> {
    let mut added = 0;

    while !level.is_empty() {
        let mut next = Vec::new();

        for (dir, relative) in level {
            for (name, attrs, root) in merged_entries(tree.folders(), &relative) {
                let id = tree.add_child(dir, &name, attrs, root)?;
                added += 1;
                if attrs.is_directory {
                    next.push((id, relative.join(&name)));
                }
            }
        }

        level = next;
    }

    Ok(added)
}

/// Winning entry per name for one virtual directory, scanning the roots in
/// priority order.
fn merged_entries(folders: &VirtualFolders, relative: &Path) -> Vec<(String, NodeAttrs, RootId)> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut entries = Vec::new();

    for root in folders.priority_order() {
        let physical = folders.physical_path(root, relative);
        for (name, attrs) in scan_directory(&physical) {
            if !seen.insert(child_key(&name)) {
                tracing::trace!(
                    "merge: {:?} in root {} shadowed by a preferred root",
                    relative.join(&name),
                    root.index()
                );
                continue;
            }
            entries.push((name, attrs, root));
        }
    }
    entries
}

/// Re-merge everything below directory `id` against its current path.
///
/// Entries that still resolve keep their node ids (and with them the open
/// handle counts and pending deletes of their handles); vanished entries are
/// dropped and new ones added. Used after a directory moved. The caller
/// holds an exclusive branch lock covering `id`. Returns the number of
/// nodes that were kept.
pub fn remerge_subtree(tree: &VirtualTree, id: NodeId) -> OpResult<usize> {
    let mut kept = 0;
    let mut pending = vec![id];

    while let Some(dir) = pending.pop() {
        let relative = tree.relative_path(dir).ok_or(Status::ObjectPathNotFound)?;
        let merged = merged_entries(tree.folders(), &relative);

        let wanted: FxHashSet<String> = merged.iter().map(|(name, _, _)| child_key(name)).collect();
        let stale: Vec<String> = tree
            .node(dir)
            .ok_or(Status::ObjectPathNotFound)?
            .read()
            .children
            .keys()
            .filter(|key| !wanted.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            tracing::trace!("remerge: {:?} no longer resolves", relative.join(&key));
            tree.remove_child(dir, &key);
        }

        for (name, attrs, root) in merged {
            let existing = tree.child(dir, &name).and_then(|child| tree.node(child));
            match existing {
                Some(node) if node.is_directory() == attrs.is_directory => {
                    {
                        let mut state = node.write();
                        state.name = name;
                        state.attrs = attrs;
                        state.root = root;
                    }
                    kept += 1;
                    if attrs.is_directory {
                        pending.push(node.id());
                    }
                }
                _ => {
                    let child = tree.add_child(dir, &name, attrs, root)?;
                    if attrs.is_directory {
                        merge_levels(tree, vec![(child, relative.join(&name))])?;
                    }
                }
            }
        }
    }

    tracing::debug!("remerge: kept {} nodes below {:?}", kept, id);
    Ok(kept)
}

/// Entries of one physical directory. Unreadable directories and entries
/// are skipped with a warning rather than failing the whole build.
fn scan_directory(path: &Path) -> Vec<(String, NodeAttrs)> {
    if !path.is_dir() {
        return Vec::new();
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("merge: cannot read {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut result = Vec::new();
    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!("merge: skipping non UTF-8 name {:?} in {}", raw, path.display());
                continue;
            }
        };
        match fs::metadata(entry.path()) {
            Ok(meta) => result.push((name.clone(), metadata_to_attrs(&meta, &name))),
            Err(e) => tracing::warn!("merge: cannot stat {}: {}", entry.path().display(), e),
        }
    }
    result
}

/// Owning root of every node, keyed by path. Used to compare two builds.
pub fn ownership_map(tree: &VirtualTree) -> Vec<(String, RootId)> {
    let mut out = Vec::new();
    let mut pending = vec![NodeId::ROOT];
    while let Some(id) = pending.pop() {
        let mut children = Vec::new();
        tree.walk_children(id, |node, state| {
            children.push((node.id(), state.root, state.attrs.is_directory));
            true
        });
        for (child, root, is_directory) in children {
            if let Some(path) = tree.construct_path(child, PathStyle::Bare) {
                out.push((path, root));
            }
            if is_directory {
                pending.push(child);
            }
        }
    }
    out.sort();
    out
}
