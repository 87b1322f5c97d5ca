use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::vfs::convert::{metadata_to_attrs, OpResult, Status};
use crate::vfs::folders::VirtualFolders;
use crate::vfs::node::{child_key, NodeArena, NodeState, VirtualNode};
use crate::vfs::types::{EntryKind, NodeAttrs, NodeId, PathStyle, RootId};

/// Upper bound for walks so a corrupted parent chain cannot spin forever.
const MAX_DEPTH: usize = 4096;

/// Split a virtual path into components. Both separators are accepted,
/// surrounding quotes are stripped and empty or `.` components are skipped.
pub fn split_components(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .map(|c| c.trim_matches('"'))
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

/// Outcome of [`VirtualTree::navigate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Navigation {
    /// The node the path names, if it exists and has the requested kind.
    pub node: Option<NodeId>,
    /// Deepest node that was successfully scanned on the way down.
    pub last_scanned: NodeId,
    /// Number of trailing components that did not resolve.
    pub unresolved: usize,
    /// The final component exists but has the wrong kind.
    pub kind_mismatch: bool,
}

impl Navigation {
    /// Where a new entry for the missing final component should attach.
    /// Only a miss on the last component has a usable parent.
    pub fn attach_point(&self) -> Option<NodeId> {
        if self.node.is_none() && self.unresolved == 1 {
            Some(self.last_scanned)
        } else {
            None
        }
    }
}

/// The in-memory merged namespace.
pub struct VirtualTree {
    arena: NodeArena,
    root: Arc<VirtualNode>,
    folders: Arc<VirtualFolders>,
}

impl VirtualTree {
    pub fn new(folders: Arc<VirtualFolders>) -> Self {
        let arena = NodeArena::new();
        let attrs = fs::metadata(folders.write_target())
            .map(|m| metadata_to_attrs(&m, ""))
            .unwrap_or_else(|_| NodeAttrs::directory());
        let root = arena.alloc(String::new(), attrs, RootId::WRITE_TARGET, None);
        VirtualTree {
            arena,
            root,
            folders,
        }
    }

    pub fn folders(&self) -> &Arc<VirtualFolders> {
        &self.folders
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<VirtualNode>> {
        self.arena.get(id)
    }

    pub fn root(&self) -> Arc<VirtualNode> {
        Arc::clone(&self.root)
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.arena.live()
    }

    /// Walk `path` component by component starting at `start`.
    pub fn navigate(&self, start: NodeId, path: &str, kind: EntryKind) -> Navigation {
        let components = split_components(path);
        let mut current = start;

        for (i, component) in components.iter().enumerate() {
            let next = self
                .arena
                .get(current)
                .and_then(|node| node.read().child(component));
            match next.and_then(|id| self.arena.get(id)) {
                Some(child) => current = child.id(),
                None => {
                    tracing::trace!(
                        "navigate: {:?} missing below {:?} ({} unresolved)",
                        component,
                        current,
                        components.len() - i
                    );
                    return Navigation {
                        node: None,
                        last_scanned: current,
                        unresolved: components.len() - i,
                        kind_mismatch: false,
                    };
                }
            }
        }

        let Some(node) = self.arena.get(current) else {
            return Navigation {
                node: None,
                last_scanned: start,
                unresolved: components.len(),
                kind_mismatch: false,
            };
        };

        let state = node.read();
        if kind.accepts(state.attrs.is_directory) {
            Navigation {
                node: Some(current),
                last_scanned: state.parent.unwrap_or(current),
                unresolved: 0,
                kind_mismatch: false,
            }
        } else {
            Navigation {
                node: None,
                last_scanned: state.parent.unwrap_or(current),
                unresolved: 0,
                kind_mismatch: true,
            }
        }
    }

    pub fn lookup(&self, path: &str, kind: EntryKind) -> Option<NodeId> {
        self.navigate(NodeId::ROOT, path, kind).node
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let id = self.arena.get(parent)?.read().child(name)?;
        self.arena.get(id).map(|n| n.id())
    }

    /// Insert or replace a child. The caller must hold an exclusive branch
    /// lock on `parent` (or on an ancestor of it).
    pub fn add_child(
        &self,
        parent: NodeId,
        name: &str,
        attrs: NodeAttrs,
        root: RootId,
    ) -> OpResult<NodeId> {
        let parent_node = self.arena.get(parent).ok_or(Status::ObjectPathNotFound)?;
        if !parent_node.is_directory() {
            return Err(Status::NotADirectory);
        }

        let child = self.arena.alloc(name.to_string(), attrs, root, Some(parent));
        let replaced = parent_node
            .write()
            .children
            .insert(child_key(name), child.id());

        if let Some(old) = replaced {
            tracing::trace!("add_child: {:?} replaced existing node {:?}", name, old);
            self.free_subtree(old);
        }
        Ok(child.id())
    }

    /// Erase a child and release its whole subtree. Same locking contract
    /// as [`VirtualTree::add_child`].
    pub fn remove_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let parent_node = self.arena.get(parent)?;
        let removed = parent_node.write().children.remove(&child_key(name))?;
        self.free_subtree(removed);
        Some(removed)
    }

    /// Detach a node from whatever parent currently holds it.
    pub fn detach(&self, id: NodeId) -> bool {
        let Some(node) = self.arena.get(id) else {
            return false;
        };
        let (parent, name) = {
            let state = node.read();
            match state.parent {
                Some(parent) => (parent, state.name.clone()),
                None => return false,
            }
        };
        drop(node);
        if self.child(parent, &name) != Some(id) {
            return false;
        }
        self.remove_child(parent, &name).is_some()
    }

    /// Move a node under `new_parent` as `new_name`, keeping its id. Any
    /// existing entry with that name is replaced. The caller holds exclusive
    /// branch locks on both parents.
    pub fn relocate(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> OpResult<()> {
        let node = self.arena.get(id).ok_or(Status::ObjectNameNotFound)?;
        let target = self
            .arena
            .get(new_parent)
            .ok_or(Status::ObjectPathNotFound)?;
        if !target.is_directory() {
            return Err(Status::NotADirectory);
        }

        let (old_parent, old_name) = {
            let state = node.read();
            (state.parent.ok_or(Status::AccessDenied)?, state.name.clone())
        };

        if let Some(old_parent_node) = self.arena.get(old_parent) {
            old_parent_node.write().children.remove(&child_key(&old_name));
        }

        {
            let mut state = node.write();
            state.parent = Some(new_parent);
            state.name = new_name.to_string();
        }

        let replaced = target.write().children.insert(child_key(new_name), id);
        if let Some(old) = replaced.filter(|old| *old != id) {
            self.free_subtree(old);
        }
        Ok(())
    }

    /// Drop every node below the root.
    pub fn clear(&self) {
        let children: Vec<NodeId> = {
            let root = self.root();
            let mut state = root.write();
            std::mem::take(&mut state.children).into_values().collect()
        };
        for child in children {
            self.free_subtree(child);
        }
    }

    fn free_subtree(&self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(node) = self.arena.get(current) {
                pending.extend(node.write().children.values().copied());
            }
            self.arena.free(current);
        }
    }

    /// Visit `start` and its ancestors up to the root. The visitor returns
    /// `false` to stop; the node where the walk stopped is returned (the root
    /// when the walk ran to completion).
    pub fn walk_to_root<F>(&self, start: NodeId, mut visitor: F) -> Option<NodeId>
    where
        F: FnMut(&VirtualNode, &NodeState) -> bool,
    {
        let mut current = self.arena.get(start)?;
        for _ in 0..MAX_DEPTH {
            let parent = {
                let state = current.read();
                if !visitor(&current, &state) {
                    return Some(current.id());
                }
                state.parent
            };
            match parent.and_then(|p| self.arena.get(p)) {
                Some(next) => current = next,
                None => return Some(current.id()),
            }
        }
        tracing::warn!("walk_to_root: depth limit reached from {:?}", start);
        Some(current.id())
    }

    /// Visit the direct children of `id` in name order. Returns the child
    /// where the visitor stopped, or `None` if every child was visited.
    pub fn walk_children<F>(&self, id: NodeId, mut visitor: F) -> Option<NodeId>
    where
        F: FnMut(&VirtualNode, &NodeState) -> bool,
    {
        let children: Vec<NodeId> = self
            .arena
            .get(id)?
            .read()
            .children
            .values()
            .copied()
            .collect();

        for child_id in children {
            let Some(child) = self.arena.get(child_id) else {
                continue;
            };
            let keep_going = {
                let state = child.read();
                visitor(&child, &state)
            };
            if !keep_going {
                return Some(child_id);
            }
        }
        None
    }

    /// Number of edges between `id` and the root.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        self.walk_to_root(id, |_, state| {
            if state.parent.is_some() {
                depth += 1;
            }
            true
        });
        depth
    }

    /// Build the path of `id` by concatenating ancestor names.
    pub fn construct_path(&self, id: NodeId, style: PathStyle<'_>) -> Option<String> {
        let mut names = Vec::new();
        let stopped = self.walk_to_root(id, |_, state| {
            if state.parent.is_some() {
                names.push(state.name.clone());
            }
            true
        })?;
        if !stopped.is_root() {
            // Detached fragment: the chain never reached the root.
            return None;
        }
        names.reverse();
        let bare = names.join("/");

        Some(match style {
            PathStyle::Bare => bare,
            PathStyle::Rooted => format!("/{}", bare),
            PathStyle::Namespaced(prefix) => {
                format!("{}/{}", prefix.trim_end_matches(['/', '\\']), bare)
            }
        })
    }

    /// Path relative to any root, suitable for joining onto a root directory.
    pub fn relative_path(&self, id: NodeId) -> Option<PathBuf> {
        self.construct_path(id, PathStyle::Bare).map(PathBuf::from)
    }

    /// Physical path of the node inside its owning root.
    pub fn physical_path(&self, id: NodeId) -> Option<PathBuf> {
        let root = self.arena.get(id)?.root();
        let relative = self.relative_path(id)?;
        Some(self.folders.physical_path(root, &relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn file_attrs(size: u64) -> NodeAttrs {
        NodeAttrs {
            is_directory: false,
            size,
            ..NodeAttrs::directory()
        }
    }

    fn tree() -> VirtualTree {
        let folders = VirtualFolders::new(PathBuf::from("/w"), vec![PathBuf::from("/a")]);
        VirtualTree::new(Arc::new(folders))
    }

    #[test]
    fn test_split_components_strips_quotes_and_separators() {
        assert_eq!(
            split_components("\\\"docs\"/./readme.txt/"),
            vec!["docs", "readme.txt"]
        );
        assert!(split_components("/").is_empty());
    }

    #[test]
    fn test_navigate_found_and_missing() {
        let tree = tree();
        let docs = tree
            .add_child(NodeId::ROOT, "Docs", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let readme = tree
            .add_child(docs, "readme.txt", file_attrs(5), RootId(1))
            .unwrap();

        let nav = tree.navigate(NodeId::ROOT, "docs/README.txt", EntryKind::Any);
        assert_eq!(nav.node, Some(readme));
        assert_eq!(nav.last_scanned, docs);

        let nav = tree.navigate(NodeId::ROOT, "docs/new.txt", EntryKind::Any);
        assert_eq!(nav.node, None);
        assert_eq!(nav.attach_point(), Some(docs));

        let nav = tree.navigate(NodeId::ROOT, "missing/new.txt", EntryKind::Any);
        assert_eq!(nav.unresolved, 2);
        assert_eq!(nav.attach_point(), None);
    }

    #[test]
    fn test_navigate_kind_mismatch() {
        let tree = tree();
        let docs = tree
            .add_child(NodeId::ROOT, "docs", NodeAttrs::directory(), RootId(1))
            .unwrap();

        let nav = tree.navigate(NodeId::ROOT, "docs", EntryKind::File);
        assert_eq!(nav.node, None);
        assert!(nav.kind_mismatch);
        assert_eq!(nav.attach_point(), None);
        assert_eq!(tree.lookup("docs", EntryKind::Folder), Some(docs));
    }

    #[test]
    fn test_add_child_replaces_and_frees_old_subtree() {
        let tree = tree();
        let old = tree
            .add_child(NodeId::ROOT, "x", NodeAttrs::directory(), RootId(1))
            .unwrap();
        tree.add_child(old, "inner", file_attrs(1), RootId(1)).unwrap();
        assert_eq!(tree.node_count(), 3);

        let new = tree
            .add_child(NodeId::ROOT, "X", file_attrs(2), RootId::WRITE_TARGET)
            .unwrap();
        assert_ne!(old, new);
        assert!(tree.node(old).is_none());
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.node(new).unwrap().name(), "X");
    }

    #[test]
    fn test_add_child_under_file_is_rejected() {
        let tree = tree();
        let file = tree
            .add_child(NodeId::ROOT, "f", file_attrs(1), RootId(1))
            .unwrap();
        assert_eq!(
            tree.add_child(file, "g", file_attrs(1), RootId(1)),
            Err(Status::NotADirectory)
        );
    }

    #[test]
    fn test_construct_path_styles() {
        let tree = tree();
        let docs = tree
            .add_child(NodeId::ROOT, "docs", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let readme = tree
            .add_child(docs, "readme.txt", file_attrs(1), RootId(1))
            .unwrap();

        assert_eq!(
            tree.construct_path(readme, PathStyle::Bare).unwrap(),
            "docs/readme.txt"
        );
        assert_eq!(
            tree.construct_path(readme, PathStyle::Rooted).unwrap(),
            "/docs/readme.txt"
        );
        assert_eq!(
            tree.construct_path(readme, PathStyle::Namespaced("\\\\converge\\")).unwrap(),
            "\\\\converge/docs/readme.txt"
        );
        assert_eq!(tree.construct_path(NodeId::ROOT, PathStyle::Rooted).unwrap(), "/");
        assert_eq!(
            tree.physical_path(readme).unwrap(),
            Path::new("/a/docs/readme.txt")
        );
    }

    #[test]
    fn test_relocate_keeps_id() {
        let tree = tree();
        let a = tree
            .add_child(NodeId::ROOT, "a", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let b = tree
            .add_child(NodeId::ROOT, "b", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let f = tree.add_child(a, "f.txt", file_attrs(1), RootId(1)).unwrap();

        tree.relocate(f, b, "g.txt").unwrap();
        assert_eq!(tree.lookup("a/f.txt", EntryKind::Any), None);
        assert_eq!(tree.lookup("b/g.txt", EntryKind::Any), Some(f));
        assert_eq!(tree.node(f).unwrap().parent(), Some(b));
    }

    #[test]
    fn test_walks_stop_early() {
        let tree = tree();
        let a = tree
            .add_child(NodeId::ROOT, "a", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let b = tree.add_child(a, "b", NodeAttrs::directory(), RootId(1)).unwrap();
        tree.add_child(b, "c1", file_attrs(1), RootId(1)).unwrap();
        let c2 = tree.add_child(b, "c2", file_attrs(1), RootId(1)).unwrap();

        let stopped = tree.walk_to_root(b, |node, _| node.id() != a);
        assert_eq!(stopped, Some(a));
        assert_eq!(tree.walk_to_root(b, |_, _| true), Some(NodeId::ROOT));

        let stopped = tree.walk_children(b, |_, state| state.name != "c2");
        assert_eq!(stopped, Some(c2));
        assert_eq!(tree.walk_children(b, |_, _| true), None);
        assert_eq!(tree.depth(b), 2);
    }

    #[test]
    fn test_detach_and_clear() {
        let tree = tree();
        let a = tree
            .add_child(NodeId::ROOT, "a", NodeAttrs::directory(), RootId(1))
            .unwrap();
        let f = tree.add_child(a, "f", file_attrs(1), RootId(1)).unwrap();

        assert!(tree.detach(f));
        assert!(tree.node(f).is_none());
        assert!(!tree.detach(NodeId::ROOT));

        tree.add_child(a, "g", file_attrs(1), RootId(1)).unwrap();
        tree.clear();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.node(a).is_none());
    }
}
