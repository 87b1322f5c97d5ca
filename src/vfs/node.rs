use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::vfs::types::{NodeAttrs, NodeId, RootId};

/// Case-insensitive key used for child lookups.
pub(crate) fn child_key(name: &str) -> String {
    name.to_lowercase()
}

/// Mutable part of a node, guarded by the node's leaf lock.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub name: String,
    pub attrs: NodeAttrs,
    /// Physical root that currently owns this entry.
    pub root: RootId,
    /// Non-owning back reference. `None` only for the tree root.
    pub parent: Option<NodeId>,
    /// Children keyed by lowercased name. The parent owns these slots.
    pub children: BTreeMap<String, NodeId>,
    pub open_handles: u32,
    pub delete_pending: bool,
}

impl NodeState {
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(&child_key(name)).copied()
    }
}

/// One file or directory in the merged namespace.
///
/// `branch` is only ever taken through [`crate::vfs::branch::BranchLock`];
/// `state` is the leaf lock for renames, attribute updates and child edits.
#[derive(Debug)]
pub struct VirtualNode {
    id: NodeId,
    pub(crate) branch: Arc<RwLock<()>>,
    state: RwLock<NodeState>,
}

impl VirtualNode {
    fn new(id: NodeId, state: NodeState) -> Self {
        VirtualNode {
            id,
            branch: Arc::new(RwLock::new(())),
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, NodeState> {
        self.state.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, NodeState> {
        self.state.write()
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn attrs(&self) -> NodeAttrs {
        self.state.read().attrs
    }

    pub fn root(&self) -> RootId {
        self.state.read().root
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.state.read().parent
    }

    pub fn is_directory(&self) -> bool {
        self.state.read().attrs.is_directory
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Arc<VirtualNode>>,
}

#[derive(Debug, Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Slot arena that owns every node of one tree. Ids stay valid until the
/// slot is freed; a freed slot bumps its generation before reuse.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    inner: RwLock<ArenaInner>,
}

impl NodeArena {
    pub fn new() -> Self {
        NodeArena::default()
    }

    pub fn alloc(
        &self,
        name: String,
        attrs: NodeAttrs,
        root: RootId,
        parent: Option<NodeId>,
    ) -> Arc<VirtualNode> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        let id = NodeId {
            index,
            generation: slot.generation,
        };
        let node = Arc::new(VirtualNode::new(
            id,
            NodeState {
                name,
                attrs,
                root,
                parent,
                children: BTreeMap::new(),
                open_handles: 0,
                delete_pending: false,
            },
        ));
        slot.node = Some(Arc::clone(&node));
        inner.live += 1;
        node
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<VirtualNode>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.clone()
    }

    /// Release a slot. The root slot is never freed.
    pub fn free(&self, id: NodeId) -> bool {
        if id.is_root() {
            return false;
        }
        let mut inner = self.inner.write();
        let Some(slot) = inner.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.node.is_none() {
            return false;
        }
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        inner.live -= 1;
        true
    }

    pub fn live(&self) -> usize {
        self.inner.read().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocation_is_root_slot() {
        let arena = NodeArena::new();
        let root = arena.alloc(String::new(), NodeAttrs::directory(), RootId::WRITE_TARGET, None);
        assert!(root.id().is_root());
        assert_eq!(arena.live(), 1);
        assert!(!arena.free(root.id()), "root must never be freed");
    }

    #[test]
    fn test_freed_slot_is_reused_with_new_generation() {
        let arena = NodeArena::new();
        arena.alloc(String::new(), NodeAttrs::directory(), RootId::WRITE_TARGET, None);
        let a = arena.alloc("a".into(), NodeAttrs::directory(), RootId(1), Some(NodeId::ROOT));
        let old = a.id();
        drop(a);

        assert!(arena.free(old));
        assert!(arena.get(old).is_none());
        assert!(!arena.free(old), "double free is rejected");

        let b = arena.alloc("b".into(), NodeAttrs::directory(), RootId(1), Some(NodeId::ROOT));
        assert_eq!(b.id().index, old.index);
        assert_ne!(b.id().generation, old.generation);
        assert!(arena.get(old).is_none(), "stale id must not alias the new node");
        assert_eq!(arena.live(), 2);
    }

    #[test]
    fn test_child_lookup_is_case_insensitive() {
        let arena = NodeArena::new();
        let root = arena.alloc(String::new(), NodeAttrs::directory(), RootId::WRITE_TARGET, None);
        let child = arena.alloc("ReadMe.TXT".into(), NodeAttrs::directory(), RootId(1), Some(root.id()));
        root.write()
            .children
            .insert(child_key("ReadMe.TXT"), child.id());

        assert_eq!(root.read().child("readme.txt"), Some(child.id()));
        assert_eq!(root.read().child("README.TXT"), Some(child.id()));
        assert_eq!(child.name(), "ReadMe.TXT");
    }
}
