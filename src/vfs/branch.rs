//! Hierarchical branch locks.
//!
//! A branch lock pins a node and every ancestor up to the root so that no
//! part of the chain can be renamed or destroyed while a structural
//! operation runs. Locks are acquired deepest first and released in reverse.
//! Multi-branch sets are sorted by (depth descending, node id) so every
//! acquirer follows the same global order.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use crate::vfs::convert::{OpResult, Status};
use crate::vfs::node::VirtualNode;
use crate::vfs::tree::VirtualTree;
use crate::vfs::types::NodeId;

/// Retries before giving up on a chain that keeps changing underneath us.
const MAX_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockKind {
    Shared,
    Exclusive,
}

enum Held {
    Shared(#[allow(dead_code)] ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(#[allow(dead_code)] ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// An ordered set of held branch locks, released in reverse on drop.
pub struct BranchLock {
    held: Vec<(NodeId, LockKind, Held)>,
}

type Plan = Vec<(Arc<VirtualNode>, LockKind, usize)>;

impl BranchLock {
    /// Lock `start` and all of its ancestors in shared mode.
    pub fn shared(tree: &VirtualTree, start: NodeId) -> OpResult<Self> {
        Self::acquire(tree, &[(start, LockKind::Shared)])
    }

    /// Lock `start` exclusively and its ancestors in shared mode.
    pub fn exclusive(tree: &VirtualTree, start: NodeId) -> OpResult<Self> {
        Self::acquire(tree, &[(start, LockKind::Exclusive)])
    }

    /// Exclusive branches on two nodes at once, as needed by a move between
    /// directories. Shared ancestors are only taken once.
    pub fn exclusive_pair(tree: &VirtualTree, a: NodeId, b: NodeId) -> OpResult<Self> {
        if a == b {
            return Self::exclusive(tree, a);
        }
        Self::acquire(tree, &[(a, LockKind::Exclusive), (b, LockKind::Exclusive)])
    }

    /// The mode `id` is held in, if it is part of this set.
    pub fn mode_of(&self, id: NodeId) -> Option<LockKind> {
        self.held
            .iter()
            .find(|(held, _, _)| *held == id)
            .map(|(_, kind, _)| *kind)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn acquire(tree: &VirtualTree, starts: &[(NodeId, LockKind)]) -> OpResult<Self> {
        for attempt in 0..MAX_ATTEMPTS {
            let plan = plan(tree, starts)?;
            let expected: Vec<(NodeId, LockKind)> =
                plan.iter().map(|(n, k, _)| (n.id(), *k)).collect();

            let mut lock = BranchLock {
                held: Vec::with_capacity(plan.len()),
            };
            for (node, kind, _) in &plan {
                let guard = match kind {
                    LockKind::Shared => Held::Shared(node.branch.read_arc()),
                    LockKind::Exclusive => Held::Exclusive(node.branch.write_arc()),
                };
                lock.held.push((node.id(), *kind, guard));
            }

            // With the chain pinned no ancestor can move, so one re-check
            // tells us whether the plan went stale before we got the locks.
            let current: Option<Vec<(NodeId, LockKind)>> = plan_ids(tree, starts);
            if current.as_deref() == Some(expected.as_slice()) {
                return Ok(lock);
            }

            tracing::trace!(
                "branch lock: chain changed during acquisition, retry {}",
                attempt + 1
            );
            drop(lock);
        }

        tracing::warn!("branch lock: gave up after {} attempts", MAX_ATTEMPTS);
        Err(Status::Unsuccessful)
    }
}

impl Drop for BranchLock {
    fn drop(&mut self) {
        while let Some(entry) = self.held.pop() {
            drop(entry);
        }
    }
}

impl std::fmt::Debug for BranchLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.held.iter().map(|(id, kind, _)| (id, kind)))
            .finish()
    }
}

/// Collect `start` and its ancestors, leaf first.
fn chain(tree: &VirtualTree, start: NodeId) -> OpResult<Vec<Arc<VirtualNode>>> {
    let mut nodes = Vec::new();
    let mut current = tree.node(start).ok_or(Status::ObjectPathNotFound)?;
    loop {
        let parent = current.parent();
        nodes.push(current);
        match parent {
            Some(parent) => {
                current = tree.node(parent).ok_or(Status::ObjectPathNotFound)?;
            }
            None => break,
        }
        if nodes.len() > 4096 {
            return Err(Status::Unsuccessful);
        }
    }
    if nodes.last().map(|n| n.id()) != Some(NodeId::ROOT) {
        return Err(Status::ObjectPathNotFound);
    }
    Ok(nodes)
}

fn plan(tree: &VirtualTree, starts: &[(NodeId, LockKind)]) -> OpResult<Plan> {
    let mut merged: HashMap<NodeId, (Arc<VirtualNode>, LockKind, usize)> = HashMap::new();
    for (start, kind) in starts {
        let nodes = chain(tree, *start)?;
        let len = nodes.len();
        for (i, node) in nodes.into_iter().enumerate() {
            let mode = if i == 0 { *kind } else { LockKind::Shared };
            let depth = len - 1 - i;
            merged
                .entry(node.id())
                .and_modify(|entry| entry.1 = entry.1.max(mode))
                .or_insert((node, mode, depth));
        }
    }

    let mut plan: Plan = merged.into_values().collect();
    plan.sort_by_key(|(node, _, depth)| (Reverse(*depth), node.id()));
    Ok(plan)
}

fn plan_ids(tree: &VirtualTree, starts: &[(NodeId, LockKind)]) -> Option<Vec<(NodeId, LockKind)>> {
    plan(tree, starts)
        .ok()
        .map(|plan| plan.iter().map(|(n, k, _)| (n.id(), *k)).collect())
}
