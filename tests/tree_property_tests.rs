use std::path::PathBuf;
use std::sync::Arc;

use convergefs::vfs::folders::VirtualFolders;
use convergefs::vfs::{EntryKind, NodeAttrs, NodeId, PathStyle, RootId, VirtualTree};
use proptest::prelude::*;

fn empty_tree() -> VirtualTree {
    let folders = VirtualFolders::new(PathBuf::from("/upper"), vec![PathBuf::from("/lower")]);
    VirtualTree::new(Arc::new(folders))
}

/// Insert every path as a chain of directories, reusing existing nodes.
fn populate(tree: &VirtualTree, paths: &[Vec<String>]) -> Vec<NodeId> {
    let mut created = Vec::new();
    for components in paths {
        let mut parent = NodeId::ROOT;
        for name in components {
            parent = match tree.child(parent, name) {
                Some(existing) => existing,
                None => {
                    let id = tree
                        .add_child(parent, name, NodeAttrs::directory(), RootId::WRITE_TARGET)
                        .unwrap();
                    created.push(id);
                    id
                }
            };
        }
    }
    created
}

fn component() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,7}"
}

fn paths() -> impl Strategy<Value = Vec<Vec<String>>> {
    prop::collection::vec(prop::collection::vec(component(), 1..5), 1..20)
}

proptest! {
    #[test]
    fn navigate_finds_every_constructed_path(paths in paths()) {
        let tree = empty_tree();
        let created = populate(&tree, &paths);

        for id in created {
            let rooted = tree.construct_path(id, PathStyle::Rooted).unwrap();
            prop_assert_eq!(tree.navigate(NodeId::ROOT, &rooted, EntryKind::Any).node, Some(id));

            let bare = tree.construct_path(id, PathStyle::Bare).unwrap();
            prop_assert_eq!(tree.lookup(&bare, EntryKind::Folder), Some(id));
        }
    }

    #[test]
    fn lookups_ignore_case(paths in paths()) {
        let tree = empty_tree();
        let created = populate(&tree, &paths);

        for id in created {
            let path = tree.construct_path(id, PathStyle::Rooted).unwrap();
            prop_assert_eq!(tree.lookup(&path.to_uppercase(), EntryKind::Any), Some(id));
            prop_assert_eq!(tree.lookup(&path.to_lowercase(), EntryKind::Any), Some(id));
        }
    }

    #[test]
    fn node_count_matches_distinct_prefixes(paths in paths()) {
        let tree = empty_tree();
        populate(&tree, &paths);

        let mut prefixes = std::collections::HashSet::new();
        for components in &paths {
            for depth in 1..=components.len() {
                let prefix: Vec<String> =
                    components[..depth].iter().map(|c| c.to_lowercase()).collect();
                prefixes.insert(prefix);
            }
        }
        prop_assert_eq!(tree.node_count(), prefixes.len() + 1);
    }
}
