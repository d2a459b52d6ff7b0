//! Conflict finder.
//!
//! Pairs operations from the two update trees that touch the same item or
//! the same path and classifies each pair. Identity across replicas exists
//! only through the sync DB, so same-identity checks go through the
//! `db_node_id` each changed node carries, while Create ops (which have no
//! DB row yet) collide by path.

use std::collections::HashMap;

use crate::types::{ConflictType, DbNodeId, SyncPath};

use super::tree::{ChangeType, UpdateTree};

/// One classified pair of colliding operations.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    /// Index into the local tree, when a local op participates.
    pub local_node: Option<usize>,
    /// Index into the remote tree, when a remote op participates.
    pub remote_node: Option<usize>,
}

fn changed_by_db_id(tree: &UpdateTree, wanted: &[ChangeType]) -> HashMap<DbNodeId, usize> {
    let mut map = HashMap::new();
    for index in tree.changed_nodes() {
        let node = tree.node(index);
        if wanted.contains(&node.change) {
            if let Some(db_id) = node.db_node_id {
                map.insert(db_id, index);
            }
        }
    }
    map
}

fn occupying_by_path(tree: &UpdateTree) -> HashMap<SyncPath, usize> {
    let mut map = HashMap::new();
    for index in tree.changed_nodes() {
        let node = tree.node(index);
        if matches!(node.change, ChangeType::Create | ChangeType::MoveDest) {
            map.insert(node.path.clone(), index);
        }
    }
    map
}

fn deleted_dirs(tree: &UpdateTree) -> Vec<(SyncPath, usize)> {
    tree.changed_nodes()
        .into_iter()
        .filter(|&index| {
            let node = tree.node(index);
            node.change == ChangeType::Delete && node.is_directory()
        })
        .map(|index| (tree.node(index).path.clone(), index))
        .collect()
}

/// Find and classify every conflicting pair between the two trees. The
/// output order is deterministic: same-path collisions first, then
/// same-identity collisions, then parent-delete collisions, then cycles.
pub fn find_conflicts(local: &UpdateTree, remote: &UpdateTree) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    // Same-path occupancy: two ops want to produce an item at one path.
    let local_occupied = occupying_by_path(local);
    let remote_occupied = occupying_by_path(remote);

    let mut paths: Vec<&SyncPath> = local_occupied.keys().collect();
    paths.sort();
    for path in paths {
        let Some(&local_index) = local_occupied.get(path) else {
            continue;
        };
        let Some(&remote_index) = remote_occupied.get(path) else {
            continue;
        };

        let local_change = local.node(local_index).change;
        let remote_change = remote.node(remote_index).change;

        // Two moves of the same identity to the same path are handled as
        // MoveMoveSource below, not as a destination collision.
        let same_identity = local.node(local_index).db_node_id.is_some()
            && local.node(local_index).db_node_id == remote.node(remote_index).db_node_id;

        let conflict_type = match (local_change, remote_change) {
            (ChangeType::Create, ChangeType::Create) => ConflictType::CreateCreate,
            (ChangeType::MoveDest, ChangeType::Create)
            | (ChangeType::Create, ChangeType::MoveDest) => ConflictType::MoveCreate,
            (ChangeType::MoveDest, ChangeType::MoveDest) if !same_identity => {
                ConflictType::MoveMoveDest
            }
            _ => continue,
        };

        conflicts.push(Conflict {
            conflict_type,
            local_node: Some(local_index),
            remote_node: Some(remote_index),
        });
    }

    // Same-identity collisions through the DB row.
    let local_edits = changed_by_db_id(local, &[ChangeType::Edit]);
    let remote_edits = changed_by_db_id(remote, &[ChangeType::Edit]);
    let local_moves = changed_by_db_id(local, &[ChangeType::MoveDest]);
    let remote_moves = changed_by_db_id(remote, &[ChangeType::MoveDest]);
    let local_deletes = changed_by_db_id(local, &[ChangeType::Delete]);
    let remote_deletes = changed_by_db_id(remote, &[ChangeType::Delete]);

    let mut identities: Vec<DbNodeId> = local_edits
        .keys()
        .chain(local_moves.keys())
        .chain(local_deletes.keys())
        .copied()
        .collect();
    identities.sort_unstable();
    identities.dedup();

    for db_id in identities {
        let pairs: [(Option<&usize>, Option<&usize>, ConflictType); 5] = [
            (
                local_edits.get(&db_id),
                remote_edits.get(&db_id),
                ConflictType::EditEdit,
            ),
            (
                local_edits.get(&db_id),
                remote_deletes.get(&db_id),
                ConflictType::EditDelete,
            ),
            (
                local_deletes.get(&db_id),
                remote_edits.get(&db_id),
                ConflictType::EditDelete,
            ),
            (
                local_moves.get(&db_id),
                remote_deletes.get(&db_id),
                ConflictType::MoveDelete,
            ),
            (
                local_deletes.get(&db_id),
                remote_moves.get(&db_id),
                ConflictType::MoveDelete,
            ),
        ];

        for (local_index, remote_index, conflict_type) in pairs {
            if let (Some(&local_index), Some(&remote_index)) = (local_index, remote_index) {
                conflicts.push(Conflict {
                    conflict_type,
                    local_node: Some(local_index),
                    remote_node: Some(remote_index),
                });
            }
        }

        if let (Some(&local_index), Some(&remote_index)) =
            (local_moves.get(&db_id), remote_moves.get(&db_id))
        {
            conflicts.push(Conflict {
                conflict_type: ConflictType::MoveMoveSource,
                local_node: Some(local_index),
                remote_node: Some(remote_index),
            });
        }
    }

    // Parent-delete collisions: an op materializes something beneath a
    // directory the other side deleted.
    for (tree_a, occupied_b, flip) in [
        (remote, &local_occupied, false),
        (local, &remote_occupied, true),
    ] {
        for (deleted_path, deleted_index) in deleted_dirs(tree_a) {
            let mut entries: Vec<(&SyncPath, &usize)> = occupied_b.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            for (path, &occupying_index) in entries {
                if !path.starts_with(&deleted_path) || *path == deleted_path {
                    continue;
                }

                let occupying_tree = if flip { remote } else { local };
                let conflict_type = match occupying_tree.node(occupying_index).change {
                    ChangeType::Create => ConflictType::CreateParentDelete,
                    ChangeType::MoveDest => ConflictType::MoveParentDelete,
                    _ => continue,
                };

                let (local_node, remote_node) = if flip {
                    (Some(deleted_index), Some(occupying_index))
                } else {
                    (Some(occupying_index), Some(deleted_index))
                };
                conflicts.push(Conflict {
                    conflict_type,
                    local_node,
                    remote_node,
                });
            }
        }
    }

    // Move cycles: local moves X under Y while remote moves Y under X.
    let local_new_parent = move_new_parents(local);
    let remote_new_parent = move_new_parents(remote);
    let mut cycle_ids: Vec<DbNodeId> = local_new_parent.keys().copied().collect();
    cycle_ids.sort_unstable();
    for moved in cycle_ids {
        let Some(&(local_index, new_parent)) = local_new_parent.get(&moved) else {
            continue;
        };
        if let Some(&(remote_index, remote_parent)) = remote_new_parent.get(&new_parent) {
            if remote_parent == moved {
                conflicts.push(Conflict {
                    conflict_type: ConflictType::MoveMoveCycle,
                    local_node: Some(local_index),
                    remote_node: Some(remote_index),
                });
            }
        }
    }

    log::debug!("Found {} conflicts", conflicts.len());
    conflicts
}

/// Moved identity → (dest index, identity of the new parent), for moves
/// whose new parent is itself a synced item.
fn move_new_parents(tree: &UpdateTree) -> HashMap<DbNodeId, (usize, DbNodeId)> {
    let mut map = HashMap::new();
    for index in tree.changed_nodes() {
        let node = tree.node(index);
        if node.change != ChangeType::MoveDest {
            continue;
        }
        let Some(moved_db_id) = node.db_node_id else {
            continue;
        };
        let Some(parent_index) = node.parent else {
            continue;
        };
        if let Some(parent_db_id) = tree.node(parent_index).db_node_id {
            map.insert(moved_db_id, (index, parent_db_id));
        }
    }
    map
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{NodeId, NodeType, ReplicaSide};

    fn empty_tree(side: ReplicaSide) -> UpdateTree {
        UpdateTree::new(side, NodeId::from("root"))
    }

    fn add_node(
        tree: &mut UpdateTree,
        path: &str,
        change: ChangeType,
        node_type: NodeType,
        db_id: Option<DbNodeId>,
    ) -> usize {
        let index = tree.ensure_path(&SyncPath::new(path), None);
        let node = tree.node_mut(index);
        node.change = change;
        node.node_type = node_type;
        node.db_node_id = db_id;
        index
    }

    #[test]
    fn create_create_collides_by_path() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "x.txt", ChangeType::Create, NodeType::File, None);
        add_node(&mut remote, "x.txt", ChangeType::Create, NodeType::File, None);

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::CreateCreate);
    }

    #[test]
    fn edit_edit_collides_by_identity() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "a.txt", ChangeType::Edit, NodeType::File, Some(7));
        add_node(&mut remote, "a.txt", ChangeType::Edit, NodeType::File, Some(7));

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::EditEdit);
    }

    #[test]
    fn edit_delete_in_both_directions() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "a.txt", ChangeType::Edit, NodeType::File, Some(7));
        add_node(&mut remote, "a.txt", ChangeType::Delete, NodeType::File, Some(7));

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::EditDelete);

        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "a.txt", ChangeType::Delete, NodeType::File, Some(7));
        add_node(&mut remote, "a.txt", ChangeType::Edit, NodeType::File, Some(7));
        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts[0].conflict_type, ConflictType::EditDelete);
    }

    #[test]
    fn move_delete_collides_by_identity() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);

        let source = add_node(&mut local, "dir/a.txt", ChangeType::Move, NodeType::File, Some(3));
        let dest = add_node(
            &mut local,
            "other/a.txt",
            ChangeType::MoveDest,
            NodeType::File,
            Some(3),
        );
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        add_node(&mut remote, "dir/a.txt", ChangeType::Delete, NodeType::File, Some(3));

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::MoveDelete);
    }

    #[test]
    fn create_under_remotely_deleted_dir() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "dir/new.txt", ChangeType::Create, NodeType::File, None);
        add_node(
            &mut remote,
            "dir",
            ChangeType::Delete,
            NodeType::Directory,
            Some(4),
        );

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::CreateParentDelete);
    }

    #[test]
    fn same_dest_moves_are_move_move_source() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);

        for tree in [&mut local, &mut remote] {
            let source = add_node(tree, "a.txt", ChangeType::Move, NodeType::File, Some(9));
            let dest = add_node(tree, "b.txt", ChangeType::MoveDest, NodeType::File, Some(9));
            tree.node_mut(source).move_peer = Some(dest);
            tree.node_mut(dest).move_peer = Some(source);
        }

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::MoveMoveSource);
    }

    #[test]
    fn different_items_moved_to_same_path() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);

        let source = add_node(&mut local, "a.txt", ChangeType::Move, NodeType::File, Some(1));
        let dest = add_node(&mut local, "dest.txt", ChangeType::MoveDest, NodeType::File, Some(1));
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        let source = add_node(&mut remote, "b.txt", ChangeType::Move, NodeType::File, Some(2));
        let dest = add_node(&mut remote, "dest.txt", ChangeType::MoveDest, NodeType::File, Some(2));
        remote.node_mut(source).move_peer = Some(dest);
        remote.node_mut(dest).move_peer = Some(source);

        let conflicts = find_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::MoveMoveDest);
    }

    #[test]
    fn crossing_moves_form_a_cycle() {
        // Local moves a under b; remote moves b under a.
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);

        // Local tree: b is unchanged ancestor (db 2), a (db 1) moved under it.
        let b_index = local.ensure_path(&SyncPath::new("b"), None);
        local.node_mut(b_index).node_type = NodeType::Directory;
        local.node_mut(b_index).db_node_id = Some(2);
        let source = add_node(&mut local, "a", ChangeType::Move, NodeType::Directory, Some(1));
        let dest = add_node(&mut local, "b/a", ChangeType::MoveDest, NodeType::Directory, Some(1));
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        // Remote tree: a unchanged (db 1), b (db 2) moved under it.
        let a_index = remote.ensure_path(&SyncPath::new("a"), None);
        remote.node_mut(a_index).node_type = NodeType::Directory;
        remote.node_mut(a_index).db_node_id = Some(1);
        let source = add_node(&mut remote, "b", ChangeType::Move, NodeType::Directory, Some(2));
        let dest = add_node(&mut remote, "a/b", ChangeType::MoveDest, NodeType::Directory, Some(2));
        remote.node_mut(source).move_peer = Some(dest);
        remote.node_mut(dest).move_peer = Some(source);

        let conflicts = find_conflicts(&local, &remote);
        assert!(conflicts
            .iter()
            .any(|conflict| conflict.conflict_type == ConflictType::MoveMoveCycle));
    }

    #[test]
    fn non_overlapping_ops_produce_no_conflicts() {
        let mut local = empty_tree(ReplicaSide::Local);
        let mut remote = empty_tree(ReplicaSide::Remote);
        add_node(&mut local, "a.txt", ChangeType::Create, NodeType::File, None);
        add_node(&mut remote, "b.txt", ChangeType::Create, NodeType::File, None);

        assert!(find_conflicts(&local, &remote).is_empty());
    }
}
