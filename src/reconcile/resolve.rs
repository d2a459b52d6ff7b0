//! Conflict resolver.
//!
//! Applies the deterministic resolution policy to each classified
//! conflict, mutating the update trees so the operation generator only
//! sees resolvable work. No user prompt is involved; the policy favours
//! never losing content: conflicting content gets a conflict-rename, and
//! edits win over deletes.

use crate::error::{report, ErrorSink, SyncError};
use crate::types::{conflict_name, ConflictType, NodeId, ReplicaSide, SyncPath, SyncTime};

use super::conflict::Conflict;
use super::tree::{ChangeType, UpdateTree};

/// Looks up content hashes so pseudo-conflicts (both sides identical) can
/// be told apart from real ones. Implementations only get called when the
/// sizes already match.
pub trait ContentProbe: Send + Sync {
    fn local_hash(&self, path: &SyncPath) -> Option<String>;
    fn remote_hash(&self, id: &NodeId) -> Option<String>;
}

/// Probe that never matches, forcing every conflict to be treated as real.
/// Used when content cannot be read (tests, dry runs).
pub struct NeverEqualProbe;

impl ContentProbe for NeverEqualProbe {
    fn local_hash(&self, _path: &SyncPath) -> Option<String> {
        None
    }

    fn remote_hash(&self, _id: &NodeId) -> Option<String> {
        None
    }
}

/// Outcome of a resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Number of conflicts that were resolved by a rename; the executor
    /// must schedule another pass when non-zero.
    pub renames: usize,
    /// Pseudo-conflicts downgraded to DB-only updates.
    pub pseudo: usize,
    /// Conflicts resolved by dropping one side's operation.
    pub dropped: usize,
}

impl Resolution {
    pub fn restart_needed(&self) -> bool {
        self.renames > 0
    }
}

fn same_content(
    probe: &dyn ContentProbe,
    local: &UpdateTree,
    local_index: usize,
    remote: &UpdateTree,
    remote_index: usize,
) -> bool {
    let local_node = local.node(local_index);
    let remote_node = remote.node(remote_index);

    if local_node.size != remote_node.size {
        return false;
    }

    let local_hash = probe.local_hash(&local_node.path);
    let remote_hash = probe.remote_hash(&remote_node.id);
    match (local_hash, remote_hash) {
        (Some(local_hash), Some(remote_hash)) => local_hash == remote_hash,
        _ => false,
    }
}

/// Conflict-rename the local node: the tree node gets the suffixed name,
/// and the generator will emit the physical local rename from the original
/// path.
fn conflict_rename_local(local: &mut UpdateTree, index: usize, now: SyncTime) {
    let name = local.node(index).name.clone();
    local.rename_node(index, &conflict_name(&name, now));
}

/// Apply the resolution policy. Conflicts whose operations were already
/// neutralized by an earlier resolution in the same pass are skipped.
pub fn resolve_conflicts(
    conflicts: &[Conflict],
    local: &mut UpdateTree,
    remote: &mut UpdateTree,
    probe: &dyn ContentProbe,
    errors: &ErrorSink,
    now: SyncTime,
) -> Resolution {
    let mut resolution = Resolution::default();

    for conflict in conflicts {
        let local_index = conflict.local_node;
        let remote_index = conflict.remote_node;

        let still_live = |tree: &UpdateTree, index: Option<usize>| {
            index.is_none_or(|index| tree.node(index).change != ChangeType::None)
        };
        if !still_live(local, local_index) || !still_live(remote, remote_index) {
            continue;
        }

        match conflict.conflict_type {
            ConflictType::CreateCreate => {
                let (local_index, remote_index) = (local_index.unwrap(), remote_index.unwrap());
                if same_content(probe, local, local_index, remote, remote_index) {
                    // Pseudo: both replicas created identical content.
                    // Register the pair in the DB, touch nothing on disk.
                    local.node_mut(local_index).omit = true;
                    remote.node_mut(remote_index).omit = true;
                    resolution.pseudo += 1;
                } else {
                    let path = local.node(local_index).path.clone();
                    conflict_rename_local(local, local_index, now);
                    resolution.renames += 1;
                    report(
                        errors,
                        SyncError::conflict(ReplicaSide::Local, path, ConflictType::CreateCreate),
                    );
                }
            }

            ConflictType::EditEdit => {
                let (local_index, remote_index) = (local_index.unwrap(), remote_index.unwrap());
                if same_content(probe, local, local_index, remote, remote_index) {
                    local.node_mut(local_index).omit = true;
                    remote.node_mut(remote_index).omit = true;
                    resolution.pseudo += 1;
                } else {
                    // Rename the local copy aside and upload it as a new
                    // file; the remote version wins at the original path.
                    let path = local.node(local_index).path.clone();
                    conflict_rename_local(local, local_index, now);
                    let node = local.node_mut(local_index);
                    node.change = ChangeType::Create;
                    node.db_node_id = None;
                    resolution.renames += 1;
                    report(
                        errors,
                        SyncError::conflict(ReplicaSide::Local, path, ConflictType::EditEdit),
                    );
                }
            }

            ConflictType::MoveCreate => {
                let (local_index, remote_index) = (local_index.unwrap(), remote_index.unwrap());
                // The newly created side yields its name.
                let (tree, index, side) = if local.node(local_index).change == ChangeType::Create {
                    (&mut *local, local_index, ReplicaSide::Local)
                } else {
                    (&mut *remote, remote_index, ReplicaSide::Remote)
                };
                let path = tree.node(index).path.clone();
                let name = tree.node(index).name.clone();
                tree.rename_node(index, &conflict_name(&name, now));
                resolution.renames += 1;
                report(
                    errors,
                    SyncError::conflict(side, path, ConflictType::MoveCreate),
                );
            }

            ConflictType::EditDelete => {
                // The edit survives; dropping the delete lets the edit
                // propagate as an undelete.
                let (tree, delete_index) = if local_index
                    .is_some_and(|index| local.node(index).change == ChangeType::Delete)
                {
                    (&mut *local, local_index.unwrap())
                } else {
                    (&mut *remote, remote_index.unwrap())
                };
                tree.clear_change(delete_index);
                resolution.dropped += 1;
            }

            ConflictType::MoveDelete => {
                // The move survives; the delete becomes redundant.
                let (tree, delete_index) = if local_index
                    .is_some_and(|index| local.node(index).change == ChangeType::Delete)
                {
                    (&mut *local, local_index.unwrap())
                } else {
                    (&mut *remote, remote_index.unwrap())
                };
                tree.clear_change(delete_index);
                resolution.dropped += 1;
            }

            ConflictType::MoveParentDelete => {
                // Delete takes precedence; the moved child goes with its
                // deleted parent.
                let (tree, move_index) = if local_index
                    .is_some_and(|index| local.node(index).change == ChangeType::MoveDest)
                {
                    (&mut *local, local_index.unwrap())
                } else {
                    (&mut *remote, remote_index.unwrap())
                };
                let path = tree.node(move_index).path.clone();
                let side = tree.side;
                tree.clear_change(move_index);
                resolution.dropped += 1;
                report(
                    errors,
                    SyncError::conflict(side, path, ConflictType::MoveParentDelete),
                );
            }

            ConflictType::CreateParentDelete => {
                // The creation is dropped; its parent stays deleted.
                let (tree, create_index) = if local_index
                    .is_some_and(|index| local.node(index).change == ChangeType::Create)
                {
                    (&mut *local, local_index.unwrap())
                } else {
                    (&mut *remote, remote_index.unwrap())
                };
                let path = tree.node(create_index).path.clone();
                let side = tree.side;
                tree.clear_subtree(create_index);
                resolution.dropped += 1;
                report(
                    errors,
                    SyncError::conflict(side, path, ConflictType::CreateParentDelete),
                );
            }

            ConflictType::MoveMoveSource => {
                let (local_index, remote_index) = (local_index.unwrap(), remote_index.unwrap());
                let same_dest = local.node(local_index).path == remote.node(remote_index).path;
                if same_dest {
                    // Both replicas already agree; DB update only.
                    local.node_mut(local_index).omit = true;
                    remote.node_mut(remote_index).omit = true;
                    resolution.pseudo += 1;
                } else {
                    // One identity cannot live at two paths; the remote
                    // destination wins and the local move is dropped.
                    let path = local.node(local_index).path.clone();
                    local.clear_change(local_index);
                    resolution.dropped += 1;
                    report(
                        errors,
                        SyncError::conflict(
                            ReplicaSide::Local,
                            path,
                            ConflictType::MoveMoveSource,
                        ),
                    );
                }
            }

            ConflictType::MoveMoveDest => {
                // Two different items contend for one path; the local one
                // moves aside with a conflict-rename.
                let local_index = local_index.unwrap();
                let path = local.node(local_index).path.clone();
                conflict_rename_local(local, local_index, now);
                resolution.renames += 1;
                report(
                    errors,
                    SyncError::conflict(ReplicaSide::Local, path, ConflictType::MoveMoveDest),
                );
            }

            ConflictType::MoveMoveCycle => {
                let (local_index, remote_index) = (local_index.unwrap(), remote_index.unwrap());
                // Deterministic tie-break: the side whose moved item has
                // the lexicographically smaller id wins; the loser's move
                // is dropped and the next pass converges the rest.
                let local_id = local.node(local_index).id.clone();
                let remote_id = remote.node(remote_index).id.clone();
                let (loser_tree, loser_index, loser_side) = if local_id <= remote_id {
                    (&mut *remote, remote_index, ReplicaSide::Remote)
                } else {
                    (&mut *local, local_index, ReplicaSide::Local)
                };
                let path = loser_tree.node(loser_index).path.clone();
                loser_tree.clear_change(loser_index);
                resolution.dropped += 1;
                resolution.renames += 1;
                report(
                    errors,
                    SyncError::conflict(loser_side, path, ConflictType::MoveMoveCycle),
                );
            }
        }
    }

    log::debug!(
        "Resolved conflicts: {} renames, {} pseudo, {} dropped",
        resolution.renames,
        resolution.pseudo,
        resolution.dropped
    );
    resolution
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::log_error_sink;
    use crate::reconcile::conflict::find_conflicts;
    use crate::types::NodeType;
    use std::collections::HashMap;

    struct MapProbe {
        local: HashMap<SyncPath, String>,
        remote: HashMap<NodeId, String>,
    }

    impl ContentProbe for MapProbe {
        fn local_hash(&self, path: &SyncPath) -> Option<String> {
            self.local.get(path).cloned()
        }

        fn remote_hash(&self, id: &NodeId) -> Option<String> {
            self.remote.get(id).cloned()
        }
    }

    fn tree(side: ReplicaSide) -> UpdateTree {
        UpdateTree::new(side, NodeId::from("root"))
    }

    fn add(
        tree: &mut UpdateTree,
        path: &str,
        change: ChangeType,
        node_type: NodeType,
        db_id: Option<i64>,
        size: i64,
    ) -> usize {
        let index = tree.ensure_path(&SyncPath::new(path), None);
        let node = tree.node_mut(index);
        node.change = change;
        node.node_type = node_type;
        node.db_node_id = db_id;
        node.size = size;
        node.id = NodeId::from(path);
        index
    }

    #[test]
    fn create_create_real_renames_local() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);
        add(&mut local, "x.txt", ChangeType::Create, NodeType::File, None, 1);
        add(&mut remote, "x.txt", ChangeType::Create, NodeType::File, None, 1);

        let conflicts = find_conflicts(&local, &remote);
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            42,
        );

        assert_eq!(resolution.renames, 1);
        assert!(resolution.restart_needed());
        assert!(local
            .find_by_path(&SyncPath::new("x (Conflict 42).txt"))
            .is_some());
        // Remote creation still lands at the original path.
        let remote_index = remote.find_by_path(&SyncPath::new("x.txt")).unwrap();
        assert_eq!(remote.node(remote_index).change, ChangeType::Create);
    }

    #[test]
    fn create_create_pseudo_omits_both() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);
        add(&mut local, "x.txt", ChangeType::Create, NodeType::File, None, 5);
        add(&mut remote, "x.txt", ChangeType::Create, NodeType::File, None, 5);

        let probe = MapProbe {
            local: HashMap::from([(SyncPath::new("x.txt"), "same".into())]),
            remote: HashMap::from([(NodeId::from("x.txt"), "same".into())]),
        };

        let conflicts = find_conflicts(&local, &remote);
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &probe,
            &log_error_sink(),
            42,
        );

        assert_eq!(resolution.pseudo, 1);
        assert!(!resolution.restart_needed());
        let local_index = local.find_by_path(&SyncPath::new("x.txt")).unwrap();
        assert!(local.node(local_index).omit);
    }

    #[test]
    fn edit_edit_real_turns_local_into_conflict_create() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);
        add(&mut local, "a.txt", ChangeType::Edit, NodeType::File, Some(7), 10);
        add(&mut remote, "a.txt", ChangeType::Edit, NodeType::File, Some(7), 12);

        let conflicts = find_conflicts(&local, &remote);
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            9,
        );

        assert_eq!(resolution.renames, 1);
        let renamed = local
            .find_by_path(&SyncPath::new("a (Conflict 9).txt"))
            .unwrap();
        assert_eq!(local.node(renamed).change, ChangeType::Create);
        assert_eq!(local.node(renamed).db_node_id, None);

        // Remote edit keeps the original path.
        let remote_index = remote.find_by_path(&SyncPath::new("a.txt")).unwrap();
        assert_eq!(remote.node(remote_index).change, ChangeType::Edit);
    }

    #[test]
    fn edit_delete_drops_the_delete() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);
        add(&mut local, "a.txt", ChangeType::Edit, NodeType::File, Some(7), 10);
        add(&mut remote, "a.txt", ChangeType::Delete, NodeType::File, Some(7), 0);

        let conflicts = find_conflicts(&local, &remote);
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            0,
        );

        assert_eq!(resolution.dropped, 1);
        assert!(remote.changed_nodes().is_empty());
        assert_eq!(local.changed_nodes().len(), 1);
    }

    #[test]
    fn move_delete_keeps_the_move() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);

        let source = add(&mut local, "dir/a.txt", ChangeType::Move, NodeType::File, Some(3), 5);
        let dest = add(
            &mut local,
            "other/a.txt",
            ChangeType::MoveDest,
            NodeType::File,
            Some(3),
            5,
        );
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        add(&mut remote, "dir/a.txt", ChangeType::Delete, NodeType::File, Some(3), 0);

        let conflicts = find_conflicts(&local, &remote);
        resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            0,
        );

        assert!(remote.changed_nodes().is_empty());
        let moves: Vec<ChangeType> = local
            .changed_nodes()
            .iter()
            .map(|&index| local.node(index).change)
            .collect();
        assert!(moves.contains(&ChangeType::Move));
        assert!(moves.contains(&ChangeType::MoveDest));
    }

    #[test]
    fn move_parent_delete_favours_the_delete() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);

        let source = add(&mut local, "elsewhere/x", ChangeType::Move, NodeType::File, Some(5), 1);
        let dest = add(&mut local, "dir/x", ChangeType::MoveDest, NodeType::File, Some(5), 1);
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        add(&mut remote, "dir", ChangeType::Delete, NodeType::Directory, Some(4), 0);

        let conflicts = find_conflicts(&local, &remote);
        resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            0,
        );

        assert!(local.changed_nodes().is_empty());
        assert_eq!(remote.changed_nodes().len(), 1);
    }

    #[test]
    fn move_move_cycle_drops_the_larger_id() {
        let mut local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);

        let b_index = local.ensure_path(&SyncPath::new("b"), None);
        local.node_mut(b_index).db_node_id = Some(2);
        let source = add(&mut local, "a", ChangeType::Move, NodeType::Directory, Some(1), 0);
        let dest = add(&mut local, "b/a", ChangeType::MoveDest, NodeType::Directory, Some(1), 0);
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);
        local.node_mut(dest).id = NodeId::from("id-a");

        let a_index = remote.ensure_path(&SyncPath::new("a"), None);
        remote.node_mut(a_index).db_node_id = Some(1);
        let source = add(&mut remote, "b", ChangeType::Move, NodeType::Directory, Some(2), 0);
        let dest = add(&mut remote, "a/b", ChangeType::MoveDest, NodeType::Directory, Some(2), 0);
        remote.node_mut(source).move_peer = Some(dest);
        remote.node_mut(dest).move_peer = Some(source);
        remote.node_mut(dest).id = NodeId::from("id-b");

        let conflicts = find_conflicts(&local, &remote);
        let resolution = resolve_conflicts(
            &conflicts,
            &mut local,
            &mut remote,
            &NeverEqualProbe,
            &log_error_sink(),
            0,
        );

        // "id-a" < "id-b": local wins, the remote move is dropped.
        assert!(resolution.restart_needed());
        assert!(remote.changed_nodes().is_empty());
        assert!(!local.changed_nodes().is_empty());
    }
}
