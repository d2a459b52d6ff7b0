//! Operation generator.
//!
//! Walks both resolved update trees in preorder and emits executable sync
//! operations targeting the opposite replica. Conflict-renamed local nodes
//! additionally produce the physical local rename that frees the original
//! path before anything else lands there; blacklisted items are skipped.

use crate::blacklist::TmpBlacklist;
use crate::types::{DbNodeId, NodeId, NodeType, ReplicaSide, SyncPath, SyncTime};

use super::tree::{ChangeType, UpdateTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOpType {
    Create,
    Edit,
    Move,
    Delete,
}

/// One executable operation of the ordered plan.
#[derive(Debug, Clone)]
pub struct SyncOp {
    /// The replica this operation mutates.
    pub target_side: ReplicaSide,
    pub op_type: SyncOpType,
    /// Pseudo-conflict: only the DB is updated.
    pub omit: bool,
    /// Id of the affected node on the side the change was observed.
    pub node_id: NodeId,
    /// Destination path (shared relative path space).
    pub path: SyncPath,
    /// Source path for moves and conflict renames.
    pub from_path: Option<SyncPath>,
    pub node_type: NodeType,
    pub size: i64,
    pub created: SyncTime,
    pub modified: SyncTime,
    pub db_node_id: Option<DbNodeId>,
    /// Set on the physical rename generated for a conflict-renamed node.
    pub conflict_rename: bool,
}

impl SyncOp {
    /// The side the change was observed on.
    pub fn source_side(&self) -> ReplicaSide {
        self.target_side.opposite()
    }
}

fn op_from_node(
    tree: &UpdateTree,
    index: usize,
    op_type: SyncOpType,
    from_path: Option<SyncPath>,
) -> SyncOp {
    let node = tree.node(index);
    SyncOp {
        target_side: tree.side.opposite(),
        op_type,
        omit: node.omit,
        node_id: node.id.clone(),
        path: node.path.clone(),
        from_path,
        node_type: node.node_type,
        size: node.size,
        created: node.created,
        modified: node.modified,
        db_node_id: node.db_node_id,
        conflict_rename: false,
    }
}

/// Generate the (unordered) operation list from both trees.
pub fn generate_operations(
    local: &UpdateTree,
    remote: &UpdateTree,
    blacklist: &TmpBlacklist,
) -> Vec<SyncOp> {
    let mut ops = Vec::new();

    for tree in [local, remote] {
        for index in tree.preorder() {
            let node = tree.node(index);

            if node.change == ChangeType::None {
                continue;
            }
            if blacklist.contains(tree.side, &node.id, &node.path) {
                log::debug!(
                    "Skipping blacklisted {} item at {}",
                    tree.side,
                    node.path
                );
                continue;
            }

            match node.change {
                ChangeType::Create | ChangeType::TmpFileName => {
                    // A conflict-renamed local creation first frees its
                    // original path with a physical rename.
                    if tree.side == ReplicaSide::Local {
                        if let Some(original_name) = &node.original_name {
                            let parent = node.path.parent().unwrap_or_default();
                            let original_path = parent.join(original_name);
                            ops.push(SyncOp {
                                target_side: ReplicaSide::Local,
                                op_type: SyncOpType::Move,
                                omit: false,
                                node_id: node.id.clone(),
                                path: node.path.clone(),
                                from_path: Some(original_path),
                                node_type: node.node_type,
                                size: node.size,
                                created: node.created,
                                modified: node.modified,
                                db_node_id: None,
                                conflict_rename: true,
                            });
                        }
                    }
                    ops.push(op_from_node(tree, index, SyncOpType::Create, None));
                }
                ChangeType::Edit => {
                    ops.push(op_from_node(tree, index, SyncOpType::Edit, None));
                }
                ChangeType::MoveDest => {
                    let from_path = node
                        .move_peer
                        .map(|peer| tree.node(peer).path.clone());
                    ops.push(op_from_node(tree, index, SyncOpType::Move, from_path));
                }
                // The Move source endpoint is emitted with its MoveDest.
                ChangeType::Move => {}
                ChangeType::Delete => {
                    ops.push(op_from_node(tree, index, SyncOpType::Delete, None));
                }
                ChangeType::None => unreachable!(),
            }
        }
    }

    log::debug!("Generated {} sync operations", ops.len());
    ops
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::NodeType;

    fn tree(side: ReplicaSide) -> UpdateTree {
        UpdateTree::new(side, NodeId::from("root"))
    }

    fn add(
        tree: &mut UpdateTree,
        path: &str,
        change: ChangeType,
        node_type: NodeType,
    ) -> usize {
        let index = tree.ensure_path(&SyncPath::new(path), None);
        let node = tree.node_mut(index);
        node.change = change;
        node.node_type = node_type;
        node.id = NodeId::from(path);
        index
    }

    #[test]
    fn local_create_targets_remote() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);
        add(&mut local, "a.txt", ChangeType::Create, NodeType::File);

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].target_side, ReplicaSide::Remote);
        assert_eq!(ops[0].op_type, SyncOpType::Create);
    }

    #[test]
    fn remote_delete_targets_local() {
        let local = tree(ReplicaSide::Local);
        let mut remote = tree(ReplicaSide::Remote);
        add(&mut remote, "a.txt", ChangeType::Delete, NodeType::File);

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].target_side, ReplicaSide::Local);
        assert_eq!(ops[0].op_type, SyncOpType::Delete);
    }

    #[test]
    fn move_pair_emits_one_op_with_both_paths() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);

        let source = add(&mut local, "old/a.txt", ChangeType::Move, NodeType::File);
        let dest = add(&mut local, "new/a.txt", ChangeType::MoveDest, NodeType::File);
        local.node_mut(source).move_peer = Some(dest);
        local.node_mut(dest).move_peer = Some(source);

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        let moves: Vec<&SyncOp> = ops
            .iter()
            .filter(|op| op.op_type == SyncOpType::Move)
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from_path.as_ref().unwrap(), &SyncPath::new("old/a.txt"));
        assert_eq!(moves[0].path, SyncPath::new("new/a.txt"));
    }

    #[test]
    fn conflict_renamed_local_create_also_emits_physical_rename() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);

        let index = add(&mut local, "x.txt", ChangeType::Create, NodeType::File);
        local.rename_node(index, "x (Conflict 7).txt");

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        assert_eq!(ops.len(), 2);

        let rename = &ops[0];
        assert_eq!(rename.target_side, ReplicaSide::Local);
        assert_eq!(rename.op_type, SyncOpType::Move);
        assert!(rename.conflict_rename);
        assert_eq!(rename.from_path.as_ref().unwrap(), &SyncPath::new("x.txt"));
        assert_eq!(rename.path, SyncPath::new("x (Conflict 7).txt"));

        let upload = &ops[1];
        assert_eq!(upload.target_side, ReplicaSide::Remote);
        assert_eq!(upload.op_type, SyncOpType::Create);
        assert_eq!(upload.path, SyncPath::new("x (Conflict 7).txt"));
    }

    #[test]
    fn omitted_nodes_keep_their_flag() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);
        let index = add(&mut local, "same.txt", ChangeType::Create, NodeType::File);
        local.node_mut(index).omit = true;

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].omit);
    }

    #[test]
    fn blacklisted_items_are_skipped() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);
        add(&mut local, "bad.txt", ChangeType::Create, NodeType::File);

        let blacklist = TmpBlacklist::with_threshold(1);
        blacklist.record_error(
            ReplicaSide::Local,
            &NodeId::from("bad.txt"),
            &SyncPath::new("bad.txt"),
        );

        let ops = generate_operations(&local, &remote, &blacklist);
        assert!(ops.is_empty());
    }

    #[test]
    fn parents_precede_children_in_generation_order() {
        let mut local = tree(ReplicaSide::Local);
        let remote = tree(ReplicaSide::Remote);
        add(&mut local, "dir", ChangeType::Create, NodeType::Directory);
        add(&mut local, "dir/a.txt", ChangeType::Create, NodeType::File);

        let ops = generate_operations(&local, &remote, &TmpBlacklist::new());
        let dir_pos = ops
            .iter()
            .position(|op| op.path == SyncPath::new("dir"))
            .unwrap();
        let file_pos = ops
            .iter()
            .position(|op| op.path == SyncPath::new("dir/a.txt"))
            .unwrap();
        assert!(dir_pos < file_pos);
    }
}
