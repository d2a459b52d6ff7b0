//! FS-operation computer.
//!
//! Diffs a frozen snapshot of one replica against the sync DB and produces
//! the set of operations that happened on that side since the last
//! successful pass. Cross-replica identity is established only through the
//! DB: a Create whose content matches a Delete recorded on the other side
//! stays a Create, never a cross-replica move.

use std::collections::HashMap;

use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::snapshot::ConstSnapshot;
use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath, SyncTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOpType {
    Create,
    Edit,
    Move,
    Delete,
    Rights,
}

#[derive(Debug, Clone)]
pub struct FsOperation {
    pub op_type: FsOpType,
    pub node_id: NodeId,
    /// Path recorded in the DB; set for Move and Delete.
    pub from_path: Option<SyncPath>,
    /// Current path in the snapshot; for Delete this is the DB path.
    pub to_path: SyncPath,
    pub side: ReplicaSide,
    pub observed_at: SyncTime,
}

#[derive(Debug, Default)]
pub struct FsOperationSet {
    pub side: ReplicaSide,
    pub ops: Vec<FsOperation>,
    by_id: HashMap<NodeId, usize>,
}

impl FsOperationSet {
    pub fn new(side: ReplicaSide) -> Self {
        Self {
            side,
            ops: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn push(&mut self, op: FsOperation) {
        self.by_id.insert(op.node_id.clone(), self.ops.len());
        self.ops.push(op);
    }

    pub fn by_id(&self, id: &NodeId) -> Option<&FsOperation> {
        self.by_id.get(id).map(|&index| &self.ops[index])
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Compute the operations that happened on `side` since the DB was last
/// committed.
pub fn compute_operations(
    side: ReplicaSide,
    snapshot: &ConstSnapshot,
    db: &SyncDb,
) -> SyncResult<FsOperationSet> {
    let mut set = FsOperationSet::new(side);
    let root_id = snapshot.root_id().clone();

    // Snapshot walk: creates, moves, edits.
    for item in snapshot.preorder() {
        if item.id == root_id {
            continue;
        }

        let path = snapshot
            .path_of(&item.id)
            .unwrap_or_else(|| SyncPath::root().join(&item.name));

        let Some(db_node) = db.node_by_id(side, &item.id)? else {
            set.push(FsOperation {
                op_type: FsOpType::Create,
                node_id: item.id.clone(),
                from_path: None,
                to_path: path,
                side,
                observed_at: item.modified,
            });
            continue;
        };

        // Identify the parent the DB believes this item lives under.
        let db_parent_id = if db_node.parent_db_id == 0 {
            root_id.clone()
        } else {
            match db.node_by_db_id(db_node.parent_db_id)? {
                Some(parent) => parent.node_id_on(side).clone(),
                None => root_id.clone(),
            }
        };

        let moved = db_parent_id != item.parent_id || db_node.name_on(side) != item.name;
        if moved {
            let from_path = db.path_of(db_node.db_id, side)?;
            set.push(FsOperation {
                op_type: FsOpType::Move,
                node_id: item.id.clone(),
                from_path,
                to_path: path.clone(),
                side,
                observed_at: item.modified,
            });
        }

        let edited = item.node_type == NodeType::File
            && (item.modified > db_node.modified_on(side) || item.size != db_node.size);
        if edited {
            // A metadata-only change on a read-only item reads as a rights
            // change rather than new content.
            let op_type = if !item.can_write && item.size == db_node.size {
                FsOpType::Rights
            } else {
                FsOpType::Edit
            };
            set.push(FsOperation {
                op_type,
                node_id: item.id.clone(),
                from_path: None,
                to_path: path,
                side,
                observed_at: item.modified,
            });
        }
    }

    // DB walk: anything the snapshot no longer contains was deleted.
    for db_node in db.all_nodes()? {
        let id = db_node.node_id_on(side);
        if id.is_empty() || snapshot.contains(id) {
            continue;
        }

        let from_path = db.path_of(db_node.db_id, side)?;
        let path = from_path.clone().unwrap_or_default();
        set.push(FsOperation {
            op_type: FsOpType::Delete,
            node_id: id.clone(),
            from_path,
            to_path: path,
            side,
            observed_at: db_node.modified_on(side),
        });
    }

    log::debug!("Computed {} {} operations", set.len(), side);
    Ok(set)
}
