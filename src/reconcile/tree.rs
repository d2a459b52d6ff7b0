//! Update trees.
//!
//! Each side's operation set is materialized as a tree rooted at the sync
//! root, with every affected node annotated with a change type. Moves are
//! represented as two linked nodes (source flagged `Move`, destination
//! flagged `MoveDest`) so that conflict resolution can reason about both
//! endpoints. Every ancestor of an affected node exists in the tree even
//! if unchanged, so path traversal never consults the snapshot.

use std::collections::HashMap;

use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::snapshot::ConstSnapshot;
use crate::types::{DbNodeId, NodeId, NodeType, ReplicaSide, SyncPath, SyncTime};

use super::compute::{FsOpType, FsOperationSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeType {
    #[default]
    None,
    Create,
    Edit,
    Move,
    MoveDest,
    Delete,
    /// Renamed by the platform checker with a disambiguating suffix.
    TmpFileName,
}

#[derive(Debug, Clone)]
pub struct UpdateNode {
    pub id: NodeId,
    pub name: String,
    pub path: SyncPath,
    pub change: ChangeType,
    pub node_type: NodeType,
    pub size: i64,
    pub created: SyncTime,
    pub modified: SyncTime,
    pub can_write: bool,
    /// Arena index of the other endpoint for Move/MoveDest pairs.
    pub move_peer: Option<usize>,
    /// DB row backing this item, when it is already synced.
    pub db_node_id: Option<DbNodeId>,
    /// Pseudo-conflict: the operation only consumes a DB update.
    pub omit: bool,
    /// Set when the node was conflict-renamed; the original name the
    /// remote replica still uses.
    pub original_name: Option<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl UpdateNode {
    pub fn is_directory(&self) -> bool {
        self.node_type.is_directory()
    }
}

#[derive(Debug)]
pub struct UpdateTree {
    pub side: ReplicaSide,
    arena: Vec<UpdateNode>,
    by_path: HashMap<SyncPath, usize>,
}

impl UpdateTree {
    pub fn new(side: ReplicaSide, root_id: NodeId) -> Self {
        let root = UpdateNode {
            id: root_id,
            name: String::new(),
            path: SyncPath::root(),
            change: ChangeType::None,
            node_type: NodeType::Directory,
            size: 0,
            created: 0,
            modified: 0,
            can_write: true,
            move_peer: None,
            db_node_id: None,
            omit: false,
            original_name: None,
            parent: None,
            children: Vec::new(),
        };

        Self {
            side,
            arena: vec![root],
            by_path: HashMap::from([(SyncPath::root(), 0)]),
        }
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn node(&self, index: usize) -> &UpdateNode {
        &self.arena[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut UpdateNode {
        &mut self.arena[index]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1
    }

    pub fn find_by_path(&self, path: &SyncPath) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    /// Indices in preorder, root first, children in name order.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.arena.len());
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            order.push(index);
            let mut children = self.arena[index].children.clone();
            children.sort_by(|&a, &b| self.arena[b].name.cmp(&self.arena[a].name));
            stack.extend(children);
        }
        order
    }

    /// Ensure a node exists for every component of `path`, creating
    /// unchanged ancestor nodes as needed, and return the leaf index.
    pub fn ensure_path(
        &mut self,
        path: &SyncPath,
        snapshot: Option<&ConstSnapshot>,
    ) -> usize {
        if let Some(index) = self.find_by_path(path) {
            return index;
        }

        let mut current = 0usize;
        let mut walked = SyncPath::root();

        let components: Vec<String> = path
            .as_path()
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();

        for name in components {
            walked = walked.join(&name);
            if let Some(index) = self.find_by_path(&walked) {
                current = index;
                continue;
            }

            // Fill in identity from the snapshot when the path exists
            // there; deleted paths keep an empty id and get patched by the
            // caller.
            let (id, node_type, size, created, modified, can_write) = snapshot
                .and_then(|snapshot| {
                    let id = snapshot.item_id_at(&walked)?;
                    let item = snapshot.item(&id)?;
                    Some((
                        id.clone(),
                        item.node_type,
                        item.size,
                        item.created,
                        item.modified,
                        item.can_write,
                    ))
                })
                .unwrap_or((NodeId::new(""), NodeType::Directory, 0, 0, 0, true));

            let index = self.arena.len();
            self.arena.push(UpdateNode {
                id,
                name: name.clone(),
                path: walked.clone(),
                change: ChangeType::None,
                node_type,
                size,
                created,
                modified,
                can_write,
                move_peer: None,
                db_node_id: None,
                omit: false,
                original_name: None,
                parent: Some(current),
                children: Vec::new(),
            });
            self.arena[current].children.push(index);
            self.by_path.insert(walked.clone(), index);
            current = index;
        }

        current
    }

    /// Change the name (and path) of a leaf node, keeping the index maps
    /// coherent. Used by the platform checker and the conflict resolver.
    pub fn rename_node(&mut self, index: usize, new_name: &str) {
        let old_path = self.arena[index].path.clone();
        let parent_path = old_path.parent().unwrap_or_default();
        let new_path = parent_path.join(new_name);

        let node = &mut self.arena[index];
        node.original_name = Some(node.name.clone());
        node.name = new_name.to_owned();
        node.path = new_path.clone();

        self.by_path.remove(&old_path);
        self.by_path.insert(new_path, index);
    }

    /// Neutralize a node's change, e.g. when its operation was resolved
    /// away or its item is blacklisted. Children stay in the tree.
    pub fn clear_change(&mut self, index: usize) {
        if let Some(peer) = self.arena[index].move_peer {
            self.arena[peer].change = ChangeType::None;
            self.arena[peer].move_peer = None;
        }
        let node = &mut self.arena[index];
        node.change = ChangeType::None;
        node.move_peer = None;
    }

    /// Neutralize a node and every node beneath it.
    pub fn clear_subtree(&mut self, index: usize) {
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            stack.extend(self.arena[current].children.clone());
            self.clear_change(current);
        }
    }

    /// Indices of nodes carrying an actual change.
    pub fn changed_nodes(&self) -> Vec<usize> {
        self.preorder()
            .into_iter()
            .filter(|&index| self.arena[index].change != ChangeType::None)
            .collect()
    }
}

/// Build the update tree for one side from its operation set.
pub fn build_update_tree(
    set: &FsOperationSet,
    snapshot: &ConstSnapshot,
    db: &SyncDb,
) -> SyncResult<UpdateTree> {
    let mut tree = UpdateTree::new(set.side, snapshot.root_id().clone());

    for op in &set.ops {
        match op.op_type {
            FsOpType::Create => {
                let index = tree.ensure_path(&op.to_path, Some(snapshot));
                tree.node_mut(index).change = ChangeType::Create;
            }
            FsOpType::Edit | FsOpType::Rights => {
                let index = tree.ensure_path(&op.to_path, Some(snapshot));
                let db_node = db.node_by_id(set.side, &op.node_id)?;
                let node = tree.node_mut(index);
                node.change = ChangeType::Edit;
                node.db_node_id = db_node.map(|db_node| db_node.db_id);
            }
            FsOpType::Move => {
                let from = op.from_path.clone().unwrap_or_default();
                let db_node = db.node_by_id(set.side, &op.node_id)?;
                let db_id = db_node.as_ref().map(|db_node| db_node.db_id);

                // Source node: the path no longer exists in the snapshot,
                // so patch identity in by hand.
                let source = tree.ensure_path(&from, None);
                {
                    let node = tree.node_mut(source);
                    node.change = ChangeType::Move;
                    node.id = op.node_id.clone();
                    node.db_node_id = db_id;
                }

                let dest = tree.ensure_path(&op.to_path, Some(snapshot));
                {
                    let node = tree.node_mut(dest);
                    node.change = ChangeType::MoveDest;
                    node.id = op.node_id.clone();
                    node.db_node_id = db_id;
                    node.move_peer = Some(source);
                }
                tree.node_mut(source).move_peer = Some(dest);
            }
            FsOpType::Delete => {
                let path = op.from_path.clone().unwrap_or(op.to_path.clone());
                let db_node = db.node_by_id(set.side, &op.node_id)?;
                let index = tree.ensure_path(&path, None);
                let node = tree.node_mut(index);
                node.change = ChangeType::Delete;
                node.id = op.node_id.clone();
                node.db_node_id = db_node.as_ref().map(|db_node| db_node.db_id);
                node.node_type = db_node
                    .map(|db_node| db_node.node_type)
                    .unwrap_or(NodeType::Unknown);
            }
        }
    }

    Ok(tree)
}
