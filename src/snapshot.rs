//! In-memory replica snapshots.
//!
//! A [`LiveSnapshot`] is the mutable, versioned picture of one replica that
//! an observer maintains from change events. At each pipeline pass the
//! master worker freezes it into a [`ConstSnapshot`] that the reconciliation
//! stages read without taking the observer's lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::types::{normalize_name, NodeId, NodeType, SyncPath, SyncTime};

/// The unit stored in a snapshot. `name` is a single NFC-normalized
/// component; the item's path is derived by walking `parent_id` links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub created: SyncTime,
    pub modified: SyncTime,
    pub node_type: NodeType,
    pub size: i64,
    pub is_link: bool,
    pub can_write: bool,
    /// For directories: whether the subtree has been fully enumerated.
    pub fully_enumerated: bool,
}

impl SnapshotItem {
    pub fn new(id: NodeId, parent_id: NodeId, name: &str, node_type: NodeType) -> Self {
        Self {
            id,
            parent_id,
            name: normalize_name(name),
            created: 0,
            modified: 0,
            node_type,
            size: 0,
            is_link: false,
            can_write: true,
            fully_enumerated: true,
        }
    }

    pub fn with_times(mut self, created: SyncTime, modified: SyncTime) -> Self {
        self.created = created;
        self.modified = modified;
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_can_write(mut self, can_write: bool) -> Self {
        self.can_write = can_write;
        self
    }
}

/// Tree contents shared by live and frozen snapshots.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root_id: NodeId,
    items: HashMap<NodeId, SnapshotItem>,
    /// `(parent_id, NFC name) → id`. Unique by snapshot invariant.
    name_index: HashMap<(NodeId, String), NodeId>,
    children: HashMap<NodeId, HashSet<NodeId>>,
}

impl Snapshot {
    pub fn new(root_id: NodeId) -> Self {
        let mut items = HashMap::new();
        items.insert(
            root_id.clone(),
            SnapshotItem::new(root_id.clone(), root_id.clone(), "", NodeType::Directory),
        );

        Self {
            root_id: root_id.clone(),
            items,
            name_index: HashMap::new(),
            children: HashMap::from([(root_id, HashSet::new())]),
        }
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.len() <= 1
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.items.contains_key(id)
    }

    pub fn item(&self, id: &NodeId) -> Option<&SnapshotItem> {
        self.items.get(id)
    }

    pub fn child_id(&self, parent_id: &NodeId, name: &str) -> Option<&NodeId> {
        self.name_index
            .get(&(parent_id.clone(), normalize_name(name)))
    }

    pub fn children_of<'s>(&'s self, id: &NodeId) -> impl Iterator<Item = &'s SnapshotItem> + 's {
        let children = self.children.get(id);
        children
            .into_iter()
            .flatten()
            .filter_map(move |child| self.items.get(child))
    }

    /// Resolve a relative path to an item id, component by component.
    pub fn item_id_at(&self, path: &SyncPath) -> Option<NodeId> {
        let mut current = self.root_id.clone();
        for component in path.as_path().components() {
            let name = component.as_os_str().to_str()?;
            current = self.child_id(&current, name)?.clone();
        }
        Some(current)
    }

    /// Reconstruct the relative path of an item by walking parent links.
    pub fn path_of(&self, id: &NodeId) -> Option<SyncPath> {
        if *id == self.root_id {
            return Some(SyncPath::root());
        }

        let mut components = Vec::new();
        let mut current = self.items.get(id)?;
        loop {
            components.push(current.name.clone());
            if current.parent_id == self.root_id {
                break;
            }
            current = self.items.get(&current.parent_id)?;
        }

        let mut path = SyncPath::root();
        for name in components.iter().rev() {
            path = path.join(name);
        }
        Some(path)
    }

    /// Insert or replace an item. The parent must exist and be a directory.
    /// If another id occupies `(parent, name)`, that occupant's subtree is
    /// evicted first; the caller observed the filesystem contradicting it.
    pub fn insert(&mut self, item: SnapshotItem) -> SyncResult<()> {
        if item.id == self.root_id {
            return Err(ExitInfo::new(ExitCode::LogicError, ExitCause::InvalidName));
        }

        match self.items.get(&item.parent_id) {
            Some(parent) if parent.node_type.is_directory() => {}
            _ => {
                return Err(ExitInfo::new(
                    ExitCode::DataError,
                    ExitCause::InvalidSnapshot,
                ));
            }
        }

        if let Some(occupant) = self
            .name_index
            .get(&(item.parent_id.clone(), item.name.clone()))
            .cloned()
        {
            if occupant != item.id {
                self.remove(&occupant);
            }
        }

        if let Some(previous) = self.items.get(&item.id).cloned() {
            // Same id at a new location: detach the old index entries but
            // keep the subtree attached to the (moved) item.
            self.name_index
                .remove(&(previous.parent_id.clone(), previous.name.clone()));
            if let Some(siblings) = self.children.get_mut(&previous.parent_id) {
                siblings.remove(&item.id);
            }
        } else {
            self.children.insert(item.id.clone(), HashSet::new());
        }

        self.name_index
            .insert((item.parent_id.clone(), item.name.clone()), item.id.clone());
        self.children
            .entry(item.parent_id.clone())
            .or_default()
            .insert(item.id.clone());
        self.items.insert(item.id.clone(), item);
        Ok(())
    }

    /// Update an existing item in place without moving it.
    pub fn update(&mut self, item: SnapshotItem) -> SyncResult<()> {
        match self.items.get(&item.id) {
            Some(existing) if existing.parent_id == item.parent_id && existing.name == item.name => {
                self.items.insert(item.id.clone(), item);
                Ok(())
            }
            Some(_) => self.insert(item),
            None => Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::InvalidSnapshot,
            )),
        }
    }

    /// Remove an item and its whole subtree. Removing the root or an absent
    /// id is a no-op.
    pub fn remove(&mut self, id: &NodeId) {
        if *id == self.root_id || !self.items.contains_key(id) {
            return;
        }

        // Detach from the parent's child set before dropping the subtree.
        if let Some(item) = self.items.get(id) {
            let parent = item.parent_id.clone();
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(id);
            }
        }

        let mut queue = VecDeque::new();
        queue.push_back(id.clone());

        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children.remove(&current) {
                queue.extend(children);
            }
            if let Some(item) = self.items.remove(&current) {
                self.name_index.remove(&(item.parent_id, item.name));
            }
        }
    }

    /// Preorder traversal of the whole tree, root first.
    pub fn preorder(&self) -> Preorder<'_> {
        let mut queue = VecDeque::new();
        queue.push_back(self.root_id.clone());
        Preorder {
            snapshot: self,
            queue,
        }
    }

    /// Every non-root id in the snapshot.
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.items.keys().filter(move |id| **id != self.root_id)
    }

    /// Verify structural invariants; used by property tests and after
    /// rebuilds. Returns the rebuilt reverse index for comparison.
    pub fn rebuilt_name_index(&self) -> HashMap<(NodeId, String), NodeId> {
        let mut index = HashMap::new();
        for (id, item) in &self.items {
            if *id == self.root_id {
                continue;
            }
            index.insert((item.parent_id.clone(), item.name.clone()), id.clone());
        }
        index
    }

    pub fn name_index(&self) -> &HashMap<(NodeId, String), NodeId> {
        &self.name_index
    }
}

pub struct Preorder<'a> {
    snapshot: &'a Snapshot,
    queue: VecDeque<NodeId>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = &'a SnapshotItem;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.queue.pop_front()?;
        let item = self.snapshot.items.get(&id)?;

        // Sort children by name for deterministic traversal order.
        let mut children: Vec<&SnapshotItem> = self.snapshot.children_of(&id).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children.iter().rev() {
            self.queue.push_front(child.id.clone());
        }

        Some(item)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotState {
    Invalid,
    Valid,
}

struct LiveInner {
    snapshot: Snapshot,
    state: SnapshotState,
    revision: u64,
}

/// The mutable, versioned snapshot owned by an observer. Cheap to clone;
/// clones share the same underlying tree.
#[derive(Clone)]
pub struct LiveSnapshot {
    inner: Arc<Mutex<LiveInner>>,
}

impl LiveSnapshot {
    pub fn new(root_id: NodeId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LiveInner {
                snapshot: Snapshot::new(root_id),
                state: SnapshotState::Invalid,
                revision: 0,
            })),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().unwrap().state == SnapshotState::Valid
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().unwrap().revision
    }

    /// Mark the snapshot usable after a full (re)build.
    pub fn set_valid(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SnapshotState::Valid;
        inner.revision += 1;
    }

    /// Drop all contents and mark the snapshot unusable until rebuilt.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        let root_id = inner.snapshot.root_id().clone();
        inner.snapshot = Snapshot::new(root_id);
        inner.state = SnapshotState::Invalid;
        inner.revision += 1;
    }

    pub fn insert(&self, item: SnapshotItem) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot.insert(item)?;
        inner.revision += 1;
        Ok(())
    }

    pub fn update(&self, item: SnapshotItem) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot.update(item)?;
        inner.revision += 1;
        Ok(())
    }

    pub fn remove(&self, id: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot.remove(id);
        inner.revision += 1;
    }

    pub fn item(&self, id: &NodeId) -> Option<SnapshotItem> {
        self.inner.lock().unwrap().snapshot.item(id).cloned()
    }

    pub fn item_id_at(&self, path: &SyncPath) -> Option<NodeId> {
        self.inner.lock().unwrap().snapshot.item_id_at(path)
    }

    pub fn path_of(&self, id: &NodeId) -> Option<SyncPath> {
        self.inner.lock().unwrap().snapshot.path_of(id)
    }

    pub fn root_id(&self) -> NodeId {
        self.inner.lock().unwrap().snapshot.root_id().clone()
    }

    /// Freeze the current contents into an immutable copy for one pipeline
    /// pass. Fails while the snapshot is invalid.
    pub fn freeze(&self) -> SyncResult<ConstSnapshot> {
        let inner = self.inner.lock().unwrap();
        if inner.state != SnapshotState::Valid {
            return Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::InvalidSnapshot,
            ));
        }
        Ok(ConstSnapshot {
            snapshot: Arc::new(inner.snapshot.clone()),
            revision: inner.revision,
        })
    }

    /// Run a closure over the underlying snapshot while holding its lock.
    pub fn with<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(&inner.snapshot)
    }
}

/// Immutable snapshot read by the reconciliation pipeline.
#[derive(Clone)]
pub struct ConstSnapshot {
    snapshot: Arc<Snapshot>,
    revision: u64,
}

impl ConstSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn inner(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl std::ops::Deref for ConstSnapshot {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(id: &str, parent: &str, name: &str, node_type: NodeType) -> SnapshotItem {
        SnapshotItem::new(NodeId::from(id), NodeId::from(parent), name, node_type)
    }

    fn sample_live() -> LiveSnapshot {
        let live = LiveSnapshot::new(NodeId::from("root"));
        live.insert(item("d1", "root", "dir", NodeType::Directory))
            .unwrap();
        live.insert(item("f1", "d1", "a.txt", NodeType::File))
            .unwrap();
        live.insert(item("f2", "d1", "b.txt", NodeType::File))
            .unwrap();
        live.set_valid();
        live
    }

    #[test]
    fn path_resolution_round_trips() {
        let live = sample_live();
        let path = SyncPath::new("dir/a.txt");

        let id = live.item_id_at(&path).unwrap();
        assert_eq!(id, NodeId::from("f1"));
        assert_eq!(live.path_of(&id).unwrap(), path);
    }

    #[test]
    fn missing_path_resolves_to_none() {
        let live = sample_live();
        assert!(live.item_id_at(&SyncPath::new("dir/missing.txt")).is_none());
    }

    #[test]
    fn insert_evicts_occupant_with_different_id() {
        let live = sample_live();
        live.insert(item("f9", "d1", "a.txt", NodeType::File))
            .unwrap();

        assert_eq!(
            live.item_id_at(&SyncPath::new("dir/a.txt")).unwrap(),
            NodeId::from("f9")
        );
        assert!(live.item(&NodeId::from("f1")).is_none());
    }

    #[test]
    fn remove_drops_subtree_and_index_entries() {
        let live = sample_live();
        live.remove(&NodeId::from("d1"));

        live.with(|snapshot| {
            assert!(!snapshot.contains(&NodeId::from("d1")));
            assert!(!snapshot.contains(&NodeId::from("f1")));
            assert!(!snapshot.contains(&NodeId::from("f2")));
            assert_eq!(snapshot.name_index().len(), 0);
        });
    }

    #[test]
    fn move_keeps_children_attached() {
        let live = sample_live();
        live.insert(item("d2", "root", "other", NodeType::Directory))
            .unwrap();

        // Move d1 under d2 with a new name.
        let mut moved = live.item(&NodeId::from("d1")).unwrap();
        moved.parent_id = NodeId::from("d2");
        moved.name = "renamed".into();
        live.insert(moved).unwrap();

        assert_eq!(
            live.item_id_at(&SyncPath::new("other/renamed/a.txt"))
                .unwrap(),
            NodeId::from("f1")
        );
        assert!(live.item_id_at(&SyncPath::new("dir")).is_none());
    }

    #[test]
    fn reverse_index_matches_rebuild_after_mutations() {
        let live = sample_live();
        live.insert(item("d2", "root", "other", NodeType::Directory))
            .unwrap();
        live.insert(item("f3", "d2", "c.txt", NodeType::File))
            .unwrap();
        live.remove(&NodeId::from("f2"));

        let mut moved = live.item(&NodeId::from("f1")).unwrap();
        moved.parent_id = NodeId::from("d2");
        live.insert(moved).unwrap();

        live.with(|snapshot| {
            assert_eq!(*snapshot.name_index(), snapshot.rebuilt_name_index());
        });
    }

    #[test]
    fn iterating_ids_reconstructs_exact_path_set() {
        let live = sample_live();
        live.with(|snapshot| {
            let mut paths: Vec<String> = snapshot
                .ids()
                .map(|id| snapshot.path_of(id).unwrap().to_string())
                .collect();
            paths.sort();
            assert_eq!(paths, vec!["/dir", "/dir/a.txt", "/dir/b.txt"]);
        });
    }

    #[test]
    fn freeze_fails_while_invalid() {
        let live = LiveSnapshot::new(NodeId::from("root"));
        assert!(live.freeze().is_err());
        live.set_valid();
        assert!(live.freeze().is_ok());
    }

    #[test]
    fn invalidate_then_rebuild_matches_live_state() {
        let live = sample_live();
        live.invalidate();
        assert!(!live.is_valid());

        live.insert(item("d1", "root", "dir", NodeType::Directory))
            .unwrap();
        live.insert(item("f1", "d1", "a.txt", NodeType::File))
            .unwrap();
        live.insert(item("f2", "d1", "b.txt", NodeType::File))
            .unwrap();
        live.set_valid();

        let frozen = live.freeze().unwrap();
        assert_eq!(frozen.len(), 4);
        assert_eq!(*frozen.name_index(), frozen.rebuilt_name_index());
    }

    #[test]
    fn frozen_copy_is_isolated_from_live_mutations() {
        let live = sample_live();
        let frozen = live.freeze().unwrap();

        live.remove(&NodeId::from("f1"));

        assert!(frozen.contains(&NodeId::from("f1")));
        assert!(live.item(&NodeId::from("f1")).is_none());
    }

    #[test]
    fn preorder_visits_parents_before_children() {
        let live = sample_live();
        live.with(|snapshot| {
            let order: Vec<String> = snapshot
                .preorder()
                .map(|item| item.name.clone())
                .collect();
            let dir_pos = order.iter().position(|name| name == "dir").unwrap();
            let file_pos = order.iter().position(|name| name == "a.txt").unwrap();
            assert!(dir_pos < file_pos);
        });
    }
}
