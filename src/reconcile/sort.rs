//! Operation sorter.
//!
//! Produces a total order over the generated operations in which each one
//! is safe to apply when its turn comes:
//!
//! 1. a Create under a directory follows the Create of that directory;
//! 2. a Delete of a directory follows the Deletes of its descendants;
//! 3. a Move into a directory follows that directory's creation;
//! 4. a Move out of a directory precedes its parent's deletion;
//! 5. an Edit feeding a rename-to-final precedes the rename;
//! 6. an op vacating a path precedes the op that writes that path, so
//!    conflict-rename siblings sequence correctly.
//!
//! The constraints form a DAG (cycles are pre-broken by the conflict
//! resolver); a stable topological sort keeps unconstrained operations in
//! generation order, which keeps passes deterministic.

use std::collections::VecDeque;

use crate::types::SyncPath;

use super::generate::{SyncOp, SyncOpType};

fn occupies(op: &SyncOp) -> Option<&SyncPath> {
    match op.op_type {
        SyncOpType::Create | SyncOpType::Move => Some(&op.path),
        _ => None,
    }
}

fn vacates(op: &SyncOp) -> Option<&SyncPath> {
    match op.op_type {
        SyncOpType::Delete => Some(&op.path),
        SyncOpType::Move => op.from_path.as_ref(),
        _ => None,
    }
}

/// Whether `before` must be applied before `after`.
fn must_precede(before: &SyncOp, after: &SyncOp) -> bool {
    if before.omit || after.omit {
        return false;
    }
    // Operations on different replicas only interact through the conflict
    // rename: the local rename frees the file that a remote-targeting op
    // reads, and the local path a remote op writes into. Within one
    // replica the path algebra below applies.
    if before.target_side != after.target_side {
        if !before.conflict_rename {
            return false;
        }
        // The freed path is where the other side's content lands; the
        // rename's destination is what the upload of the renamed copy
        // reads from. Both wait for the rename.
        let frees = vacates(before)
            .is_some_and(|freed| after.path == *freed || after.path.starts_with(freed));
        let feeds = after.path == before.path || after.path.starts_with(&before.path);
        return frees || feeds;
    }

    // Rule 1 and 3: creating a container before anything lands inside it.
    if before.op_type == SyncOpType::Create && before.node_type.is_directory() {
        if let Some(occupied) = occupies(after) {
            if occupied.starts_with(&before.path) && *occupied != before.path {
                return true;
            }
        }
    }

    // Rule 2 and 4: empty a directory before deleting it.
    if after.op_type == SyncOpType::Delete && after.node_type.is_directory() {
        if let Some(vacated) = vacates(before) {
            if vacated.starts_with(&after.path) && *vacated != after.path {
                return true;
            }
        }
    }

    // Rule 5: content lands before the final rename consumes it.
    if before.op_type == SyncOpType::Edit && after.op_type == SyncOpType::Move {
        if let Some(from) = &after.from_path {
            if *from == before.path {
                return true;
            }
        }
    }

    // Rule 6: free a path before writing it.
    if let (Some(freed), Some(occupied)) = (vacates(before), occupies(after)) {
        if freed == occupied {
            return true;
        }
    }

    false
}

/// Stable topological sort of the plan. Ties resolve to generation order.
pub fn sort_operations(ops: Vec<SyncOp>) -> Vec<SyncOp> {
    let count = ops.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];

    for before in 0..count {
        for after in 0..count {
            if before != after && must_precede(&ops[before], &ops[after]) {
                successors[before].push(after);
                in_degree[after] += 1;
            }
        }
    }

    // Kahn's algorithm over an index-ordered ready queue keeps the sort
    // stable with respect to generation order.
    let mut ready: VecDeque<usize> = (0..count).filter(|&index| in_degree[index] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &next in &successors[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                // Insert keeping the ready queue index-sorted.
                let position = ready
                    .iter()
                    .position(|&queued| queued > next)
                    .unwrap_or(ready.len());
                ready.insert(position, next);
            }
        }
    }

    if order.len() != count {
        // A cycle survived resolution; apply what sorted and let the next
        // pass converge the rest.
        log::error!(
            "Operation sorter found a residual cycle; deferring {} operations",
            count - order.len()
        );
    }

    let mut indexed: Vec<Option<SyncOp>> = ops.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|index| indexed[index].take().expect("each index sorted once"))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath};

    fn op(
        target: ReplicaSide,
        op_type: SyncOpType,
        path: &str,
        from: Option<&str>,
        node_type: NodeType,
    ) -> SyncOp {
        SyncOp {
            target_side: target,
            op_type,
            omit: false,
            node_id: NodeId::from(path),
            path: SyncPath::new(path),
            from_path: from.map(SyncPath::new),
            node_type,
            size: 0,
            created: 0,
            modified: 0,
            db_node_id: None,
            conflict_rename: false,
        }
    }

    fn position(ops: &[SyncOp], path: &str, op_type: SyncOpType) -> usize {
        ops.iter()
            .position(|op| op.path == SyncPath::new(path) && op.op_type == op_type)
            .unwrap()
    }

    #[test]
    fn child_create_follows_parent_create() {
        let ops = vec![
            op(ReplicaSide::Remote, SyncOpType::Create, "dir/a.txt", None, NodeType::File),
            op(ReplicaSide::Remote, SyncOpType::Create, "dir", None, NodeType::Directory),
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "dir", SyncOpType::Create)
                < position(&sorted, "dir/a.txt", SyncOpType::Create)
        );
    }

    #[test]
    fn directory_delete_follows_descendant_deletes() {
        let ops = vec![
            op(ReplicaSide::Local, SyncOpType::Delete, "dir", None, NodeType::Directory),
            op(ReplicaSide::Local, SyncOpType::Delete, "dir/a.txt", None, NodeType::File),
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "dir/a.txt", SyncOpType::Delete)
                < position(&sorted, "dir", SyncOpType::Delete)
        );
    }

    #[test]
    fn move_into_new_directory_follows_its_creation() {
        let ops = vec![
            op(
                ReplicaSide::Remote,
                SyncOpType::Move,
                "new/a.txt",
                Some("a.txt"),
                NodeType::File,
            ),
            op(ReplicaSide::Remote, SyncOpType::Create, "new", None, NodeType::Directory),
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "new", SyncOpType::Create)
                < position(&sorted, "new/a.txt", SyncOpType::Move)
        );
    }

    #[test]
    fn move_out_precedes_parent_delete() {
        let ops = vec![
            op(ReplicaSide::Remote, SyncOpType::Delete, "dir", None, NodeType::Directory),
            op(
                ReplicaSide::Remote,
                SyncOpType::Move,
                "saved.txt",
                Some("dir/a.txt"),
                NodeType::File,
            ),
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "saved.txt", SyncOpType::Move)
                < position(&sorted, "dir", SyncOpType::Delete)
        );
    }

    #[test]
    fn vacating_rename_precedes_occupying_create() {
        // Conflict-rename pattern: x.txt moves aside locally, then the
        // remote version lands at x.txt.
        let mut rename = op(
            ReplicaSide::Local,
            SyncOpType::Move,
            "x (Conflict 1).txt",
            Some("x.txt"),
            NodeType::File,
        );
        rename.conflict_rename = true;
        let ops = vec![
            op(ReplicaSide::Local, SyncOpType::Create, "x.txt", None, NodeType::File),
            rename,
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "x (Conflict 1).txt", SyncOpType::Move)
                < position(&sorted, "x.txt", SyncOpType::Create)
        );
    }

    #[test]
    fn conflict_rename_precedes_cross_side_upload() {
        let mut rename = op(
            ReplicaSide::Local,
            SyncOpType::Move,
            "x (Conflict 1).txt",
            Some("x.txt"),
            NodeType::File,
        );
        rename.conflict_rename = true;
        let ops = vec![
            op(
                ReplicaSide::Remote,
                SyncOpType::Create,
                "x (Conflict 1).txt",
                None,
                NodeType::File,
            ),
            rename,
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "x (Conflict 1).txt", SyncOpType::Move)
                < position(&sorted, "x (Conflict 1).txt", SyncOpType::Create)
        );
    }

    #[test]
    fn edit_precedes_rename_that_consumes_it() {
        let ops = vec![
            op(
                ReplicaSide::Local,
                SyncOpType::Move,
                "final.txt",
                Some("part.txt"),
                NodeType::File,
            ),
            op(ReplicaSide::Local, SyncOpType::Edit, "part.txt", None, NodeType::File),
        ];
        let sorted = sort_operations(ops);
        assert!(
            position(&sorted, "part.txt", SyncOpType::Edit)
                < position(&sorted, "final.txt", SyncOpType::Move)
        );
    }

    #[test]
    fn unconstrained_ops_keep_generation_order() {
        let ops = vec![
            op(ReplicaSide::Remote, SyncOpType::Create, "b.txt", None, NodeType::File),
            op(ReplicaSide::Remote, SyncOpType::Create, "a.txt", None, NodeType::File),
            op(ReplicaSide::Local, SyncOpType::Delete, "c.txt", None, NodeType::File),
        ];
        let sorted = sort_operations(ops);
        assert_eq!(sorted[0].path, SyncPath::new("b.txt"));
        assert_eq!(sorted[1].path, SyncPath::new("a.txt"));
        assert_eq!(sorted[2].path, SyncPath::new("c.txt"));
    }

    #[test]
    fn deep_tree_sorts_fully() {
        let ops = vec![
            op(ReplicaSide::Remote, SyncOpType::Create, "a/b/c/file.txt", None, NodeType::File),
            op(ReplicaSide::Remote, SyncOpType::Create, "a/b/c", None, NodeType::Directory),
            op(ReplicaSide::Remote, SyncOpType::Create, "a", None, NodeType::Directory),
            op(ReplicaSide::Remote, SyncOpType::Create, "a/b", None, NodeType::Directory),
        ];
        let sorted = sort_operations(ops);
        let a = position(&sorted, "a", SyncOpType::Create);
        let ab = position(&sorted, "a/b", SyncOpType::Create);
        let abc = position(&sorted, "a/b/c", SyncOpType::Create);
        let leaf = position(&sorted, "a/b/c/file.txt", SyncOpType::Create);
        assert!(a < ab && ab < abc && abc < leaf);
    }
}
