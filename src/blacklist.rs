//! Temporary blacklist of items that keep failing.
//!
//! The executor counts consecutive errors per item; once the count reaches
//! the threshold the item is blacklisted and skipped until the next full
//! snapshot rebuild. Any filesystem event that touches a blacklisted item
//! removes it so the following pass retries.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::{NodeId, ReplicaSide, SyncPath};

/// Consecutive errors before an item is blacklisted.
pub const BLACKLIST_THRESHOLD: u32 = 3;

#[derive(Default)]
struct Inner {
    error_counts: HashMap<(ReplicaSide, NodeId), u32>,
    by_id: HashSet<(ReplicaSide, NodeId)>,
    by_path: HashSet<(ReplicaSide, SyncPath)>,
}

/// Per-sync temporary blacklist, shared between the executor (writes) and
/// the pipeline stages (reads).
#[derive(Default)]
pub struct TmpBlacklist {
    inner: Mutex<Inner>,
    threshold: u32,
}

impl TmpBlacklist {
    pub fn new() -> Self {
        Self::with_threshold(BLACKLIST_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            threshold,
        }
    }

    /// Record one more error for the item. Returns `true` if this error
    /// pushed the item onto the blacklist.
    pub fn record_error(&self, side: ReplicaSide, id: &NodeId, path: &SyncPath) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let count = inner
            .error_counts
            .entry((side, id.clone()))
            .and_modify(|count| *count += 1)
            .or_insert(1);

        if *count >= self.threshold {
            log::warn!(
                "Blacklisting {} item {} at {} after {} consecutive errors",
                side,
                id,
                path,
                count
            );
            inner.by_id.insert((side, id.clone()));
            inner.by_path.insert((side, path.clone()));
            true
        } else {
            false
        }
    }

    /// Reset the consecutive-error count after a success.
    pub fn record_success(&self, side: ReplicaSide, id: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.error_counts.remove(&(side, id.clone()));
    }

    pub fn contains_id(&self, side: ReplicaSide, id: &NodeId) -> bool {
        self.inner.lock().unwrap().by_id.contains(&(side, id.clone()))
    }

    pub fn contains_path(&self, side: ReplicaSide, path: &SyncPath) -> bool {
        self.inner
            .lock()
            .unwrap()
            .by_path
            .contains(&(side, path.clone()))
    }

    pub fn contains(&self, side: ReplicaSide, id: &NodeId, path: &SyncPath) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.by_id.contains(&(side, id.clone())) || inner.by_path.contains(&(side, path.clone()))
    }

    /// A filesystem event touched the item; forget it so the next pass
    /// retries.
    pub fn touch(&self, side: ReplicaSide, id: Option<&NodeId>, path: &SyncPath) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = id {
            inner.by_id.remove(&(side, id.clone()));
            inner.error_counts.remove(&(side, id.clone()));
        }
        inner.by_path.remove(&(side, path.clone()));
    }

    /// Cleared on every full snapshot rebuild.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.error_counts.clear();
        inner.by_id.clear();
        inner.by_path.clear();
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.by_id.is_empty() && inner.by_path.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blacklists_after_threshold_consecutive_errors() {
        let blacklist = TmpBlacklist::with_threshold(3);
        let id = NodeId::from("n1");
        let path = SyncPath::new("dir/a.txt");

        assert!(!blacklist.record_error(ReplicaSide::Local, &id, &path));
        assert!(!blacklist.record_error(ReplicaSide::Local, &id, &path));
        assert!(!blacklist.contains(ReplicaSide::Local, &id, &path));

        assert!(blacklist.record_error(ReplicaSide::Local, &id, &path));
        assert!(blacklist.contains(ReplicaSide::Local, &id, &path));
        assert!(blacklist.contains_path(ReplicaSide::Local, &path));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let blacklist = TmpBlacklist::with_threshold(2);
        let id = NodeId::from("n1");
        let path = SyncPath::new("a.txt");

        blacklist.record_error(ReplicaSide::Remote, &id, &path);
        blacklist.record_success(ReplicaSide::Remote, &id);
        assert!(!blacklist.record_error(ReplicaSide::Remote, &id, &path));
        assert!(blacklist.record_error(ReplicaSide::Remote, &id, &path));
    }

    #[test]
    fn touch_removes_entry_for_retry() {
        let blacklist = TmpBlacklist::with_threshold(1);
        let id = NodeId::from("n1");
        let path = SyncPath::new("a.txt");

        blacklist.record_error(ReplicaSide::Local, &id, &path);
        assert!(blacklist.contains(ReplicaSide::Local, &id, &path));

        blacklist.touch(ReplicaSide::Local, Some(&id), &path);
        assert!(!blacklist.contains(ReplicaSide::Local, &id, &path));
    }

    #[test]
    fn sides_are_independent() {
        let blacklist = TmpBlacklist::with_threshold(1);
        let id = NodeId::from("n1");
        let path = SyncPath::new("a.txt");

        blacklist.record_error(ReplicaSide::Local, &id, &path);
        assert!(!blacklist.contains(ReplicaSide::Remote, &id, &path));
    }

    #[test]
    fn clear_empties_everything() {
        let blacklist = TmpBlacklist::with_threshold(1);
        blacklist.record_error(
            ReplicaSide::Local,
            &NodeId::from("n1"),
            &SyncPath::new("a.txt"),
        );
        blacklist.clear();
        assert!(blacklist.is_empty());
    }
}
