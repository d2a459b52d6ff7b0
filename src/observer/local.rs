//! Local filesystem observer.
//!
//! Enumerates the sync root once to build the initial snapshot, then keeps
//! it current from watcher events. The observer owns a worker thread; the
//! master worker reads the snapshot through [`LocalObserver::snapshot`]
//! and waits for quiescence before freezing it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use watchfs::{Fs, FsEvent, IoResultExt, WatcherFault};

use crate::blacklist::TmpBlacklist;
use crate::error::{report, ErrorSink, ExitCause, ExitCode, ExitInfo, SyncError, SyncResult};
use crate::exclusion::ExclusionTemplates;
use crate::snapshot::{LiveSnapshot, SnapshotItem};
use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath};

use super::InvalidationCounter;

/// State shared between the observer thread and the engine.
struct Shared {
    fs: Arc<Fs>,
    root: PathBuf,
    snapshot: LiveSnapshot,
    exclusions: Arc<ExclusionTemplates>,
    blacklist: Arc<TmpBlacklist>,
    errors: ErrorSink,
    invalidation: InvalidationCounter,
    last_change: Mutex<Instant>,
    sync_failed: AtomicBool,
}

pub struct LocalObserver {
    shared: Arc<Shared>,
    shutdown: Sender<()>,
    #[allow(unused)]
    thread: jod_thread::JoinHandle<()>,
}

impl LocalObserver {
    /// Start observing `root`. The fault receiver comes from the watcher
    /// backend when one exists; pass `None` for backends that cannot lose
    /// events (in-memory).
    pub fn start(
        fs: Arc<Fs>,
        root: PathBuf,
        expected_root_id: NodeId,
        exclusions: Arc<ExclusionTemplates>,
        blacklist: Arc<TmpBlacklist>,
        errors: ErrorSink,
        fault_receiver: Option<Receiver<WatcherFault>>,
    ) -> Self {
        let snapshot = LiveSnapshot::new(expected_root_id);
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
        let events = fs.event_receiver();
        let faults = fault_receiver.unwrap_or_else(crossbeam_channel::never);

        let shared = Arc::new(Shared {
            fs,
            root,
            snapshot,
            exclusions,
            blacklist,
            errors,
            invalidation: InvalidationCounter::new(),
            last_change: Mutex::new(Instant::now()),
            sync_failed: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = jod_thread::Builder::new()
            .name("keel-local-observer".to_owned())
            .spawn(move || {
                Self::run(thread_shared, events, faults, shutdown_receiver);
            })
            .expect("Could not start local observer thread");

        Self {
            shared,
            shutdown: shutdown_sender,
            thread,
        }
    }

    fn run(
        shared: Arc<Shared>,
        events: Receiver<FsEvent>,
        faults: Receiver<WatcherFault>,
        shutdown: Receiver<()>,
    ) {
        log::trace!("Local observer thread started");

        loop {
            if !shared.snapshot.is_valid() && !shared.sync_failed.load(Ordering::Acquire) {
                if let Err(exit) = shared.rebuild() {
                    log::error!("Local snapshot rebuild failed: {}", exit);
                    shared.fail_sync(exit);
                }
            }

            select! {
                recv(events) -> event => {
                    let Ok(event) = event else {
                        log::trace!("Event channel closed; local observer exiting");
                        return;
                    };
                    shared.handle_event(&event);
                    // Drain the burst so multi-event operations (renames)
                    // are folded into one revision window.
                    while let Ok(event) = events.try_recv() {
                        shared.handle_event(&event);
                    }
                },
                recv(faults) -> fault => {
                    if let Ok(fault) = fault {
                        log::warn!("Watcher fault, rebuilding local snapshot: {}", fault);
                        shared.snapshot.invalidate();
                        shared.blacklist.clear();
                    }
                },
                recv(shutdown) -> _ => {
                    log::trace!("Local observer shutdown signal received");
                    return;
                },
                default(Duration::from_millis(200)) => {},
            }
        }
    }

    pub fn snapshot(&self) -> &LiveSnapshot {
        &self.shared.snapshot
    }

    pub fn is_ready(&self) -> bool {
        self.shared.snapshot.is_valid() && !self.shared.sync_failed.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.shared.sync_failed.load(Ordering::Acquire)
    }

    /// Time since the last snapshot mutation.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_change.lock().unwrap().elapsed()
    }

    pub fn try_invalidate(&self) {
        if self.shared.invalidation.try_invalidate() {
            self.invalidate();
        }
    }

    pub fn invalidate(&self) {
        self.shared.snapshot.invalidate();
        self.shared.blacklist.clear();
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Shared {
    fn touch(&self) {
        *self.last_change.lock().unwrap() = Instant::now();
    }

    fn fail_sync(&self, exit: ExitInfo) {
        self.sync_failed.store(true, Ordering::Release);
        report(&self.errors, SyncError::sync(exit));
    }

    /// Full enumeration of the sync root.
    fn rebuild(&self) -> SyncResult<()> {
        log::debug!("Building local snapshot of {}", self.root.display());

        let root_meta = self.fs.metadata(&self.root).map_err(|_| {
            ExitInfo::new(ExitCode::SystemError, ExitCause::SyncDirAccessError)
        })?;
        let root_id = NodeId::from(root_meta.file_id);
        if root_id != self.snapshot.root_id() {
            return Err(ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirChanged));
        }

        self.enumerate(&self.root, &root_id)?;
        self.snapshot.set_valid();
        self.touch();
        log::debug!("Local snapshot valid, revision {}", self.snapshot.revision());
        Ok(())
    }

    fn enumerate(&self, dir: &Path, parent_id: &NodeId) -> SyncResult<()> {
        let entries = match self.fs.read_dir(dir).with_not_found()? {
            Some(entries) => entries,
            None => return Ok(()),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Skipping unreadable directory entry: {}", err);
                    continue;
                }
            };
            let path = entry.path().to_path_buf();
            let Some(rel) = self.relative(&path) else {
                continue;
            };
            if self.exclusions.is_excluded(&rel) {
                continue;
            }

            let meta = match self.fs.metadata(&path).with_not_found()? {
                Some(meta) => meta,
                None => continue,
            };

            let id = NodeId::from(meta.file_id);
            let node_type = if meta.is_file() {
                NodeType::File
            } else {
                NodeType::Directory
            };
            let name = rel.name().to_owned();

            let item = SnapshotItem::new(id.clone(), parent_id.clone(), &name, node_type)
                .with_size(meta.size as i64)
                .with_times(meta.created, meta.modified)
                .with_can_write(!meta.readonly);
            self.snapshot.insert(item)?;

            if node_type == NodeType::Directory {
                self.enumerate(&path, &id)?;
            }
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> Option<SyncPath> {
        path.strip_prefix(&self.root).ok().map(SyncPath::new)
    }

    fn handle_event(&self, event: &FsEvent) {
        if !self.snapshot.is_valid() {
            // Events observed during a rebuild are covered by the
            // enumeration itself.
            return;
        }

        let path = event.path().to_path_buf();
        if path == self.root {
            self.handle_root_event();
            return;
        }

        let Some(rel) = self.relative(&path) else {
            return;
        };

        // Any event touching a blacklisted item clears it for retry.
        self.blacklist.touch(ReplicaSide::Local, None, &rel);

        if self.exclusions.is_excluded(&rel) {
            if let Some(id) = self.snapshot.item_id_at(&rel) {
                self.snapshot.remove(&id);
                self.touch();
            }
            return;
        }

        let meta = match self.fs.metadata(&path) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                let exit = ExitInfo::new(ExitCode::SystemError, ExitCause::FileAccessError);
                report(
                    &self.errors,
                    SyncError::node(ReplicaSide::Local, rel.clone(), exit),
                );
                if let Some(id) = self.snapshot.item_id_at(&rel) {
                    self.blacklist.record_error(ReplicaSide::Local, &id, &rel);
                }
                return;
            }
            Err(err) => {
                log::warn!("Stat failed for {}: {}", path.display(), err);
                return;
            }
        };

        let Some(meta) = meta else {
            // Gone from disk; drop whatever lived at that path.
            if let Some(id) = self.snapshot.item_id_at(&rel) {
                self.snapshot.remove(&id);
                self.touch();
            }
            return;
        };

        let id = NodeId::from(meta.file_id);

        // Spurious edit: nothing the engine diffs on actually changed.
        if matches!(event, FsEvent::Write(_) | FsEvent::Rights(_)) {
            if let Some(existing) = self.snapshot.item(&id) {
                if existing.size == meta.size as i64
                    && existing.modified == meta.modified
                    && existing.can_write == !meta.readonly
                {
                    return;
                }
            }
        }

        self.blacklist.touch(ReplicaSide::Local, Some(&id), &rel);

        let Some(parent_id) = self.parent_id_of(&rel) else {
            // Parent missing from the snapshot; something got out of step.
            log::warn!("No snapshot parent for {}; requesting rebuild", rel);
            if self.invalidation.try_invalidate() {
                self.snapshot.invalidate();
                self.blacklist.clear();
            }
            return;
        };

        let node_type = if meta.is_file() {
            NodeType::File
        } else {
            NodeType::Directory
        };
        let known = self.snapshot.item(&id).is_some();

        let item = SnapshotItem::new(id.clone(), parent_id, rel.name(), node_type)
            .with_size(meta.size as i64)
            .with_times(meta.created, meta.modified)
            .with_can_write(!meta.readonly);

        if let Err(exit) = self.snapshot.insert(item) {
            log::warn!("Snapshot insert failed for {}: {}", rel, exit);
            return;
        }
        self.touch();

        // A directory that moved in from outside the root arrives as one
        // event; its contents need a manual enumeration.
        if node_type == NodeType::Directory && !known {
            if let Err(exit) = self.enumerate(&path, &id) {
                log::warn!("Enumeration of moved-in directory failed: {}", exit);
            }
        }
    }

    fn parent_id_of(&self, rel: &SyncPath) -> Option<NodeId> {
        match rel.parent() {
            None => Some(self.snapshot.root_id()),
            Some(parent) if parent.is_root() => Some(self.snapshot.root_id()),
            Some(parent) => self.snapshot.item_id_at(&parent),
        }
    }

    fn handle_root_event(&self) {
        match self.fs.metadata(&self.root) {
            Ok(meta) => {
                if NodeId::from(meta.file_id) != self.snapshot.root_id() {
                    self.fail_sync(ExitInfo::new(
                        ExitCode::InvalidSync,
                        ExitCause::SyncDirChanged,
                    ));
                }
            }
            Err(_) => {
                self.fail_sync(ExitInfo::new(
                    ExitCode::SystemError,
                    ExitCause::SyncDirAccessError,
                ));
            }
        }
    }
}
