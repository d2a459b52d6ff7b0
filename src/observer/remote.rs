//! Remote snapshot observer.
//!
//! Bootstraps the snapshot from a paginated full listing (or resumes from
//! the cursor persisted in the sync DB), then long-polls the change feed.
//! When the drive reports that its history expired, the snapshot is
//! invalidated and rebuilt from a fresh bootstrap — rate-limited so a
//! misbehaving server cannot trigger a listing storm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};

use crate::blacklist::TmpBlacklist;
use crate::db::SyncDb;
use crate::error::{report, ErrorSink, ExitCause, SyncError, SyncResult};
use crate::jobs::network::{ContinueFileListJob, InitFileListJob};
use crate::jobs::run_sync;
use crate::remote_api::{DriveApi, RemoteChange, SnapshotMutation};
use crate::snapshot::{LiveSnapshot, SnapshotItem};
use crate::types::ReplicaSide;

use super::InvalidationCounter;

/// Page size of the bootstrap full listing.
pub const FULL_LISTING_LIMIT: usize = 1000;

/// At most this many full listings inside [`FULL_LISTING_WINDOW`].
const FULL_LISTING_MAX: usize = 3;
const FULL_LISTING_WINDOW: Duration = Duration::from_secs(600);

struct Shared {
    api: Arc<dyn DriveApi>,
    db: Arc<SyncDb>,
    snapshot: LiveSnapshot,
    blacklist: Arc<TmpBlacklist>,
    errors: ErrorSink,
    invalidation: InvalidationCounter,
    listing_times: Mutex<Vec<Instant>>,
    last_change: Mutex<Instant>,
    sync_failed: AtomicBool,
    poll_interval: Duration,
}

pub struct RemoteObserver {
    shared: Arc<Shared>,
    shutdown: Sender<()>,
    #[allow(unused)]
    thread: jod_thread::JoinHandle<()>,
}

impl RemoteObserver {
    pub fn start(
        api: Arc<dyn DriveApi>,
        db: Arc<SyncDb>,
        root_id: crate::types::NodeId,
        blacklist: Arc<TmpBlacklist>,
        errors: ErrorSink,
        poll_interval: Duration,
    ) -> Self {
        let snapshot = LiveSnapshot::new(root_id);
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);

        let shared = Arc::new(Shared {
            api,
            db,
            snapshot,
            blacklist,
            errors,
            invalidation: InvalidationCounter::new(),
            listing_times: Mutex::new(Vec::new()),
            last_change: Mutex::new(Instant::now()),
            sync_failed: AtomicBool::new(false),
            poll_interval,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = jod_thread::Builder::new()
            .name("keel-remote-observer".to_owned())
            .spawn(move || Self::run(thread_shared, shutdown_receiver))
            .expect("Could not start remote observer thread");

        Self {
            shared,
            shutdown: shutdown_sender,
            thread,
        }
    }

    fn run(shared: Arc<Shared>, shutdown: Receiver<()>) {
        log::trace!("Remote observer thread started");

        loop {
            if shared.sync_failed.load(Ordering::Acquire) {
                // Nothing to do until the engine resets us.
            } else if !shared.snapshot.is_valid() {
                match shared.bootstrap() {
                    Ok(()) => {}
                    Err(exit) => {
                        log::warn!("Remote bootstrap failed: {}", exit);
                        if exit.stops_pass() {
                            shared.sync_failed.store(true, Ordering::Release);
                            report(&shared.errors, SyncError::sync(exit));
                        }
                    }
                }
            } else if let Err(exit) = shared.poll_changes() {
                if exit.cause() == ExitCause::InvalidSnapshot {
                    log::warn!("Remote history lost; invalidating snapshot");
                    shared.snapshot.invalidate();
                    shared.blacklist.clear();
                    if let Err(exit) = shared.db.clear_listing_cursor() {
                        log::warn!("Could not clear listing cursor: {}", exit);
                    }
                } else {
                    log::debug!("Remote poll failed: {}", exit);
                }
            }

            select! {
                recv(shutdown) -> _ => {
                    log::trace!("Remote observer shutdown signal received");
                    return;
                },
                default(shared.poll_interval) => {},
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

    /// Sliding-window rate limit on full listings.
    fn may_run_full_listing(&self) -> bool {
        let mut times = self.listing_times.lock().unwrap();
        let now = Instant::now();
        times.retain(|&instant| now.duration_since(instant) < FULL_LISTING_WINDOW);
        if times.len() >= FULL_LISTING_MAX {
            return false;
        }
        times.push(now);
        true
    }

    fn bootstrap(&self) -> SyncResult<()> {
        if !self.may_run_full_listing() {
            log::warn!("Full listing rate limit reached; deferring rebuild");
            return Ok(());
        }

        log::debug!("Bootstrapping remote snapshot");
        let mut cursor: Option<String> = None;
        let mut deferred: Vec<SnapshotItem> = Vec::new();

        loop {
            let job = InitFileListJob::new(Arc::clone(&self.api), cursor.clone(), FULL_LISTING_LIMIT);
            let exit = run_sync(&job);
            if !exit.is_ok() {
                return Err(exit);
            }
            let page = job
                .take_page()
                .ok_or_else(|| crate::error::ExitInfo::from(crate::error::ExitCode::LogicError))?;

            for item in page.items {
                let snapshot_item = SnapshotItem::new(
                    item.id.clone(),
                    item.parent_id.clone(),
                    &item.name,
                    item.node_type,
                )
                .with_size(item.size)
                .with_times(item.created_at, item.modified_at)
                .with_can_write(item.can_write);

                // Listings carry no ordering guarantee; hold items whose
                // parent has not arrived yet.
                if self.snapshot.item(&item.parent_id).is_none() {
                    deferred.push(snapshot_item);
                } else if let Err(exit) = self.snapshot.insert(snapshot_item) {
                    log::warn!("Bootstrap insert failed for {}: {}", item.id, exit);
                }
            }

            if !page.has_more {
                // Settle deferred items now that the full listing is in.
                let mut remaining = deferred;
                loop {
                    let before = remaining.len();
                    remaining.retain(|item| {
                        if self.snapshot.item(&item.parent_id).is_some() {
                            let _ = self.snapshot.insert(item.clone());
                            false
                        } else {
                            true
                        }
                    });
                    if remaining.is_empty() || remaining.len() == before {
                        break;
                    }
                }
                for orphan in &remaining {
                    log::warn!("Remote listing orphan {} ignored", orphan.id);
                }

                self.db.set_listing_cursor(&page.cursor)?;
                self.snapshot.set_valid();
                self.touch();
                log::debug!(
                    "Remote snapshot valid with {} items",
                    self.snapshot.with(|snapshot| snapshot.len())
                );
                return Ok(());
            }
            cursor = Some(page.cursor);
        }
    }

    fn poll_changes(&self) -> SyncResult<()> {
        let Some(cursor) = self.db.listing_cursor()? else {
            // No cursor means we never bootstrapped; force one.
            self.snapshot.invalidate();
            return Ok(());
        };

        let job = ContinueFileListJob::new(Arc::clone(&self.api), cursor);
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }
        let batch = job
            .take_batch()
            .ok_or_else(|| crate::error::ExitInfo::from(crate::error::ExitCode::LogicError))?;

        for change in &batch.changes {
            self.apply_change(change);
        }
        if !batch.changes.is_empty() {
            self.touch();
        }
        self.db.set_listing_cursor(&batch.cursor)?;
        Ok(())
    }

    fn apply_change(&self, change: &RemoteChange) {
        let item = &change.item;

        if let Some(path) = self.snapshot.path_of(&item.id) {
            self.blacklist.touch(ReplicaSide::Remote, Some(&item.id), &path);
        }

        match change.action.mutation() {
            SnapshotMutation::Insert | SnapshotMutation::Update => {
                if self.snapshot.item(&item.parent_id).is_none() {
                    log::warn!(
                        "Change for {} references unknown parent {}; snapshot may have drifted",
                        item.id,
                        item.parent_id
                    );
                    if self.invalidation.try_invalidate() {
                        self.snapshot.invalidate();
                        self.blacklist.clear();
                    }
                    return;
                }

                let snapshot_item = SnapshotItem::new(
                    item.id.clone(),
                    item.parent_id.clone(),
                    &item.name,
                    item.node_type,
                )
                .with_size(item.size)
                .with_times(item.created_at, item.modified_at)
                .with_can_write(item.can_write);

                if let Err(exit) = self.snapshot.insert(snapshot_item) {
                    log::warn!("Remote change insert failed for {}: {}", item.id, exit);
                }
            }
            SnapshotMutation::Remove => {
                self.snapshot.remove(&item.id);
            }
            SnapshotMutation::UpdateRights => {
                if let Some(mut existing) = self.snapshot.item(&item.id) {
                    existing.can_write = item.can_write;
                    let _ = self.snapshot.update(existing);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::log_error_sink;
    use crate::remote_api::InMemoryDrive;
    use crate::types::{NodeId, SyncPath};

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "Timed out waiting for observer");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn start(drive: &InMemoryDrive, db: Arc<SyncDb>) -> RemoteObserver {
        RemoteObserver::start(
            Arc::new(drive.clone()),
            db,
            drive.root_id(),
            Arc::new(TmpBlacklist::new()),
            log_error_sink(),
            Duration::from_millis(30),
        )
    }

    #[test]
    fn bootstrap_builds_tree_from_listing() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        let dir = drive.remote_mkdir(&root, "docs");
        drive.remote_write(&dir, "a.txt", b"hello");

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let observer = start(&drive, Arc::clone(&db));
        wait_for(|| observer.is_ready());

        let id = observer
            .snapshot()
            .item_id_at(&SyncPath::new("docs/a.txt"))
            .unwrap();
        assert_eq!(observer.snapshot().item(&id).unwrap().size, 5);
        assert!(db.listing_cursor().unwrap().is_some());
        observer.stop();
    }

    #[test]
    fn long_poll_applies_creates_and_deletes() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let observer = start(&drive, db);
        wait_for(|| observer.is_ready());

        let id = drive.remote_write(&root, "new.txt", b"x");
        wait_for(|| {
            observer
                .snapshot()
                .item_id_at(&SyncPath::new("new.txt"))
                .is_some()
        });

        drive.remote_delete(&id);
        wait_for(|| {
            observer
                .snapshot()
                .item_id_at(&SyncPath::new("new.txt"))
                .is_none()
        });
        observer.stop();
    }

    #[test]
    fn moves_relocate_items_in_snapshot() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        let dir = drive.remote_mkdir(&root, "dest");
        let file = drive.remote_write(&root, "a.txt", b"x");

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let observer = start(&drive, db);
        wait_for(|| observer.is_ready());

        drive.remote_move(&file, &dir, Some("b.txt"));
        wait_for(|| {
            observer
                .snapshot()
                .item_id_at(&SyncPath::new("dest/b.txt"))
                .is_some()
        });
        assert!(observer
            .snapshot()
            .item_id_at(&SyncPath::new("a.txt"))
            .is_none());
        observer.stop();
    }

    #[test]
    fn lost_history_forces_rebuild() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        drive.remote_write(&root, "keep.txt", b"x");

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let observer = start(&drive, Arc::clone(&db));
        wait_for(|| observer.is_ready());

        // Invalidate the server-side history; the next poll fails and the
        // observer rebuilds from a fresh bootstrap.
        drive.remote_write(&root, "added.txt", b"y");
        drive.expire_history();
        wait_for(|| {
            observer.is_ready()
                && observer
                    .snapshot()
                    .item_id_at(&SyncPath::new("added.txt"))
                    .is_some()
        });
        observer.stop();
    }

    #[test]
    fn root_id_matches_drive_root() {
        let drive = InMemoryDrive::new();
        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let observer = start(&drive, db);
        wait_for(|| observer.is_ready());
        assert_eq!(observer.snapshot().root_id(), NodeId::from("drive-root"));
        observer.stop();
    }
}
