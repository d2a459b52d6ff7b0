//! Propagation executor.
//!
//! Applies the ordered plan one operation at a time: resolves the concrete
//! local path and remote parent, pre-checks the target, runs the matching
//! job, and commits the outcome to the sync DB immediately so progress
//! never regresses. Transient errors retry with backoff; items that keep
//! failing move to the temporary blacklist; disk-full, quota, and DB
//! errors stop the pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use watchfs::Fs;

use crate::blacklist::TmpBlacklist;
use crate::db::{DbNode, NodeStatus, SyncDb};
use crate::error::{
    report, ErrorSink, ExitCause, ExitCode, ExitInfo, SyncError, SyncResult,
};
use crate::jobs::manager::JobManager;
use crate::jobs::network::{
    DownloadJob, DownloadTarget, RemoteCreateDirJob, RemoteDeleteJob, RemoteMoveJob, UploadJob,
    UploadSession, UPLOAD_SESSION_THRESHOLD,
};
use crate::jobs::{local, run_sync};
use crate::reconcile::{SyncOp, SyncOpType};
use crate::remote_api::{DriveApi, RemoteItem};
use crate::snapshot::{ConstSnapshot, LiveSnapshot, SnapshotItem};
use crate::types::{NodeId, NodeType, ReplicaSide, SyncPath};
use crate::vfs::{Vfs, VfsStatus};

/// Retries for transient (network, rate-limit) errors per operation.
const MAX_TRANSIENT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Network failures in one pass before the worker pool is shrunk.
const NETWORK_FAILURES_BEFORE_SHRINK: u32 = 5;

/// Result of one executed pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub completed: usize,
    pub skipped: usize,
    /// Another pass should run immediately (blacklist additions or
    /// conflict renames changed the ground truth).
    pub restart: bool,
}

pub struct Executor {
    fs: Arc<Fs>,
    api: Arc<dyn DriveApi>,
    vfs: Arc<dyn Vfs>,
    db: Arc<SyncDb>,
    manager: Arc<JobManager>,
    blacklist: Arc<TmpBlacklist>,
    errors: ErrorSink,
    local_root: PathBuf,
    remote_root_id: NodeId,
    session_parallelism: usize,
    /// Live snapshots of the observers. Every applied operation is folded
    /// into them immediately, so the next pass never mistakes its own
    /// output for a remote deletion while the observers catch up.
    local_live: LiveSnapshot,
    remote_live: LiveSnapshot,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<Fs>,
        api: Arc<dyn DriveApi>,
        vfs: Arc<dyn Vfs>,
        db: Arc<SyncDb>,
        manager: Arc<JobManager>,
        blacklist: Arc<TmpBlacklist>,
        errors: ErrorSink,
        local_root: PathBuf,
        remote_root_id: NodeId,
        local_live: LiveSnapshot,
        remote_live: LiveSnapshot,
    ) -> Self {
        Self {
            fs,
            api,
            vfs,
            db,
            manager,
            blacklist,
            errors,
            local_root,
            remote_root_id,
            session_parallelism: 3,
            local_live,
            remote_live,
        }
    }

    fn fold_remote_item(&self, item: &RemoteItem) {
        let snapshot_item = SnapshotItem::new(
            item.id.clone(),
            item.parent_id.clone(),
            &item.name,
            item.node_type,
        )
        .with_size(item.size)
        .with_times(item.created_at, item.modified_at)
        .with_can_write(item.can_write);
        if let Err(exit) = self.remote_live.insert(snapshot_item) {
            log::debug!("Could not fold remote item into live snapshot: {}", exit);
        }
    }

    fn fold_local_path(&self, path: &SyncPath, node_type: NodeType) {
        let abs = self.local_abs(path);
        let Ok(meta) = self.fs.metadata(&abs) else {
            return;
        };
        let parent_id = match path.parent() {
            Some(parent) if !parent.is_root() => match self.local_live.item_id_at(&parent) {
                Some(id) => id,
                None => return,
            },
            _ => self.local_live.root_id(),
        };

        let item = SnapshotItem::new(
            NodeId::from(meta.file_id),
            parent_id,
            path.name(),
            node_type,
        )
        .with_size(meta.size as i64)
        .with_times(meta.created, meta.modified)
        .with_can_write(!meta.readonly);
        if let Err(exit) = self.local_live.insert(item) {
            log::debug!("Could not fold local item into live snapshot: {}", exit);
        }
    }

    /// Apply an ordered plan. The frozen snapshots provide the identities
    /// the DB does not know yet (new local inodes, new remote ids for
    /// pseudo-conflicts).
    pub fn run_plan(
        &self,
        plan: &[SyncOp],
        local_snapshot: &ConstSnapshot,
        remote_snapshot: &ConstSnapshot,
    ) -> SyncResult<PassReport> {
        let mut pass = PassReport::default();
        let mut network_failures = 0u32;

        for op in plan {
            if self
                .blacklist
                .contains(op.source_side(), &op.node_id, &op.path)
            {
                pass.skipped += 1;
                continue;
            }

            let mut attempt = 0;
            let outcome = loop {
                match self.apply(op, local_snapshot, remote_snapshot) {
                    Err(exit) if exit.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                        attempt += 1;
                        log::debug!(
                            "Transient failure on {} (attempt {}): {}",
                            op.path,
                            attempt,
                            exit
                        );
                        std::thread::sleep(RETRY_DELAY);
                    }
                    other => break other,
                }
            };

            match outcome {
                Ok(()) => {
                    pass.completed += 1;
                    self.blacklist.record_success(op.source_side(), &op.node_id);
                    self.notify_vfs_synced(op);
                }
                Err(exit) if exit.stops_pass() => {
                    report(&self.errors, SyncError::sync(exit));
                    return Err(exit);
                }
                Err(exit) => {
                    if exit.code() == ExitCode::NetworkError {
                        network_failures += 1;
                        if network_failures >= NETWORK_FAILURES_BEFORE_SHRINK {
                            self.manager.decrease_capacity();
                            network_failures = 0;
                        }
                    }

                    pass.skipped += 1;
                    let blacklisted =
                        self.blacklist
                            .record_error(op.source_side(), &op.node_id, &op.path);
                    if blacklisted {
                        pass.restart = true;
                    }
                    report(
                        &self.errors,
                        SyncError::node(op.source_side(), op.path.clone(), exit)
                            .with_node_id(op.node_id.clone()),
                    );
                }
            }
        }

        Ok(pass)
    }

    fn local_abs(&self, path: &SyncPath) -> PathBuf {
        path.under(&self.local_root)
    }

    /// DB row at a relative path on one side, found by walking names.
    fn db_node_at(&self, path: &SyncPath, side: ReplicaSide) -> SyncResult<Option<DbNode>> {
        let mut parent_db_id = 0;
        let mut found = None;

        for component in path.as_path().components() {
            let name = component.as_os_str().to_string_lossy();
            match self.db.node_by_parent_and_name(parent_db_id, side, &name)? {
                Some(node) => {
                    parent_db_id = node.db_id;
                    found = Some(node);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    /// Remote id of the directory that will contain `path`. The callers
    /// pass local-sourced op paths, so the walk uses local names.
    fn remote_parent_id(&self, path: &SyncPath) -> SyncResult<NodeId> {
        let parent = path.parent().unwrap_or_default();
        if parent.is_root() {
            return Ok(self.remote_root_id.clone());
        }
        match self.db_node_at(&parent, ReplicaSide::Local)? {
            Some(node) => Ok(node.node_id_remote.clone()),
            None => Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::InvalidDestination,
            )),
        }
    }

    fn parent_db_id(&self, path: &SyncPath, side: ReplicaSide) -> SyncResult<i64> {
        let parent = path.parent().unwrap_or_default();
        if parent.is_root() {
            return Ok(0);
        }
        match self.db_node_at(&parent, side)? {
            Some(node) => Ok(node.db_id),
            None => Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::InvalidDestination,
            )),
        }
    }

    fn notify_vfs_synced(&self, op: &SyncOp) {
        let status = VfsStatus {
            is_placeholder: false,
            is_hydrated: true,
            is_syncing: false,
            progress: 100,
        };
        let _ = self
            .vfs
            .file_status_changed(&self.local_abs(&op.path), status);
    }

    fn apply(
        &self,
        op: &SyncOp,
        local_snapshot: &ConstSnapshot,
        remote_snapshot: &ConstSnapshot,
    ) -> SyncResult<()> {
        if op.omit {
            return self.apply_omitted(op, local_snapshot, remote_snapshot);
        }

        match (op.target_side, op.op_type) {
            (ReplicaSide::Remote, SyncOpType::Create) => self.remote_create(op, local_snapshot),
            (ReplicaSide::Remote, SyncOpType::Edit) => self.remote_edit(op),
            (ReplicaSide::Remote, SyncOpType::Move) => self.remote_move(op, local_snapshot),
            (ReplicaSide::Remote, SyncOpType::Delete) => self.remote_delete(op),
            (ReplicaSide::Local, SyncOpType::Create) => self.local_create(op, remote_snapshot),
            (ReplicaSide::Local, SyncOpType::Edit) => self.local_edit(op),
            (ReplicaSide::Local, SyncOpType::Move) => self.local_move(op),
            (ReplicaSide::Local, SyncOpType::Delete) => self.local_delete(op),
            (ReplicaSide::Unknown, _) => Err(ExitInfo::from(ExitCode::LogicError)),
        }
    }

    /// Pseudo-conflict: both replicas already hold the same state; only
    /// the DB needs to learn about it. The twin op on the other side finds
    /// the row already present and is a no-op.
    fn apply_omitted(
        &self,
        op: &SyncOp,
        local_snapshot: &ConstSnapshot,
        remote_snapshot: &ConstSnapshot,
    ) -> SyncResult<()> {
        let local_id = local_snapshot.item_id_at(&op.path);
        let remote_id = remote_snapshot.item_id_at(&op.path);
        let (Some(local_id), Some(remote_id)) = (local_id, remote_id) else {
            // One side disappeared since the freeze; the next pass
            // recomputes from fresh snapshots.
            return Ok(());
        };

        let local_item = local_snapshot.item(&local_id);
        let remote_item = remote_snapshot.item(&remote_id);

        if let Some(existing) = self.db.node_by_id(ReplicaSide::Local, &local_id)? {
            let mut updated = existing;
            if let Some(item) = local_item {
                updated.modified_local = item.modified;
                updated.size = item.size;
            }
            if let Some(item) = remote_item {
                updated.modified_remote = item.modified;
            }
            updated.node_id_remote = remote_id;
            updated.status = NodeStatus::Synced;
            self.db.update_node(&updated)?;
            return Ok(());
        }

        let parent_db_id = self.parent_db_id(&op.path, ReplicaSide::Local)?;
        self.db.insert_node(&DbNode {
            db_id: 0,
            parent_db_id,
            name_local: op.path.name().to_owned(),
            name_remote: op.path.name().to_owned(),
            node_id_local: local_id,
            node_id_remote: remote_id,
            created: op.created,
            modified_local: local_item.map(|item| item.modified).unwrap_or(op.modified),
            modified_remote: remote_item.map(|item| item.modified).unwrap_or(op.modified),
            size: op.size,
            node_type: op.node_type,
            checksum: None,
            status: NodeStatus::Synced,
        })?;
        Ok(())
    }

    fn commit_created(
        &self,
        op: &SyncOp,
        local_id: NodeId,
        remote: &RemoteItem,
        checksum: Option<String>,
        local_modified: i64,
    ) -> SyncResult<()> {
        let parent_db_id = self.parent_db_id(&op.path, ReplicaSide::Local)?;
        self.db.insert_node(&DbNode {
            db_id: 0,
            parent_db_id,
            name_local: op.path.name().to_owned(),
            name_remote: remote.name.clone(),
            node_id_local: local_id,
            node_id_remote: remote.id.clone(),
            created: remote.created_at,
            modified_local: local_modified,
            modified_remote: remote.modified_at,
            size: remote.size,
            node_type: op.node_type,
            checksum,
            status: NodeStatus::Synced,
        })?;
        self.fold_remote_item(remote);
        Ok(())
    }

    fn remote_create(&self, op: &SyncOp, local_snapshot: &ConstSnapshot) -> SyncResult<()> {
        let parent_id = self.remote_parent_id(&op.path)?;
        let local_abs = self.local_abs(&op.path);

        let local_id = local_snapshot
            .item_id_at(&op.path)
            .unwrap_or_else(|| op.node_id.clone());

        if op.node_type.is_directory() {
            let job = RemoteCreateDirJob::new(
                Arc::clone(&self.api),
                parent_id,
                op.path.name().to_owned(),
            );
            let exit = run_sync(&job);
            if !exit.is_ok() {
                return Err(exit);
            }
            let item = job
                .created_item()
                .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;
            return self.commit_created(op, local_id, &item, None, op.modified);
        }

        let meta = self.fs.metadata(&local_abs)?;
        if meta.size >= UPLOAD_SESSION_THRESHOLD {
            let session = UploadSession::for_create(
                Arc::clone(&self.api),
                Arc::clone(&self.fs),
                Arc::clone(&self.db),
                Arc::clone(&self.manager),
                local_abs,
                op.path.name().to_owned(),
                parent_id,
                op.created,
                op.modified,
                self.session_parallelism,
            );
            let exit = run_sync(&session);
            if !exit.is_ok() {
                return Err(exit);
            }
            let item = session
                .uploaded_item()
                .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;
            self.commit_created(op, local_id, &item, None, meta.modified)
        } else {
            let job = UploadJob::new(
                Arc::clone(&self.api),
                Arc::clone(&self.fs),
                local_abs,
                parent_id,
                op.path.name().to_owned(),
                op.created,
                op.modified,
            );
            let exit = run_sync(&job);
            if !exit.is_ok() {
                return Err(exit);
            }
            let item = job
                .uploaded_item()
                .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;
            self.commit_created(op, local_id, &item, job.content_hash(), meta.modified)
        }
    }

    fn remote_edit(&self, op: &SyncOp) -> SyncResult<()> {
        let Some(db_node) = self.db_node_at(&op.path, ReplicaSide::Local)? else {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::DbEntryNotFound));
        };

        let local_abs = self.local_abs(&op.path);
        let meta = self.fs.metadata(&local_abs)?;

        // Edits always go through a session: the unary upload endpoint is
        // create-only (`conflict=error`), while a session can address an
        // existing file id.
        let session = UploadSession::for_edit(
            Arc::clone(&self.api),
            Arc::clone(&self.fs),
            Arc::clone(&self.db),
            Arc::clone(&self.manager),
            local_abs,
            db_node.node_id_remote.clone(),
            meta.modified,
            self.session_parallelism,
        );
        let exit = run_sync(&session);
        if !exit.is_ok() {
            return Err(exit);
        }
        let item = session
            .uploaded_item()
            .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;

        let mut updated = db_node;
        updated.modified_local = meta.modified;
        updated.modified_remote = item.modified_at;
        updated.size = item.size;
        updated.status = NodeStatus::Synced;
        self.db.update_node(&updated)?;
        self.fold_remote_item(&item);
        Ok(())
    }

    fn remote_move(&self, op: &SyncOp, local_snapshot: &ConstSnapshot) -> SyncResult<()> {
        let from = op
            .from_path
            .as_ref()
            .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;

        let Some(db_node) = self.db_node_at(from, ReplicaSide::Local)? else {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::DbEntryNotFound));
        };

        let dest_parent = self.remote_parent_id(&op.path)?;
        let new_name = (db_node.name_remote != op.path.name()).then(|| op.path.name().to_owned());

        let job = RemoteMoveJob::new(
            Arc::clone(&self.api),
            db_node.node_id_remote.clone(),
            dest_parent.clone(),
            new_name,
        );
        let exit = run_sync(&job);

        if !exit.is_ok() {
            // The remote item may be gone (a resolved MoveDelete); the
            // move then degrades into a fresh upload at the destination.
            if exit.cause() == ExitCause::NotFound && !op.node_type.is_directory() {
                log::info!(
                    "Remote target of move {} is gone; restoring by upload",
                    op.path
                );
                self.db.delete_node(db_node.db_id)?;
                return self.remote_create(op, local_snapshot);
            }
            return Err(exit);
        }

        let remote_id = db_node.node_id_remote.clone();
        let mut updated = db_node;
        updated.parent_db_id = self.parent_db_id(&op.path, ReplicaSide::Local)?;
        updated.name_local = op.path.name().to_owned();
        updated.name_remote = op.path.name().to_owned();
        updated.status = NodeStatus::Synced;
        self.db.update_node(&updated)?;

        if let Some(mut item) = self.remote_live.item(&remote_id) {
            item.parent_id = dest_parent;
            item.name = op.path.name().to_owned();
            let _ = self.remote_live.insert(item);
        }
        Ok(())
    }

    fn remote_delete(&self, op: &SyncOp) -> SyncResult<()> {
        // The op originated on the local side, so its path is spelled with
        // local names.
        let Some(db_node) = self.db_node_at(&op.path, ReplicaSide::Local)? else {
            // Row already gone; converged.
            return Ok(());
        };

        let local_path = self
            .db
            .path_of(db_node.db_id, ReplicaSide::Local)?
            .unwrap_or_else(|| op.path.clone());

        let job = RemoteDeleteJob::new(
            Arc::clone(&self.api),
            Arc::clone(&self.fs),
            db_node.node_id_remote.clone(),
            self.local_abs(&local_path),
            db_node.node_id_local.clone(),
        );
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }

        self.db.delete_node(db_node.db_id)?;
        self.remote_live.remove(&db_node.node_id_remote);
        Ok(())
    }

    fn local_create(&self, op: &SyncOp, remote_snapshot: &ConstSnapshot) -> SyncResult<()> {
        let local_abs = self.local_abs(&op.path);

        let remote_id = remote_snapshot
            .item_id_at(&op.path)
            .unwrap_or_else(|| op.node_id.clone());
        let remote_item = remote_snapshot.item(&remote_id).map(|item| RemoteItem {
            id: remote_id.clone(),
            parent_id: item.parent_id.clone(),
            name: item.name.clone(),
            node_type: item.node_type,
            size: item.size,
            created_at: item.created,
            modified_at: item.modified,
            mime_type: None,
            can_write: item.can_write,
        });
        let remote_item = remote_item.unwrap_or(RemoteItem {
            id: remote_id.clone(),
            parent_id: NodeId::new(""),
            name: op.path.name().to_owned(),
            node_type: op.node_type,
            size: op.size,
            created_at: op.created,
            modified_at: op.modified,
            mime_type: None,
            can_write: true,
        });

        if op.node_type.is_directory() {
            let job = local::LocalCreateDirJob::new(Arc::clone(&self.fs), local_abs.clone());
            let exit = run_sync(&job);
            if !exit.is_ok() {
                return Err(exit);
            }
            let local_id = job.created_file_id()?;
            self.commit_created(op, local_id, &remote_item, None, op.modified)?;
            self.fold_local_path(&op.path, op.node_type);
            return Ok(());
        }

        let job = DownloadJob::new(
            Arc::clone(&self.api),
            Arc::clone(&self.fs),
            Arc::clone(&self.vfs),
            remote_id.clone(),
            local_abs.clone(),
            DownloadTarget::Create,
            op.size.max(0) as u64,
        );
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }

        let meta = self.fs.metadata(&local_abs)?;
        self.vfs.update_metadata(
            &local_abs,
            remote_item.created_at,
            remote_item.modified_at,
            remote_item.size,
            &remote_id,
        )?;
        self.commit_created(
            op,
            NodeId::from(meta.file_id),
            &remote_item,
            None,
            meta.modified,
        )?;
        self.fold_local_path(&op.path, op.node_type);
        Ok(())
    }

    fn local_edit(&self, op: &SyncOp) -> SyncResult<()> {
        let Some(db_node) = self.db_node_at(&op.path, ReplicaSide::Remote)? else {
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::DbEntryNotFound));
        };

        let local_abs = self.local_abs(&op.path);
        // A resolved EditDelete arrives here with the local file gone; the
        // edit then restores it.
        let target_kind = if self.fs.exists(&local_abs)? {
            DownloadTarget::Edit
        } else {
            DownloadTarget::Create
        };

        let job = DownloadJob::new(
            Arc::clone(&self.api),
            Arc::clone(&self.fs),
            Arc::clone(&self.vfs),
            db_node.node_id_remote.clone(),
            local_abs.clone(),
            target_kind,
            op.size.max(0) as u64,
        );
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }

        let meta = self.fs.metadata(&local_abs)?;
        let mut updated = db_node;
        updated.node_id_local = NodeId::from(meta.file_id);
        updated.modified_local = meta.modified;
        updated.modified_remote = op.modified;
        updated.size = meta.size as i64;
        updated.status = NodeStatus::Synced;
        self.db.update_node(&updated)?;
        self.fold_local_path(&op.path, op.node_type);
        Ok(())
    }

    fn local_move(&self, op: &SyncOp) -> SyncResult<()> {
        let from = op
            .from_path
            .as_ref()
            .ok_or_else(|| ExitInfo::from(ExitCode::LogicError))?;

        let from_abs = self.local_abs(from);
        let to_abs = self.local_abs(&op.path);

        let expected_id = if op.conflict_rename {
            // The conflict rename moves the file the local user just made;
            // its id comes straight from the op.
            op.node_id.clone()
        } else {
            match self.db_node_at(from, ReplicaSide::Remote)? {
                Some(db_node) => db_node.node_id_local.clone(),
                None => NodeId::from(self.fs.metadata(&from_abs)?.file_id),
            }
        };

        let job = local::LocalMoveJob::new(Arc::clone(&self.fs), from_abs, to_abs, expected_id);
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }

        if op.conflict_rename {
            // No DB row yet; the subsequent upload creates it.
            self.fold_local_path(&op.path, op.node_type);
            return Ok(());
        }

        if let Some(db_node) = self.db_node_at(from, ReplicaSide::Remote)? {
            let mut updated = db_node;
            updated.parent_db_id = self.parent_db_id(&op.path, ReplicaSide::Remote)?;
            updated.name_local = op.path.name().to_owned();
            updated.name_remote = op.path.name().to_owned();
            updated.status = NodeStatus::Synced;
            self.db.update_node(&updated)?;
        }
        self.fold_local_path(&op.path, op.node_type);
        Ok(())
    }

    fn local_delete(&self, op: &SyncOp) -> SyncResult<()> {
        let Some(db_node) = self.db_node_at(&op.path, ReplicaSide::Remote)? else {
            return Ok(());
        };

        let job = local::LocalDeleteJob::new(
            Arc::clone(&self.fs),
            self.local_abs(&op.path),
            db_node.node_id_local.clone(),
            op.node_type.is_directory(),
        );
        let exit = run_sync(&job);
        if !exit.is_ok() {
            return Err(exit);
        }

        self.db.delete_node(db_node.db_id)?;
        self.local_live.remove(&db_node.node_id_local);
        Ok(())
    }
}
