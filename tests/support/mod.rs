//! Shared harness for end-to-end tests: an in-memory local filesystem and
//! an in-memory drive wired into a real engine, stepped deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use libkeel::{
    cache_dir, log_error_sink, EngineOptions, EngineParams, ExclusionTemplates, InMemoryDrive,
    JobManager, NodeId, NoopVfs, SyncDb, SyncEngine,
};
use watchfs::{Fs, InMemoryFs};

pub const LOCAL_ROOT: &str = "/local";

pub struct Harness {
    pub drive: InMemoryDrive,
    pub fs: Arc<Fs>,
    pub db: Arc<SyncDb>,
    pub manager: Arc<JobManager>,
    pub engine: SyncEngine,
}

impl Harness {
    pub fn new() -> Self {
        let drive = InMemoryDrive::new();
        let fs = Arc::new(Fs::new(InMemoryFs::new()));
        fs.create_dir_all(LOCAL_ROOT).unwrap();
        fs.create_dir_all(cache_dir()).unwrap();

        let db = Arc::new(SyncDb::open_in_memory().unwrap());
        let manager = JobManager::with_capacity(4);

        let local_root_id = NodeId::from(fs.metadata(LOCAL_ROOT).unwrap().file_id);

        let engine = SyncEngine::new(EngineParams {
            fs: Arc::clone(&fs),
            api: Arc::new(drive.clone()),
            vfs: Arc::new(NoopVfs),
            db: Arc::clone(&db),
            manager: Arc::clone(&manager),
            errors: log_error_sink(),
            local_root: LOCAL_ROOT.into(),
            local_root_id,
            remote_root_id: drive.root_id(),
            exclusions: Arc::new(ExclusionTemplates::builtin()),
            fault_receiver: None,
            options: EngineOptions {
                quiescence: Duration::from_millis(50),
                remote_poll: Duration::from_millis(25),
                loop_interval: Duration::from_millis(25),
                network_backoff: Duration::from_millis(100),
            },
        })
        .unwrap();

        // Pin the conflict clock so conflict names are stable.
        engine.set_clock(Box::new(|| 1111));

        assert!(
            engine.wait_for_observers(Duration::from_secs(10)),
            "observers never became ready"
        );

        Self {
            drive,
            fs,
            db,
            manager,
            engine,
        }
    }

    /// Wait until a condition holds, polling; fails the test on timeout.
    pub fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Give both observers time to absorb outstanding changes.
    pub fn settle(&self) {
        std::thread::sleep(Duration::from_millis(200));
        self.engine.wait_for_quiescence();
    }

    /// Settle, then run passes until the replicas converge.
    pub fn sync(&self) {
        self.settle();
        self.engine
            .sync_until_converged(6)
            .expect("sync pass failed");
    }

    pub fn local_path(&self, rel: &str) -> String {
        format!("{LOCAL_ROOT}/{rel}")
    }

    pub fn local_read(&self, rel: &str) -> Vec<u8> {
        self.fs.read(self.local_path(rel)).unwrap()
    }

    pub fn local_exists(&self, rel: &str) -> bool {
        self.fs.exists(self.local_path(rel)).unwrap()
    }

    pub fn remote_read(&self, path: &str) -> Option<Vec<u8>> {
        let item = self.drive.item_at_path(path)?;
        self.drive.content(&item.id)
    }

    pub fn remote_exists(&self, path: &str) -> bool {
        self.drive.item_at_path(path).is_some()
    }
}
