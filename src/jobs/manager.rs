//! Bounded, priority-scheduled worker pool.
//!
//! All asynchronous jobs of the process flow through one [`JobManager`].
//! The main loop runs on a dedicated thread: it starts queued jobs while
//! worker slots are available, always keeping one slot in reserve so the
//! single top-priority job can start even under full load, and re-checks
//! parked jobs whose precondition returned "not now".

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{run_sync, Job, JobId, JobPriority};

/// The pool never shrinks below this many workers.
pub const POOL_MIN_CAPACITY: usize = 2;
/// Upper bound on workers regardless of hardware concurrency.
pub const POOL_MAX_CAPACITY: usize = 12;

/// Main-loop tick.
const LOOP_SLEEP: Duration = Duration::from_millis(100);

type Callback = Box<dyn FnOnce(JobId) + Send>;

struct QueueEntry {
    priority: JobPriority,
    job_id: JobId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.job_id == other.job_id
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first; among equals, the smaller job id
        // wins so equal-priority jobs stay FIFO.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ManagerData {
    /// Queued + pending + running jobs, by id.
    managed: HashMap<JobId, Arc<dyn Job>>,
    priorities: HashMap<JobId, JobPriority>,
    callbacks: HashMap<JobId, Callback>,
    queued: BinaryHeap<QueueEntry>,
    running: HashSet<JobId>,
    pending: HashMap<JobId, JobPriority>,
}

impl ManagerData {
    fn queue(&mut self, job: Arc<dyn Job>, priority: JobPriority) {
        let job_id = job.state().id();
        self.managed.insert(job_id, job);
        self.priorities.insert(job_id, priority);
        self.queued.push(QueueEntry { priority, job_id });
    }

    fn pop(&mut self) -> Option<(Arc<dyn Job>, JobPriority)> {
        while let Some(entry) = self.queued.pop() {
            if let Some(job) = self.managed.get(&entry.job_id) {
                return Some((Arc::clone(job), entry.priority));
            }
            // Stale heap entry for an erased job; skip it.
        }
        None
    }

    fn has_queued(&self) -> bool {
        self.queued
            .peek()
            .is_some_and(|entry| self.managed.contains_key(&entry.job_id))
    }

    fn top_is_highest(&self) -> bool {
        self.queued
            .peek()
            .is_some_and(|entry| entry.priority == JobPriority::Highest)
    }

    fn erase(&mut self, job_id: JobId) -> Option<Callback> {
        self.managed.remove(&job_id);
        self.priorities.remove(&job_id);
        self.running.remove(&job_id);
        self.pending.remove(&job_id);
        self.callbacks.remove(&job_id)
    }
}

struct Shared {
    data: Mutex<ManagerData>,
    capacity: AtomicUsize,
    stop: AtomicBool,
}

impl Shared {
    fn available_workers(&self) -> usize {
        let running = self.data.lock().unwrap().running.len();
        self.capacity.load(Ordering::Relaxed).saturating_sub(running)
    }

    /// Remove the job from management and invoke the application callback.
    /// The framework erase always runs first.
    fn complete(&self, job_id: JobId) {
        let callback = self.data.lock().unwrap().erase(job_id);
        if let Some(callback) = callback {
            callback(job_id);
        }
    }

    fn start_job(self: &Arc<Self>, job: Arc<dyn Job>) {
        let job_id = job.state().id();

        if job.state().is_aborted() {
            log::debug!("Job {} has been canceled before start", job_id);
            self.complete(job_id);
            return;
        }

        self.data.lock().unwrap().running.insert(job_id);
        log::debug!("Starting job {}", job_id);

        let shared = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("keel-job-{job_id}"))
            .spawn(move || {
                run_sync(job.as_ref());
                shared.complete(job_id);
            })
            .expect("Could not spawn job worker thread");
    }
}

/// Process-wide worker pool for asynchronous jobs. Create one at startup
/// and share it across syncs; `stop()` tears it down.
pub struct JobManager {
    shared: Arc<Shared>,
    main_thread: Mutex<Option<jod_thread::JoinHandle<()>>>,
}

impl JobManager {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(num_cpus::get().clamp(POOL_MIN_CAPACITY, POOL_MAX_CAPACITY))
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(POOL_MIN_CAPACITY);
        let shared = Arc::new(Shared {
            data: Mutex::new(ManagerData::default()),
            capacity: AtomicUsize::new(capacity),
            stop: AtomicBool::new(false),
        });

        log::debug!("Job manager started with max {} workers", capacity);

        let manager = Arc::new(Self {
            shared,
            main_thread: Mutex::new(None),
        });

        let loop_shared = Arc::clone(&manager.shared);
        let handle = jod_thread::Builder::new()
            .name("keel-job-manager".to_owned())
            .spawn(move || Self::run(loop_shared))
            .expect("Could not start job manager thread");
        *manager.main_thread.lock().unwrap() = Some(handle);

        manager
    }

    fn run(shared: Arc<Shared>) {
        loop {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }

            // Keep one worker in reserve for the highest priority.
            while shared.available_workers() > 1
                && !shared.stop.load(Ordering::Acquire)
                && shared.data.lock().unwrap().has_queued()
            {
                let popped = shared.data.lock().unwrap().pop();
                let Some((job, priority)) = popped else {
                    break;
                };

                if job.can_run() {
                    shared.start_job(job);
                } else {
                    let job_id = job.state().id();
                    log::debug!("Job {} is pending (precondition not met)", job_id);
                    shared.data.lock().unwrap().pending.insert(job_id, priority);
                }
            }

            // The single top-priority job always starts, even when no
            // worker slot is otherwise free.
            if shared.data.lock().unwrap().top_is_highest() {
                let popped = shared.data.lock().unwrap().pop();
                if let Some((job, _)) = popped {
                    shared.start_job(job);
                }
            }

            Self::manage_pending(&shared);

            std::thread::sleep(LOOP_SLEEP);
        }
    }

    fn manage_pending(shared: &Arc<Shared>) {
        let pending: Vec<(JobId, JobPriority)> = {
            let data = shared.data.lock().unwrap();
            data.pending.iter().map(|(&id, &priority)| (id, priority)).collect()
        };

        for (job_id, priority) in pending {
            let job = shared.data.lock().unwrap().managed.get(&job_id).cloned();
            let Some(job) = job else {
                shared.data.lock().unwrap().pending.remove(&job_id);
                continue;
            };

            if job.state().is_aborted() {
                shared.complete(job_id);
            } else if job.can_run() {
                log::debug!("Requeuing pending job {} for execution", job_id);
                let mut data = shared.data.lock().unwrap();
                data.pending.remove(&job_id);
                data.queued.push(QueueEntry { priority, job_id });
            }
        }
    }

    /// Queue a job for asynchronous execution.
    pub fn queue(&self, job: Arc<dyn Job>, priority: JobPriority) -> JobId {
        let job_id = job.state().id();
        self.shared.data.lock().unwrap().queue(job, priority);
        job_id
    }

    /// Queue a job with a completion callback, invoked after the manager
    /// has released the job.
    pub fn queue_with_callback(
        &self,
        job: Arc<dyn Job>,
        priority: JobPriority,
        callback: Callback,
    ) -> JobId {
        let job_id = job.state().id();
        let mut data = self.shared.data.lock().unwrap();
        data.callbacks.insert(job_id, callback);
        data.queue(job, priority);
        job_id
    }

    /// A job is finished once the manager no longer tracks it.
    pub fn is_job_finished(&self, job_id: JobId) -> bool {
        !self.shared.data.lock().unwrap().managed.contains_key(&job_id)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Arc<dyn Job>> {
        self.shared.data.lock().unwrap().managed.get(&job_id).cloned()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Relaxed)
    }

    /// Halve the headroom above the minimum capacity (rounded up). Called
    /// after repeated network failures to relieve socket pressure.
    pub fn decrease_capacity(&self) {
        let current = self.capacity();
        if current > POOL_MIN_CAPACITY {
            let reduced = current - (current - POOL_MIN_CAPACITY).div_ceil(2);
            let reduced = reduced.max(POOL_MIN_CAPACITY);
            self.shared.capacity.store(reduced, Ordering::Relaxed);
            log::debug!("Max number of workers changed to {}", reduced);
        } else {
            log::warn!("Job manager capacity cannot be decreased below {}", POOL_MIN_CAPACITY);
        }
    }

    /// Abort every managed job and drop the bookkeeping. Running jobs
    /// observe their abort flag and finish on their own.
    pub fn clear(&self) {
        let mut data = self.shared.data.lock().unwrap();
        for job in data.managed.values() {
            job.abort();
        }
        data.managed.clear();
        data.priorities.clear();
        data.callbacks.clear();
        data.queued.clear();
        data.pending.clear();
        // Running ids stay until workers call complete(); completing an
        // erased id is a no-op.
    }

    /// Signal the main loop to exit and join it.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.main_thread.lock().unwrap().take() {
            drop(handle);
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}
