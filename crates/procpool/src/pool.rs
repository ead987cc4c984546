//! The pool controller: executor registry, counters, dynamic sizing, and
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};

use procpool_core::{
    ExecutionFailure, PoolConfig, PoolError, SubmitError, Submission,
};
use procpool_process::ProcessManagerFactory;

use crate::executor::{ExecutorSlot, ExecutorState};
use crate::handle::{JobShared, SubmissionHandle};
use crate::job::{ErasedJob, TypedJob, UnexecutedSubmission};
use crate::queue::JobQueue;

/// Which counter bucket a slot currently occupies.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SlotPhase {
    Starting,
    Idle,
    Busy,
}

#[derive(Debug, Default)]
struct Counts {
    starting: usize,
    idle: usize,
    busy: usize,
    spawn_failures: usize,
}

impl Counts {
    fn total(&self) -> usize {
        self.starting + self.idle + self.busy
    }

    fn bucket_mut(&mut self, phase: SlotPhase) -> &mut usize {
        match phase {
            SlotPhase::Starting => &mut self.starting,
            SlotPhase::Idle => &mut self.idle,
            SlotPhase::Busy => &mut self.busy,
        }
    }
}

/// Serializable snapshot of the pool's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub shut_down: bool,
    pub terminated: bool,
    pub executors: Vec<ExecutorState>,
}

pub(crate) struct PoolCore {
    pub(crate) config: PoolConfig,
    pub(crate) queue: Arc<JobQueue>,
    factory: Box<dyn ProcessManagerFactory>,
    counts: Mutex<Counts>,
    counts_changed: Notify,
    registry: Mutex<HashMap<usize, Arc<ExecutorSlot>>>,
    shut_down: AtomicBool,
    next_job_id: AtomicU64,
    next_slot_id: AtomicUsize,
}

impl PoolCore {
    fn lock_counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().expect("pool counter lock poisoned")
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<usize, Arc<ExecutorSlot>>> {
        self.registry.lock().expect("executor registry lock poisoned")
    }

    fn notify_counts(&self) {
        self.counts_changed.notify_waiters();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.is_shut_down() && self.lock_counts().total() == 0
    }

    /// Start one executor slot, bounded by the configured maximum.
    fn spawn_slot(self: &Arc<Self>) -> bool {
        {
            let mut counts = self.lock_counts();
            if self.is_shut_down() || counts.total() >= self.config.max_size {
                return false;
            }
            counts.starting += 1;
        }
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let manager = self.factory.new_process_manager();
        let slot = ExecutorSlot::new(id, manager);
        self.lock_registry().insert(id, Arc::clone(&slot));
        debug!(slot = id, "starting executor");
        tokio::spawn(slot.run(Arc::clone(self)));
        self.notify_counts();
        true
    }

    // --- slot lifecycle bookkeeping, called by the executor tasks ---

    pub(crate) fn mark_started(&self) {
        let mut counts = self.lock_counts();
        counts.starting -= 1;
        counts.idle += 1;
        drop(counts);
        self.notify_counts();
    }

    pub(crate) fn mark_busy(self: &Arc<Self>) {
        {
            let mut counts = self.lock_counts();
            counts.idle -= 1;
            counts.busy += 1;
        }
        self.notify_counts();
        self.top_up_reserve();
    }

    pub(crate) fn mark_idle(&self) {
        let mut counts = self.lock_counts();
        counts.busy -= 1;
        counts.idle += 1;
        drop(counts);
        self.notify_counts();
    }

    pub(crate) fn mark_respawning(&self, from: SlotPhase) {
        let mut counts = self.lock_counts();
        *counts.bucket_mut(from) -= 1;
        counts.starting += 1;
        drop(counts);
        self.notify_counts();
    }

    /// A slot leaves the pool from the given phase.
    pub(crate) fn slot_exit(self: &Arc<Self>, id: usize, from: SlotPhase) {
        {
            let mut counts = self.lock_counts();
            *counts.bucket_mut(from) -= 1;
            if matches!(from, SlotPhase::Starting) {
                counts.spawn_failures += 1;
            }
        }
        self.finish_exit(id);
    }

    /// Deregister a slot whose counters are already settled, then keep the
    /// queue from stranding: replace the slot if work is still waiting, or
    /// fail leftover jobs once the last slot of a shut-down pool is gone.
    pub(crate) fn finish_exit(self: &Arc<Self>, id: usize) {
        self.lock_registry().remove(&id);
        if self.is_shut_down() {
            if self.lock_counts().total() == 0 {
                for job in self.queue.drain() {
                    job.fail(ExecutionFailure::Disrupted(
                        "pool terminated before the submission could run".to_owned(),
                    ));
                }
                info!("pool terminated");
            }
        } else if !self.queue.is_empty() {
            self.spawn_slot();
        }
        self.notify_counts();
    }

    /// Keep-alive expiry: approve retirement only while it leaves the
    /// minimum and the idle reserve intact. Decrements atomically with the
    /// decision; the caller must follow up with [`PoolCore::finish_exit`].
    pub(crate) fn try_retire(&self) -> bool {
        let mut counts = self.lock_counts();
        if counts.total() > self.config.min_size && counts.idle > self.config.reserve_size {
            counts.idle -= 1;
            drop(counts);
            self.notify_counts();
            true
        } else {
            false
        }
    }

    // --- sizing triggers ---

    /// Growth on submit: a submission arrived and nobody is idle.
    fn grow_on_submit(self: &Arc<Self>) {
        let wanted = {
            let counts = self.lock_counts();
            counts.idle == 0 && counts.total() < self.config.max_size
        };
        if wanted {
            self.spawn_slot();
        }
    }

    /// Reserve guarantee: after a dispatch, start executors until the
    /// projected idle count covers the reserve or the maximum is reached.
    fn top_up_reserve(self: &Arc<Self>) {
        loop {
            let wanted = {
                let counts = self.lock_counts();
                counts.idle + counts.starting < self.config.reserve_size
                    && counts.total() < self.config.max_size
            };
            if !wanted || !self.spawn_slot() {
                return;
            }
        }
    }

    // --- waits ---

    async fn await_warmup(&self, target: usize) -> Result<(), PoolError> {
        loop {
            let notified = self.counts_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let counts = self.lock_counts();
                if counts.spawn_failures > 0 {
                    return Err(PoolError::Startup(format!(
                        "{} of {} initial workers failed to start",
                        counts.spawn_failures, target
                    )));
                }
                if counts.idle >= target {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn wait_terminated(&self) {
        loop {
            let notified = self.counts_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }
}

/// A pool of externally-spawned worker processes used as reusable
/// executors for submissions.
///
/// Cheap to clone; all clones drive the same pool. The pool keeps running
/// until [`ProcessPool::shutdown`] or [`ProcessPool::force_shutdown`] is
/// called.
#[derive(Clone)]
pub struct ProcessPool {
    core: Arc<PoolCore>,
}

impl ProcessPool {
    /// Validate `config`, then start `max(min_size, reserve_size)`
    /// executors and wait until all of them are idle.
    pub async fn new(
        factory: impl ProcessManagerFactory + 'static,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let core = Arc::new(PoolCore {
            queue: Arc::new(JobQueue::new()),
            factory: Box::new(factory),
            counts: Mutex::new(Counts::default()),
            counts_changed: Notify::new(),
            registry: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            next_job_id: AtomicU64::new(0),
            next_slot_id: AtomicUsize::new(0),
            config,
        });

        let initial = core.config.initial_size();
        for _ in 0..initial {
            core.spawn_slot();
        }
        if let Err(error) = core.await_warmup(initial).await {
            // Stop whatever did come up; nothing may outlive a failed
            // construction.
            core.shut_down.store(true, Ordering::SeqCst);
            core.queue.close();
            return Err(error);
        }
        info!(
            initial,
            min = core.config.min_size,
            max = core.config.max_size,
            reserve = core.config.reserve_size,
            "process pool ready"
        );
        Ok(Self { core })
    }

    /// Enqueue a submission and return its handle.
    ///
    /// Idle executors are parked on the queue, so the enqueue is the
    /// handoff; FIFO order is preserved among queued submissions.
    pub fn submit<T: Send + 'static>(
        &self,
        submission: Submission<T>,
    ) -> Result<SubmissionHandle<T>, SubmitError> {
        if self.core.is_shut_down() {
            return Err(SubmitError::PoolShutDown);
        }

        let id = self.core.next_job_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(JobShared::new(id, Arc::downgrade(&self.core.queue)));
        let (sender, receiver) = oneshot::channel();
        let job: Box<dyn ErasedJob> =
            Box::new(TypedJob::new(submission, Arc::clone(&shared), sender));

        if self.core.queue.push(job).is_err() {
            return Err(SubmitError::PoolShutDown);
        }
        debug!(job = id, "submission queued");
        self.core.grow_on_submit();
        Ok(SubmissionHandle::new(shared, receiver))
    }

    /// Disable new submissions and let the queue drain; executors stop as
    /// they become idle. Idempotent.
    pub fn shutdown(&self) {
        if !self.core.shut_down.swap(true, Ordering::SeqCst) {
            info!("pool shutdown initiated");
        }
        self.core.queue.close();
        self.core.counts_changed.notify_waiters();
    }

    /// Shut down and additionally drain the queue, returning the waiting
    /// submissions. Their handles complete as cancelled. Running
    /// submissions are not interrupted; cancel their handles individually
    /// for that.
    pub fn force_shutdown(&self) -> Vec<UnexecutedSubmission> {
        self.shutdown();
        let drained = self.core.queue.drain();
        if !drained.is_empty() {
            info!(returned = drained.len(), "force shutdown drained the queue");
        }
        drained.into_iter().map(|job| job.recall()).collect()
    }

    /// Wait until shutdown has completed and every executor has stopped.
    pub async fn wait_terminated(&self) {
        self.core.wait_terminated().await;
    }

    /// Bounded [`ProcessPool::wait_terminated`]; `true` when the pool
    /// terminated within `limit`.
    pub async fn wait_terminated_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_terminated())
            .await
            .is_ok()
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.is_shut_down()
    }

    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    pub fn status(&self) -> PoolStatus {
        let (total, starting, idle, busy) = {
            let counts = self.core.lock_counts();
            (counts.total(), counts.starting, counts.idle, counts.busy)
        };
        let executors = {
            let registry = self.core.lock_registry();
            registry.values().map(|slot| slot.state()).collect()
        };
        PoolStatus {
            total,
            starting,
            idle,
            busy,
            queued: self.core.queue.len(),
            shut_down: self.is_shut_down(),
            terminated: self.is_terminated(),
            executors,
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("ProcessPool")
            .field("total", &status.total)
            .field("idle", &status.idle)
            .field("queued", &status.queued)
            .field("shut_down", &status.shut_down)
            .finish()
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod pool_tests;
