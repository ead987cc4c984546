//! FIFO of pending submissions with cancellation-aware removal.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::job::ErasedJob;

pub(crate) enum Taken {
    Job(Box<dyn ErasedJob>),
    /// Shutdown was initiated and the queue has drained (or was force
    /// drained); executors stop instead of waiting.
    Closed,
}

pub(crate) struct JobQueue {
    inner: Mutex<QueueInner>,
    available: Notify,
}

struct QueueInner {
    jobs: VecDeque<Box<dyn ErasedJob>>,
    closed: bool,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    /// Enqueue at the back. Non-blocking; refused once the queue closed.
    pub(crate) fn push(&self, job: Box<dyn ErasedJob>) -> Result<(), Box<dyn ErasedJob>> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(job);
            }
            inner.jobs.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Wait for the next job in strict FIFO order.
    pub(crate) async fn take(&self) -> Taken {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before re-checking so a push or close between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(job) = inner.jobs.pop_front() {
                    if !inner.jobs.is_empty() {
                        // Pass the wakeup on: one notify permit may cover
                        // several pushes.
                        self.available.notify_one();
                    }
                    return Taken::Job(job);
                }
                if inner.closed {
                    return Taken::Closed;
                }
            }
            notified.await;
        }
    }

    /// Remove a queued job in place without disturbing the order of the
    /// rest. Used by cancellation.
    pub(crate) fn remove(&self, id: u64) -> Option<Box<dyn ErasedJob>> {
        let mut inner = self.lock();
        let index = inner.jobs.iter().position(|job| job.shared().id() == id)?;
        inner.jobs.remove(index)
    }

    /// Take every waiting job out (force shutdown).
    pub(crate) fn drain(&self) -> Vec<Box<dyn ErasedJob>> {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.jobs.drain(..).collect()
        };
        self.available.notify_waiters();
        drained
    }

    /// Stop accepting jobs; waiting takers observe [`Taken::Closed`] once
    /// the queue is empty.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use procpool_core::{Submission, WaitError};

    use super::*;
    use crate::handle::JobShared;
    use crate::job::TypedJob;

    fn make_job(
        queue: &Arc<JobQueue>,
        id: u64,
    ) -> (Box<dyn ErasedJob>, oneshot::Receiver<Result<u64, WaitError>>) {
        let shared = Arc::new(JobShared::new(id, Arc::downgrade(queue)));
        let (tx, rx) = oneshot::channel();
        let submission = Submission::new(vec![]).result_with(move |_| id);
        (Box::new(TypedJob::new(submission, shared, tx)), rx)
    }

    fn push_ok(queue: &JobQueue, job: Box<dyn ErasedJob>) {
        assert!(queue.push(job).is_ok(), "queue rejected a push");
    }

    async fn take_id(queue: &JobQueue) -> u64 {
        match queue.take().await {
            Taken::Job(job) => job.shared().id(),
            Taken::Closed => panic!("queue closed unexpectedly"),
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = Arc::new(JobQueue::new());
        for id in 0..3 {
            let (job, _rx) = make_job(&queue, id);
            push_ok(&queue, job);
        }
        assert_eq!(take_id(&queue).await, 0);
        assert_eq!(take_id(&queue).await, 1);
        assert_eq!(take_id(&queue).await, 2);
    }

    #[tokio::test]
    async fn remove_keeps_the_rest_in_order() {
        let queue = Arc::new(JobQueue::new());
        let mut receivers = Vec::new();
        for id in 0..4 {
            let (job, rx) = make_job(&queue, id);
            push_ok(&queue, job);
            receivers.push(rx);
        }
        let removed = queue.remove(1).expect("job 1 is queued");
        assert_eq!(removed.shared().id(), 1);
        removed.cancelled();

        assert_eq!(take_id(&queue).await, 0);
        assert_eq!(take_id(&queue).await, 2);
        assert_eq!(take_id(&queue).await, 3);
        assert!(queue.remove(1).is_none());
    }

    #[tokio::test]
    async fn take_waits_for_a_push() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { take_id(&queue).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (job, _rx) = make_job(&queue, 7);
        push_ok(&queue, job);
        let id = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("take did not wake")
            .unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_pushes() {
        let queue = Arc::new(JobQueue::new());
        let waiters = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            let waiters = waiters.clone();
            tasks.push(tokio::spawn(async move {
                if matches!(queue.take().await, Taken::Closed) {
                    waiters.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("waiter did not observe close")
                .unwrap();
        }
        assert_eq!(waiters.load(Ordering::SeqCst), 2);

        let (job, _rx) = make_job(&queue, 9);
        assert!(queue.push(job).is_err());
    }

    #[tokio::test]
    async fn close_drains_remaining_jobs_first() {
        let queue = Arc::new(JobQueue::new());
        let (job, _rx) = make_job(&queue, 1);
        push_ok(&queue, job);
        queue.close();
        assert!(matches!(queue.take().await, Taken::Job(_)));
        assert!(matches!(queue.take().await, Taken::Closed));
    }

    #[tokio::test]
    async fn drained_jobs_can_complete_their_handles() {
        let queue = Arc::new(JobQueue::new());
        let (job, mut rx) = make_job(&queue, 3);
        push_ok(&queue, job);
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        for job in drained {
            let recalled = job.recall();
            assert!(recalled.commands.is_empty());
        }
        let outcome = (&mut rx).await.expect("completion was sent");
        assert!(matches!(outcome, Err(WaitError::Cancelled)));
    }
}
