//! Cancellable, awaitable handles for submitted work.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use procpool_core::{ExecutionFailure, WaitError};

use crate::queue::JobQueue;

/// Where a submission currently is in its lifecycle.
pub(crate) enum Phase {
    Queued,
    Running,
    Done(Terminal),
}

/// The one terminal state a submission reaches, recorded exactly once.
#[derive(Clone)]
pub(crate) enum Terminal {
    Succeeded,
    Failed(ExecutionFailure),
    Cancelled,
}

/// State shared between a [`SubmissionHandle`], the queue entry, and the
/// executor that eventually runs the submission.
pub(crate) struct JobShared {
    id: u64,
    phase: Mutex<Phase>,
    interrupt: CancellationToken,
    queue: Weak<JobQueue>,
}

impl JobShared {
    pub(crate) fn new(id: u64, queue: Weak<JobQueue>) -> Self {
        Self {
            id,
            phase: Mutex::new(Phase::Queued),
            interrupt: CancellationToken::new(),
            queue,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Token the executor watches while running this submission.
    pub(crate) fn interrupt(&self) -> &CancellationToken {
        &self.interrupt
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().expect("submission phase lock poisoned")
    }

    /// Queued → Running, claimed by an executor. `false` when the
    /// submission was cancelled while it sat in the queue.
    pub(crate) fn try_claim(&self) -> bool {
        let mut phase = self.lock_phase();
        match *phase {
            Phase::Queued => {
                *phase = Phase::Running;
                true
            }
            _ => false,
        }
    }

    /// Record the terminal state; the first writer wins. Returns the
    /// terminal actually in effect so the completer can publish the
    /// matching outcome.
    pub(crate) fn record(&self, terminal: Terminal) -> Terminal {
        let mut phase = self.lock_phase();
        if let Phase::Done(existing) = &*phase {
            existing.clone()
        } else {
            *phase = Phase::Done(terminal.clone());
            terminal
        }
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        match &*self.lock_phase() {
            Phase::Done(terminal) => Some(terminal.clone()),
            _ => None,
        }
    }

    pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
        let mut phase = self.lock_phase();
        match &*phase {
            Phase::Queued => {
                *phase = Phase::Done(Terminal::Cancelled);
                drop(phase);
                // Remove the queue entry in place. When the executor won
                // the race and already popped it, it will observe the
                // recorded cancellation instead of running the job.
                if let Some(queue) = self.queue.upgrade() {
                    if let Some(job) = queue.remove(self.id) {
                        job.cancelled();
                    }
                }
                true
            }
            Phase::Running => {
                if !may_interrupt {
                    return false;
                }
                *phase = Phase::Done(Terminal::Cancelled);
                drop(phase);
                self.interrupt.cancel();
                true
            }
            Phase::Done(_) => false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.terminal(), Some(Terminal::Cancelled))
    }

    pub(crate) fn is_done(&self) -> bool {
        self.terminal().is_some()
    }
}

/// Handle returned from [`crate::ProcessPool::submit`].
///
/// The submission runs independently of the handle; dropping the handle
/// neither cancels nor detaches it.
pub struct SubmissionHandle<T> {
    shared: Arc<JobShared>,
    outcome: Option<oneshot::Receiver<Result<T, WaitError>>>,
}

impl<T> SubmissionHandle<T> {
    pub(crate) fn new(
        shared: Arc<JobShared>,
        outcome: oneshot::Receiver<Result<T, WaitError>>,
    ) -> Self {
        Self {
            shared,
            outcome: Some(outcome),
        }
    }

    pub(crate) fn shared(&self) -> Arc<JobShared> {
        Arc::clone(&self.shared)
    }

    /// Pool-unique id of this submission.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// Block until the submission is terminal.
    ///
    /// The success value moves out on the first successful wait; later
    /// waits report [`WaitError::ResultTaken`]. Failure and cancellation
    /// outcomes are sticky and re-reported as-is.
    pub async fn wait(&mut self) -> Result<T, WaitError> {
        match self.outcome.as_mut() {
            None => Err(self.terminal_error()),
            Some(receiver) => {
                let received = receiver.await;
                self.outcome = None;
                match received {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.terminal_error()),
                }
            }
        }
    }

    /// Like [`SubmissionHandle::wait`], bounded by `limit`.
    ///
    /// A timeout raises [`WaitError::Timeout`] and does not affect the
    /// submission; waiting again later is fine.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout),
        }
    }

    /// Cancel the submission.
    ///
    /// - still queued: removed from the queue, completes cancelled, `true`
    /// - executing and `may_interrupt`: the owning executor's wait is
    ///   interrupted, which tears down and replaces its worker process;
    ///   completes cancelled, `true`
    /// - executing and `!may_interrupt`: refused, `false`
    /// - already terminal: `false`
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.shared.cancel(may_interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    fn terminal_error(&self) -> WaitError {
        match self.shared.terminal() {
            Some(Terminal::Failed(failure)) => WaitError::Failed(failure),
            Some(Terminal::Cancelled) => WaitError::Cancelled,
            Some(Terminal::Succeeded) => WaitError::ResultTaken,
            None => WaitError::Failed(ExecutionFailure::Disrupted(
                "executor dropped the submission".to_owned(),
            )),
        }
    }
}

impl<T> std::fmt::Debug for SubmissionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionHandle")
            .field("id", &self.shared.id())
            .field("done", &self.shared.is_done())
            .field("cancelled", &self.shared.is_cancelled())
            .finish()
    }
}
