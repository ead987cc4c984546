//! Type erasure between typed submissions and the untyped queue/executor
//! machinery. The typed oneshot sender travels inside the erased job, so
//! the executor can complete any submission without knowing its result
//! type.

use std::sync::Arc;

use tokio::sync::oneshot;

use procpool_core::{Command, ExecutionFailure, Submission, WaitError, Work};

use crate::handle::{JobShared, Terminal};

/// A queued submission as the pool machinery sees it.
pub(crate) trait ErasedJob: Send {
    fn shared(&self) -> &Arc<JobShared>;
    fn work_mut(&mut self) -> &mut dyn Work;
    fn terminate_after(&self) -> bool;

    /// Publish success. The result producer runs here, on the executor.
    fn succeed(self: Box<Self>);
    fn fail(self: Box<Self>, failure: ExecutionFailure);
    fn cancelled(self: Box<Self>);

    /// Complete as cancelled and hand the recallable parts back to the
    /// caller (force shutdown).
    fn recall(self: Box<Self>) -> UnexecutedSubmission;
}

/// A submission drained from the queue before any executor touched it.
///
/// Hooks and the result producer cannot survive type erasure; the
/// commands (with whatever they captured, i.e. nothing) and the
/// terminate-after flag come back.
#[derive(Debug)]
pub struct UnexecutedSubmission {
    pub commands: Vec<Command>,
    pub terminate_after: bool,
}

pub(crate) struct TypedJob<T> {
    submission: Submission<T>,
    shared: Arc<JobShared>,
    sender: oneshot::Sender<Result<T, WaitError>>,
}

impl<T> TypedJob<T> {
    pub(crate) fn new(
        submission: Submission<T>,
        shared: Arc<JobShared>,
        sender: oneshot::Sender<Result<T, WaitError>>,
    ) -> Self {
        Self {
            submission,
            shared,
            sender,
        }
    }
}

impl<T: Send + 'static> ErasedJob for TypedJob<T> {
    fn shared(&self) -> &Arc<JobShared> {
        &self.shared
    }

    fn work_mut(&mut self) -> &mut dyn Work {
        &mut self.submission
    }

    fn terminate_after(&self) -> bool {
        Work::terminate_after(&self.submission)
    }

    fn succeed(self: Box<Self>) {
        let Self {
            submission,
            shared,
            sender,
        } = *self;
        let outcome = match shared.record(Terminal::Succeeded) {
            Terminal::Succeeded => Ok(submission.into_result()),
            Terminal::Cancelled => Err(WaitError::Cancelled),
            Terminal::Failed(failure) => Err(WaitError::Failed(failure)),
        };
        let _ = sender.send(outcome);
    }

    fn fail(self: Box<Self>, failure: ExecutionFailure) {
        let Self { shared, sender, .. } = *self;
        let _ = sender.send(Err(wait_error(shared.record(Terminal::Failed(failure)))));
    }

    fn cancelled(self: Box<Self>) {
        let Self { shared, sender, .. } = *self;
        let _ = sender.send(Err(wait_error(shared.record(Terminal::Cancelled))));
    }

    fn recall(self: Box<Self>) -> UnexecutedSubmission {
        let Self {
            submission,
            shared,
            sender,
        } = *self;
        let _ = sender.send(Err(wait_error(shared.record(Terminal::Cancelled))));
        let (commands, terminate_after) = submission.into_parts();
        UnexecutedSubmission {
            commands,
            terminate_after,
        }
    }
}

/// Map a non-success terminal onto the handle's error surface.
fn wait_error(terminal: Terminal) -> WaitError {
    match terminal {
        Terminal::Failed(failure) => WaitError::Failed(failure),
        Terminal::Cancelled => WaitError::Cancelled,
        // An executor never records success for a job it is abandoning.
        Terminal::Succeeded => WaitError::ResultTaken,
    }
}
