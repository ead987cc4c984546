//! Aggregated submission helpers layered on top of the pool: submit a
//! batch and wait on a shared time budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use procpool_core::{BatchError, ExecutionFailure, SubmitError, Submission, WaitError};

use crate::handle::{JobShared, SubmissionHandle};
use crate::pool::ProcessPool;

/// Result of [`invoke_all`]: one entry per submission, in submission
/// order, plus whether the shared budget ran out.
#[derive(Debug)]
pub struct InvokeAllOutcome<T> {
    pub results: Vec<Result<T, WaitError>>,
    pub timed_out: bool,
}

/// Submit every submission, then wait for each against one shared budget.
///
/// Once the budget is exhausted, every still-pending submission is
/// cancelled with interruption and reported as cancelled; submissions
/// that already reached a terminal state keep their real outcome. With
/// `budget == None` this simply waits for everything.
pub async fn invoke_all<T: Send + 'static>(
    pool: &ProcessPool,
    submissions: Vec<Submission<T>>,
    budget: Option<Duration>,
) -> Result<InvokeAllOutcome<T>, SubmitError> {
    let handles = submit_all(pool, submissions)?;
    let deadline = budget.map(|budget| Instant::now() + budget);

    let mut results = Vec::with_capacity(handles.len());
    let mut timed_out = false;
    for mut handle in handles {
        if timed_out {
            results.push(resolve_expired(handle).await);
            continue;
        }
        let result = match deadline {
            None => handle.wait().await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match handle.wait_timeout(remaining).await {
                    Err(WaitError::Timeout) => {
                        timed_out = true;
                        resolve_expired(handle).await
                    }
                    other => other,
                }
            }
        };
        results.push(result);
    }
    Ok(InvokeAllOutcome { results, timed_out })
}

/// Submit every submission and return the first success; the rest are
/// cancelled with interruption.
///
/// When no submission succeeds: [`BatchError::Timeout`] if the budget ran
/// out first, otherwise [`BatchError::AllFailed`] carrying the last
/// failure.
pub async fn invoke_any<T: Send + 'static>(
    pool: &ProcessPool,
    submissions: Vec<Submission<T>>,
    budget: Option<Duration>,
) -> Result<T, BatchError> {
    if submissions.is_empty() {
        return Err(BatchError::Empty);
    }
    let handles = submit_all(pool, submissions)?;
    let deadline = budget.map(|budget| Instant::now() + budget);
    let cancellers: Vec<Arc<JobShared>> = handles.iter().map(SubmissionHandle::shared).collect();

    let (done_tx, mut done_rx) = mpsc::channel::<Result<T, WaitError>>(handles.len());
    for mut handle in handles {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = handle.wait().await;
            let _ = done_tx.send(result).await;
        });
    }
    drop(done_tx);

    let mut last_failure: Option<ExecutionFailure> = None;
    loop {
        let received = match deadline {
            None => done_rx.recv().await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, done_rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        cancel_all(&cancellers);
                        return Err(BatchError::Timeout);
                    }
                }
            }
        };
        match received {
            None => break,
            Some(Ok(value)) => {
                cancel_all(&cancellers);
                return Ok(value);
            }
            Some(Err(WaitError::Failed(failure))) => last_failure = Some(failure),
            Some(Err(_)) => {}
        }
    }

    cancel_all(&cancellers);
    Err(match last_failure {
        Some(failure) => BatchError::AllFailed(failure),
        None => BatchError::AllFailed(ExecutionFailure::Disrupted(
            "no submission produced a result".to_owned(),
        )),
    })
}

fn submit_all<T: Send + 'static>(
    pool: &ProcessPool,
    submissions: Vec<Submission<T>>,
) -> Result<Vec<SubmissionHandle<T>>, SubmitError> {
    let mut handles = Vec::with_capacity(submissions.len());
    for submission in submissions {
        match pool.submit(submission) {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                // All-or-nothing: withdraw what already went in.
                for handle in &handles {
                    handle.cancel(true);
                }
                return Err(error);
            }
        }
    }
    Ok(handles)
}

/// Budget is gone: cancel with interruption, but keep the real outcome of
/// submissions that already finished.
async fn resolve_expired<T>(mut handle: SubmissionHandle<T>) -> Result<T, WaitError> {
    if handle.cancel(true) {
        Err(WaitError::Cancelled)
    } else {
        // Already terminal; completion is at most an instant away.
        handle.wait().await
    }
}

fn cancel_all(cancellers: &[Arc<JobShared>]) {
    for shared in cancellers {
        shared.cancel(true);
    }
}
