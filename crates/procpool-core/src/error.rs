use thiserror::Error;

use crate::command::StreamSource;

/// Pool construction parameter violations, raised before any process is
/// spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pool configuration: {field} = {value}: {reason}")]
    InvalidArgument {
        field: &'static str,
        value: u64,
        reason: &'static str,
    },
}

/// Errors that can end [`crate::config::PoolConfig`]-driven pool startup.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pool warmup failed: {0}")]
    Startup(String),
}

/// A completion predicate rejected an output line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command `{instruction}` rejected {stream} line {line:?}: {reason}")]
pub struct FailedCommand {
    pub instruction: String,
    pub stream: StreamSource,
    pub line: String,
    pub reason: String,
}

/// Why a submission ended without producing its result.
#[derive(Debug, Clone, Error)]
pub enum ExecutionFailure {
    #[error(transparent)]
    Command(#[from] FailedCommand),

    /// The submission could not be attempted or was aborted by an
    /// unrelated failure: the worker process died mid-submission, or the
    /// executor stopped during shutdown.
    #[error("submission disrupted: {0}")]
    Disrupted(String),
}

/// Submission refused without touching a process.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("pool is shut down; submission rejected")]
    PoolShutDown,
}

/// Outcome surface of the wait operations on a submission handle.
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error(transparent)]
    Failed(#[from] ExecutionFailure),

    #[error("submission was cancelled")]
    Cancelled,

    #[error("timed out waiting for the submission")]
    Timeout,

    /// The success value was already taken by an earlier wait.
    #[error("submission result already taken")]
    ResultTaken,
}

/// Failure modes of the first-success batch operation.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Rejected(#[from] SubmitError),

    #[error("no submissions were provided")]
    Empty,

    #[error("no submission succeeded within the time budget")]
    Timeout,

    #[error("every submission failed; last: {0}")]
    AllFailed(ExecutionFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_argument() {
        let err = ConfigError::InvalidArgument {
            field: "max_size",
            value: 0,
            reason: "must be at least 1",
        };
        assert_eq!(
            err.to_string(),
            "invalid pool configuration: max_size = 0: must be at least 1"
        );
    }

    #[test]
    fn display_failed_command() {
        let err = FailedCommand {
            instruction: "run job".into(),
            stream: StreamSource::Stderr,
            line: "WARN disk".into(),
            reason: "unexpected stderr output".into(),
        };
        assert_eq!(
            err.to_string(),
            "command `run job` rejected stderr line \"WARN disk\": unexpected stderr output"
        );
    }

    #[test]
    fn execution_failure_is_transparent_over_failed_command() {
        let failure: ExecutionFailure = FailedCommand {
            instruction: "x".into(),
            stream: StreamSource::Stdout,
            line: "y".into(),
            reason: "z".into(),
        }
        .into();
        assert_eq!(failure.to_string(), "command `x` rejected stdout line \"y\": z");
    }

    #[test]
    fn display_disrupted() {
        let err = ExecutionFailure::Disrupted("worker process closed its output streams".into());
        assert_eq!(
            err.to_string(),
            "submission disrupted: worker process closed its output streams"
        );
    }

    #[test]
    fn display_wait_errors() {
        assert_eq!(WaitError::Cancelled.to_string(), "submission was cancelled");
        assert_eq!(
            WaitError::Timeout.to_string(),
            "timed out waiting for the submission"
        );
        assert_eq!(
            SubmitError::PoolShutDown.to_string(),
            "pool is shut down; submission rejected"
        );
    }

    #[test]
    fn errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConfigError>();
        assert_send_sync::<FailedCommand>();
        assert_send_sync::<ExecutionFailure>();
        assert_send_sync::<WaitError>();
        assert_send_sync::<BatchError>();
    }
}
