//! A dynamically-sized pool of reusable child-process executors.
//!
//! Callers hand in [`Submission`]s (ordered stdin instructions plus
//! per-line completion predicates) and get back cancellable, awaitable
//! [`SubmissionHandle`]s. The pool streams each submission into one pooled
//! worker process, grows and shrinks between a configured minimum and
//! maximum, and keeps a reserve of idle workers warm to hide spawn
//! latency.
//!
//! ```no_run
//! use procpool::{Command, PoolConfig, ProcessPool, Submission};
//! use procpool_process::CommandProcessManager;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ProcessPool::new(
//!     CommandProcessManager::new("sh"),
//!     PoolConfig {
//!         min_size: 2,
//!         max_size: 4,
//!         reserve_size: 1,
//!         keep_alive_ms: 30_000,
//!     },
//! )
//! .await?;
//!
//! let submission = Submission::single(
//!     Command::new("echo ready").with_stdout_predicate(|_, line| Ok(line == "ready")),
//! )
//! .result_with(|commands| commands[0].capture().joined_stdout());
//!
//! let mut handle = pool.submit(submission)?;
//! let output = handle.wait().await?;
//! assert_eq!(output, "ready");
//!
//! pool.shutdown();
//! pool.wait_terminated().await;
//! # Ok(())
//! # }
//! ```

mod batch;
mod executor;
mod handle;
mod job;
mod pool;
mod queue;

pub use batch::{InvokeAllOutcome, invoke_all, invoke_any};
pub use executor::ExecutorState;
pub use handle::SubmissionHandle;
pub use job::UnexecutedSubmission;
pub use pool::{PoolStatus, ProcessPool};

pub use procpool_core::{
    BatchError, Command, ConfigError, ExecutionFailure, FailedCommand, LinePredicate,
    OutputCapture, PoolConfig, PoolError, StreamSource, SubmitError, Submission, WaitError,
};
pub use procpool_process::{
    CommandProcessManager, ProcessManager, ProcessManagerFactory, SpawnedProcess,
};
