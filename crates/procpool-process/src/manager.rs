//! The caller-supplied contract for producing and observing worker
//! processes, plus a stock implementation built over [`tokio::process`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use procpool_core::Submission;

use crate::{SpawnedProcess, spawn_piped};

/// Everything the pool needs to know about one kind of worker process.
///
/// One manager instance serves one executor for that executor's whole
/// lifetime, across process replacements.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a fresh worker with piped stdio.
    async fn spawn(&self) -> Result<SpawnedProcess>;

    /// Submission executed once on a new worker before the executor
    /// becomes available. `None` means the worker is usable immediately.
    fn startup_submission(&self) -> Option<Submission<()>> {
        None
    }

    /// Submission executed on graceful stop, before stdin is closed.
    fn termination_submission(&self) -> Option<Submission<()>> {
        None
    }

    /// Observation hook: a worker was spawned.
    fn on_startup(&self, _pid: Option<u32>) {}

    /// Observation hook: a worker exited (code is `None` when it was
    /// killed by a signal or could not be reaped).
    fn on_termination(&self, _exit_code: Option<i32>) {}

    /// Recycling policy, consulted after every submission with the number
    /// of submissions this worker has executed and its cumulative busy
    /// time. Returning `false` replaces the worker process.
    fn keep_process(&self, _executed: u64, _total_runtime: Duration) -> bool {
        true
    }
}

/// Produces one [`ProcessManager`] per executor.
pub trait ProcessManagerFactory: Send + Sync {
    fn new_process_manager(&self) -> Arc<dyn ProcessManager>;
}

impl<F> ProcessManagerFactory for F
where
    F: Fn() -> Arc<dyn ProcessManager> + Send + Sync,
{
    fn new_process_manager(&self) -> Arc<dyn ProcessManager> {
        self()
    }
}

type SubmissionFactory = Arc<dyn Fn() -> Submission<()> + Send + Sync>;

/// Stock manager that spawns a fixed command line.
///
/// Optionally carries startup/termination submission factories and
/// count- or age-based recycling bounds. The manager itself is its own
/// factory: cloning it per executor is cheap (closures are shared).
#[derive(Clone)]
pub struct CommandProcessManager {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    startup: Option<SubmissionFactory>,
    termination: Option<SubmissionFactory>,
    max_executions: Option<u64>,
    max_busy_time: Option<Duration>,
}

impl CommandProcessManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            startup: None,
            termination: None,
            max_executions: None,
            max_busy_time: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run the produced submission on every fresh worker before it serves.
    pub fn startup_with(
        mut self,
        factory: impl Fn() -> Submission<()> + Send + Sync + 'static,
    ) -> Self {
        self.startup = Some(Arc::new(factory));
        self
    }

    /// Run the produced submission on graceful worker stop.
    pub fn termination_with(
        mut self,
        factory: impl Fn() -> Submission<()> + Send + Sync + 'static,
    ) -> Self {
        self.termination = Some(Arc::new(factory));
        self
    }

    /// Replace the worker after it has executed this many submissions.
    pub fn recycle_after_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Replace the worker once its cumulative busy time exceeds this.
    pub fn recycle_after_busy_time(mut self, max: Duration) -> Self {
        self.max_busy_time = Some(max);
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl ProcessManager for CommandProcessManager {
    async fn spawn(&self) -> Result<SpawnedProcess> {
        spawn_piped(self.build_command()).await
    }

    fn startup_submission(&self) -> Option<Submission<()>> {
        self.startup.as_ref().map(|factory| factory())
    }

    fn termination_submission(&self) -> Option<Submission<()>> {
        self.termination.as_ref().map(|factory| factory())
    }

    fn keep_process(&self, executed: u64, total_runtime: Duration) -> bool {
        if self.max_executions.is_some_and(|max| executed >= max) {
            return false;
        }
        if self.max_busy_time.is_some_and(|max| total_runtime >= max) {
            return false;
        }
        true
    }
}

impl ProcessManagerFactory for CommandProcessManager {
    fn new_process_manager(&self) -> Arc<dyn ProcessManager> {
        Arc::new(self.clone())
    }
}

impl fmt::Debug for CommandProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessManager")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("max_executions", &self.max_executions)
            .field("max_busy_time", &self.max_busy_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_process_defaults_to_true() {
        let manager = CommandProcessManager::new("cat");
        assert!(manager.keep_process(1_000, Duration::from_secs(3600)));
    }

    #[test]
    fn execution_bound_recycles() {
        let manager = CommandProcessManager::new("cat").recycle_after_executions(3);
        assert!(manager.keep_process(2, Duration::ZERO));
        assert!(!manager.keep_process(3, Duration::ZERO));
    }

    #[test]
    fn busy_time_bound_recycles() {
        let manager =
            CommandProcessManager::new("cat").recycle_after_busy_time(Duration::from_secs(1));
        assert!(manager.keep_process(1, Duration::from_millis(500)));
        assert!(!manager.keep_process(1, Duration::from_secs(2)));
    }

    #[test]
    fn factory_produces_independent_managers() {
        let manager = CommandProcessManager::new("sh").arg("-c");
        let produced = manager.new_process_manager();
        assert!(produced.startup_submission().is_none());
        assert!(produced.termination_submission().is_none());
    }

    #[test]
    fn startup_factory_is_invoked_per_call() {
        let manager = CommandProcessManager::new("sh")
            .startup_with(|| Submission::new(vec![]));
        assert!(manager.startup_submission().is_some());
        assert!(manager.startup_submission().is_some());
    }
}
