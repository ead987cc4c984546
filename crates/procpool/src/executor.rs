//! The per-process executor: owns one worker over its lifetime (or until
//! replaced) and drains one submission at a time into it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use procpool_core::{ExecutionFailure, Work};
use procpool_process::{ProcessManager, SpawnedProcess, kill_process_group, wait_with_grace};

use crate::job::ErasedJob;
use crate::pool::{PoolCore, SlotPhase};
use crate::queue::Taken;

/// Bound on graceful teardown: the termination submission and the child's
/// own exit each get this long before the process group is killed.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Observable lifecycle of one executor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorState {
    Starting,
    Idle,
    Executing,
    Stopping,
    Stopped,
}

/// One executor: a slot in the pool that is bound to at most one live
/// worker process at a time. Replacement spawns a fresh process into the
/// same slot.
pub(crate) struct ExecutorSlot {
    id: usize,
    manager: Arc<dyn ProcessManager>,
    state: Mutex<ExecutorState>,
}

/// How one submission run ended.
enum RunOutcome {
    Completed,
    Failed(ExecutionFailure),
    Interrupted,
}

/// Why the serve loop returned.
enum ServeEnd {
    /// The worker must be torn down; the slot respawns unless the pool is
    /// already draining towards shutdown.
    Replace { from_idle: bool, graceful: bool },
    /// Keep-alive expiry approved by the sizing policy; counters already
    /// reflect the removal.
    Retired,
    /// Queue closed after shutdown; stop the slot.
    Closed,
}

impl ExecutorSlot {
    pub(crate) fn new(id: usize, manager: Arc<dyn ProcessManager>) -> Arc<Self> {
        Arc::new(Self {
            id,
            manager,
            state: Mutex::new(ExecutorState::Starting),
        })
    }

    pub(crate) fn state(&self) -> ExecutorState {
        *self.state.lock().expect("executor state lock poisoned")
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock().expect("executor state lock poisoned") = state;
    }

    /// Drive the slot until it retires, the pool shuts down, or the
    /// worker cannot be (re)started.
    #[tracing::instrument(skip_all, fields(slot = self.id))]
    pub(crate) async fn run(self: Arc<Self>, pool: Arc<PoolCore>) {
        let mut executed: u64 = 0;
        let mut busy_time = Duration::ZERO;

        loop {
            self.set_state(ExecutorState::Starting);
            let mut io = match self.manager.spawn().await {
                Ok(io) => io,
                Err(error) => {
                    warn!(error = %error, "worker spawn failed; slot exits");
                    self.set_state(ExecutorState::Stopped);
                    pool.slot_exit(self.id, SlotPhase::Starting);
                    return;
                }
            };
            self.manager.on_startup(io.pid());

            if let Some(mut startup) = self.manager.startup_submission() {
                let outcome = drive_work(&mut io, &mut startup, None).await;
                if !matches!(outcome, RunOutcome::Completed) {
                    warn!("startup submission did not complete; slot exits");
                    self.teardown(io, false).await;
                    self.set_state(ExecutorState::Stopped);
                    pool.slot_exit(self.id, SlotPhase::Starting);
                    return;
                }
            }

            pool.mark_started();
            self.set_state(ExecutorState::Idle);
            debug!(pid = io.pid(), "worker ready");

            match self.serve(&pool, &mut io, &mut executed, &mut busy_time).await {
                ServeEnd::Closed => {
                    self.set_state(ExecutorState::Stopping);
                    self.teardown(io, true).await;
                    self.set_state(ExecutorState::Stopped);
                    pool.slot_exit(self.id, SlotPhase::Idle);
                    return;
                }
                ServeEnd::Retired => {
                    debug!("idle keep-alive expired; retiring slot");
                    self.set_state(ExecutorState::Stopping);
                    self.teardown(io, true).await;
                    self.set_state(ExecutorState::Stopped);
                    pool.finish_exit(self.id);
                    return;
                }
                ServeEnd::Replace { from_idle, graceful } => {
                    self.set_state(ExecutorState::Stopping);
                    self.teardown(io, graceful).await;
                    let from = if from_idle {
                        SlotPhase::Idle
                    } else {
                        SlotPhase::Busy
                    };
                    if pool.is_shut_down() && pool.queue.is_empty() {
                        self.set_state(ExecutorState::Stopped);
                        pool.slot_exit(self.id, from);
                        return;
                    }
                    pool.mark_respawning(from);
                }
            }
        }
    }

    /// Alternate between idle waits and submission runs on one worker.
    async fn serve(
        &self,
        pool: &Arc<PoolCore>,
        io: &mut SpawnedProcess,
        executed: &mut u64,
        busy_time: &mut Duration,
    ) -> ServeEnd {
        loop {
            let keep_alive = pool.config.keep_alive();
            let mut idle_since = Instant::now();
            let job = loop {
                let expiry = async {
                    match keep_alive {
                        Some(window) => tokio::time::sleep_until(idle_since + window).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    taken = pool.queue.take() => match taken {
                        Taken::Job(job) => break job,
                        Taken::Closed => return ServeEnd::Closed,
                    },
                    _ = expiry => {
                        if pool.try_retire() {
                            return ServeEnd::Retired;
                        }
                        // Sizing policy keeps us; arm a fresh idle window.
                        idle_since = Instant::now();
                    }
                    line = io.lines.recv() => match line {
                        Some(line) => {
                            debug!(source = %line.source, "discarding output line with no active command");
                        }
                        None => return ServeEnd::Replace { from_idle: true, graceful: false },
                    }
                }
            };

            let mut job: Box<dyn ErasedJob> = job;
            if !job.shared().try_claim() {
                // Cancelled while queued but popped before removal.
                job.cancelled();
                continue;
            }
            pool.mark_busy();
            self.set_state(ExecutorState::Executing);

            let interrupt = job.shared().interrupt().clone();
            let started = Instant::now();
            let outcome = drive_work(io, job.work_mut(), Some(&interrupt)).await;
            *executed += 1;
            *busy_time += started.elapsed();

            let terminate_after = job.terminate_after();
            let mut replace = terminate_after;
            let mut graceful = true;
            match outcome {
                RunOutcome::Completed => job.succeed(),
                RunOutcome::Failed(failure) => {
                    warn!(error = %failure, "submission failed; replacing worker");
                    replace = true;
                    graceful = false;
                    job.fail(failure);
                }
                RunOutcome::Interrupted => {
                    debug!("submission cancelled; replacing worker");
                    replace = true;
                    graceful = false;
                    job.cancelled();
                }
            }
            if !self.manager.keep_process(*executed, *busy_time) {
                debug!(executed = *executed, "recycling worker per manager policy");
                replace = true;
            }

            if replace {
                return ServeEnd::Replace {
                    from_idle: false,
                    graceful,
                };
            }
            pool.mark_idle();
            self.set_state(ExecutorState::Idle);
        }
    }

    /// Tear the worker down. Graceful teardown runs the manager's
    /// termination submission and gives the child a grace period; forced
    /// teardown kills the process group outright.
    async fn teardown(&self, io: SpawnedProcess, graceful: bool) {
        let SpawnedProcess {
            mut child,
            stdin,
            lines,
        } = {
            let mut io = io;
            if graceful {
                if let Some(mut termination) = self.manager.termination_submission() {
                    let finished = tokio::time::timeout(
                        TERMINATION_GRACE,
                        drive_work(&mut io, &mut termination, None),
                    )
                    .await;
                    if !matches!(finished, Ok(RunOutcome::Completed)) {
                        debug!("termination submission did not complete within grace");
                    }
                }
            }
            io
        };
        // EOF on stdin is the universal stop signal for line-oriented
        // workers.
        drop(stdin);
        drop(lines);

        let status = if graceful {
            wait_with_grace(&mut child, TERMINATION_GRACE).await
        } else {
            kill_process_group(&mut child);
            child.wait().await.ok()
        };
        self.manager
            .on_termination(status.and_then(|status| status.code()));
    }
}

/// Run one submission (caller work or a manager startup/termination
/// sequence) against the worker: write each instruction, then feed output
/// lines through the active command's predicates until it completes.
async fn drive_work(
    io: &mut SpawnedProcess,
    work: &mut dyn Work,
    interrupt: Option<&CancellationToken>,
) -> RunOutcome {
    work.notify_start(io.pid());

    // Lines buffered from before this submission belong to no command.
    while io.lines.try_recv().is_ok() {}

    let outcome = run_commands(io, work, interrupt).await;
    match outcome {
        RunOutcome::Completed | RunOutcome::Failed(_) => work.notify_finish(),
        RunOutcome::Interrupted => {}
    }
    outcome
}

async fn run_commands(
    io: &mut SpawnedProcess,
    work: &mut dyn Work,
    interrupt: Option<&CancellationToken>,
) -> RunOutcome {
    for command in work.commands_mut() {
        if interrupt.is_some_and(|token| token.is_cancelled()) {
            return RunOutcome::Interrupted;
        }

        let mut payload = command.instruction().as_bytes().to_vec();
        payload.push(b'\n');
        if let Err(error) = io.stdin.write_all(&payload).await {
            return RunOutcome::Failed(ExecutionFailure::Disrupted(format!(
                "stdin write failed: {error}"
            )));
        }
        if let Err(error) = io.stdin.flush().await {
            return RunOutcome::Failed(ExecutionFailure::Disrupted(format!(
                "stdin flush failed: {error}"
            )));
        }

        if !command.generates_output() {
            command.mark_dispatched();
            continue;
        }

        loop {
            tokio::select! {
                _ = wait_interrupted(interrupt) => return RunOutcome::Interrupted,
                line = io.lines.recv() => match line {
                    None => {
                        return RunOutcome::Failed(ExecutionFailure::Disrupted(
                            "worker process closed its output streams".to_owned(),
                        ));
                    }
                    Some(line) => match command.observe_line(line.source, &line.line) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(failed) => return RunOutcome::Failed(failed.into()),
                    },
                }
            }
        }
    }
    RunOutcome::Completed
}

async fn wait_interrupted(interrupt: Option<&CancellationToken>) {
    match interrupt {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}
