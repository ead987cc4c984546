//! Worker-process plumbing: spawning with piped stdio, line-oriented
//! output pumps, and termination helpers.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::debug;

use procpool_core::StreamSource;

pub mod manager;

pub use manager::{CommandProcessManager, ProcessManager, ProcessManagerFactory};

/// Capacity of the per-process output line channel. Both stream pumps feed
/// the same channel; a slow consumer backpressures the worker through the
/// pipe buffers.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// One line the worker emitted, tagged with the stream it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: StreamSource,
    pub line: String,
}

/// A spawned worker with its stdin writer and merged output line stream.
///
/// `lines` yields `None` only after both the worker's stdout and stderr
/// reached EOF, i.e. the process is gone or has closed its streams.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub lines: mpsc::Receiver<OutputLine>,
}

impl SpawnedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn a worker process with fully piped stdio.
///
/// - stdin/stdout/stderr are piped; stdout and stderr are drained by one
///   pump task each into the returned line channel
/// - the child is isolated in its own process group (setsid) so group
///   kills cannot reach the pool's own process
/// - kill_on_drop is set as a safety net
pub async fn spawn_piped(mut cmd: Command) -> Result<SpawnedProcess> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().context("failed to spawn worker process")?;
    let stdin = child
        .stdin
        .take()
        .context("worker process has no piped stdin")?;
    let stdout = child
        .stdout
        .take()
        .context("worker process has no piped stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("worker process has no piped stderr")?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(pump_lines(stdout, StreamSource::Stdout, tx.clone()));
    tokio::spawn(pump_lines(stderr, StreamSource::Stderr, tx));

    debug!(pid = child.id(), "spawned worker process");
    Ok(SpawnedProcess {
        child,
        stdin,
        lines: rx,
    })
}

/// Read one output stream line by line into the shared channel until EOF
/// or until the receiving side is gone.
async fn pump_lines<R>(stream: R, source: StreamSource, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(OutputLine { source, line }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(%source, %error, "worker output stream read failed");
                break;
            }
        }
    }
}

/// Kill the worker's whole process group.
pub fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative PID targets the
            // process group created by setsid in pre_exec.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }

    let _ = child.start_kill();
}

/// Wait for the worker to exit on its own within `grace`, then kill its
/// process group and reap it.
pub async fn wait_with_grace(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            debug!(
                pid = child.id(),
                grace_ms = grace.as_millis() as u64,
                "worker did not exit within grace period; killing process group"
            );
            kill_process_group(child);
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
