//! One stdin instruction plus the per-line predicates that decide when the
//! worker process has finished responding to it.

use std::fmt;

use serde::Serialize;

use crate::error::FailedCommand;

/// Which output stream of the worker process a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Lines captured from the worker while a command was active, per stream.
///
/// The buffers are visible to the completion predicates, so a multi-line
/// terminator (e.g. a sentinel emitted after a payload) can inspect what
/// came before the line currently under decision. The line under decision
/// is already appended when the predicate runs.
#[derive(Debug, Default)]
pub struct OutputCapture {
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl OutputCapture {
    pub fn lines(&self, source: StreamSource) -> &[String] {
        match source {
            StreamSource::Stdout => &self.stdout,
            StreamSource::Stderr => &self.stderr,
        }
    }

    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout
    }

    pub fn stderr_lines(&self) -> &[String] {
        &self.stderr
    }

    /// All captured stdout joined with `\n`.
    pub fn joined_stdout(&self) -> String {
        self.stdout.join("\n")
    }

    /// All captured stderr joined with `\n`.
    pub fn joined_stderr(&self) -> String {
        self.stderr.join("\n")
    }

    fn record(&mut self, source: StreamSource, line: String) {
        match source {
            StreamSource::Stdout => self.stdout.push(line),
            StreamSource::Stderr => self.stderr.push(line),
        }
    }
}

/// Per-line completion decision for one output stream.
///
/// Invoked once per line the worker emits on that stream while the command
/// is active. `Ok(true)` completes the command, `Ok(false)` keeps
/// consuming, `Err(reason)` fails the command and aborts the enclosing
/// submission.
pub type LinePredicate = Box<dyn FnMut(&OutputCapture, &str) -> Result<bool, String> + Send>;

/// A single stdin instruction for a worker process.
///
/// The instruction is written as one line. When `generates_output` is
/// false the command is complete as soon as the instruction has been
/// written and no lines are consumed for it. Otherwise output lines are
/// routed to the predicate for their stream until one of them declares the
/// command complete or failed.
pub struct Command {
    instruction: String,
    generates_output: bool,
    stdout_predicate: LinePredicate,
    stderr_predicate: LinePredicate,
    capture: OutputCapture,
    completed: bool,
}

impl Command {
    /// A command that completes on the first stdout line.
    ///
    /// Override with [`Command::with_stdout_predicate`] for multi-line
    /// responses. Stderr follows the default policy: any non-empty stderr
    /// line fails the command.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            generates_output: true,
            stdout_predicate: Box::new(|_, _| Ok(true)),
            stderr_predicate: default_stderr_predicate(),
            capture: OutputCapture::default(),
            completed: false,
        }
    }

    /// A command that is considered complete as soon as it is written.
    pub fn without_output(instruction: impl Into<String>) -> Self {
        Self {
            generates_output: false,
            ..Self::new(instruction)
        }
    }

    pub fn with_stdout_predicate(
        mut self,
        predicate: impl FnMut(&OutputCapture, &str) -> Result<bool, String> + Send + 'static,
    ) -> Self {
        self.stdout_predicate = Box::new(predicate);
        self
    }

    pub fn with_stderr_predicate(
        mut self,
        predicate: impl FnMut(&OutputCapture, &str) -> Result<bool, String> + Send + 'static,
    ) -> Self {
        self.stderr_predicate = Box::new(predicate);
        self
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn generates_output(&self) -> bool {
        self.generates_output
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Output captured while this command was active.
    pub fn capture(&self) -> &OutputCapture {
        &self.capture
    }

    /// Record one output line and run the matching predicate.
    ///
    /// Returns `Ok(true)` when the command is now complete. The line is
    /// appended to the capture buffers before the predicate runs.
    pub fn observe_line(
        &mut self,
        source: StreamSource,
        line: &str,
    ) -> Result<bool, FailedCommand> {
        self.capture.record(source, line.to_owned());
        let predicate = match source {
            StreamSource::Stdout => &mut self.stdout_predicate,
            StreamSource::Stderr => &mut self.stderr_predicate,
        };
        match predicate(&self.capture, line) {
            Ok(complete) => {
                if complete {
                    self.completed = true;
                }
                Ok(complete)
            }
            Err(reason) => Err(FailedCommand {
                instruction: self.instruction.clone(),
                stream: source,
                line: line.to_owned(),
                reason,
            }),
        }
    }

    /// Mark a non-consuming command complete once its instruction is written.
    pub fn mark_dispatched(&mut self) {
        if !self.generates_output {
            self.completed = true;
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("instruction", &self.instruction)
            .field("generates_output", &self.generates_output)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

fn default_stderr_predicate() -> LinePredicate {
    Box::new(|_, line| {
        if line.is_empty() {
            Ok(false)
        } else {
            Err("unexpected stderr output".to_owned())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_completes_on_first_stdout_line() {
        let mut command = Command::new("echo ready");
        let done = command.observe_line(StreamSource::Stdout, "ready").unwrap();
        assert!(done);
        assert!(command.is_complete());
        assert_eq!(command.capture().stdout_lines(), ["ready"]);
    }

    #[test]
    fn default_stderr_policy_fails_on_non_empty_line() {
        let mut command = Command::new("run");
        let failure = command
            .observe_line(StreamSource::Stderr, "WARN something")
            .unwrap_err();
        assert_eq!(failure.stream, StreamSource::Stderr);
        assert_eq!(failure.line, "WARN something");
        assert_eq!(failure.instruction, "run");
    }

    #[test]
    fn default_stderr_policy_ignores_empty_lines() {
        let mut command = Command::new("run");
        let done = command.observe_line(StreamSource::Stderr, "").unwrap();
        assert!(!done);
        assert!(!command.is_complete());
    }

    #[test]
    fn sentinel_predicate_sees_prior_lines() {
        let mut command = Command::new("dump").with_stdout_predicate(|capture, line| {
            // Sentinel terminator: payload lines precede "EOF".
            Ok(line == "EOF" && !capture.stdout_lines().is_empty())
        });
        assert!(!command.observe_line(StreamSource::Stdout, "a").unwrap());
        assert!(!command.observe_line(StreamSource::Stdout, "b").unwrap());
        assert!(command.observe_line(StreamSource::Stdout, "EOF").unwrap());
        assert_eq!(command.capture().joined_stdout(), "a\nb\nEOF");
    }

    #[test]
    fn predicate_failure_carries_the_offending_line() {
        let mut command = Command::new("check")
            .with_stdout_predicate(|_, line| {
                if line.starts_with("ERR") {
                    Err(format!("worker reported: {line}"))
                } else {
                    Ok(false)
                }
            });
        assert!(!command.observe_line(StreamSource::Stdout, "ok").unwrap());
        let failure = command
            .observe_line(StreamSource::Stdout, "ERR boom")
            .unwrap_err();
        assert_eq!(failure.line, "ERR boom");
        assert!(failure.reason.contains("ERR boom"));
    }

    #[test]
    fn without_output_completes_on_dispatch() {
        let mut command = Command::without_output("exit");
        assert!(!command.generates_output());
        assert!(!command.is_complete());
        command.mark_dispatched();
        assert!(command.is_complete());
    }

    #[test]
    fn mark_dispatched_is_a_no_op_for_consuming_commands() {
        let mut command = Command::new("echo hi");
        command.mark_dispatched();
        assert!(!command.is_complete());
    }
}
