//! A caller's unit of work: an ordered command sequence plus lifecycle
//! hooks, executed on exactly one worker process.

use std::fmt;

use crate::command::Command;

/// Ordered sequence of [`Command`]s executed strictly sequentially on one
/// worker process.
///
/// `T` is the value published through the submission handle on success,
/// produced by the closure installed with [`Submission::result_with`]
/// (which gets read access to the executed commands and their captured
/// output).
pub struct Submission<T> {
    commands: Vec<Command>,
    terminate_after: bool,
    on_start: Option<Box<dyn FnMut(Option<u32>) + Send>>,
    on_finish: Option<Box<dyn FnMut() + Send>>,
    result: Box<dyn FnOnce(&[Command]) -> T + Send>,
}

impl Submission<()> {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            terminate_after: false,
            on_start: None,
            on_finish: None,
            result: Box::new(|_| ()),
        }
    }

    pub fn single(command: Command) -> Self {
        Self::new(vec![command])
    }
}

impl<T> Submission<T> {
    /// Terminate and replace the executing worker process after this
    /// submission, regardless of outcome.
    pub fn with_terminate_after(mut self, terminate_after: bool) -> Self {
        self.terminate_after = terminate_after;
        self
    }

    /// Hook invoked just before the first instruction is dispatched, with
    /// the worker's OS process id when the platform reports one.
    pub fn on_start(mut self, hook: impl FnMut(Option<u32>) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Hook invoked when the command sequence ends, normally or through a
    /// failed command. Not invoked for cancelled submissions.
    pub fn on_finish(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Install the result producer. It runs after the last command has
    /// completed and its return value is what the submission handle yields.
    pub fn result_with<U>(
        self,
        result: impl FnOnce(&[Command]) -> U + Send + 'static,
    ) -> Submission<U> {
        Submission {
            commands: self.commands,
            terminate_after: self.terminate_after,
            on_start: self.on_start,
            on_finish: self.on_finish,
            result: Box::new(result),
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Produce the result value. Consumes the submission; called once,
    /// after successful execution.
    pub fn into_result(self) -> T {
        (self.result)(&self.commands)
    }

    /// Tear the submission apart into its recallable parts.
    pub fn into_parts(self) -> (Vec<Command>, bool) {
        (self.commands, self.terminate_after)
    }
}

/// Seam between the executor engine and whatever it is running: caller
/// submissions and process-manager startup/termination sequences drive the
/// same engine through this trait.
pub trait Work: Send {
    fn commands_mut(&mut self) -> &mut [Command];
    fn terminate_after(&self) -> bool;
    fn notify_start(&mut self, pid: Option<u32>);
    fn notify_finish(&mut self);
}

impl<T: Send> Work for Submission<T> {
    fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    fn terminate_after(&self) -> bool {
        self.terminate_after
    }

    fn notify_start(&mut self, pid: Option<u32>) {
        if let Some(hook) = self.on_start.as_mut() {
            hook(pid);
        }
    }

    fn notify_finish(&mut self) {
        if let Some(hook) = self.on_finish.as_mut() {
            hook();
        }
    }
}

impl<T> fmt::Debug for Submission<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("commands", &self.commands)
            .field("terminate_after", &self.terminate_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::command::StreamSource;

    #[test]
    fn hooks_fire_in_order() {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let started_hook = started.clone();
        let finished_hook = finished.clone();

        let mut submission = Submission::single(Command::without_output("noop"))
            .on_start(move |_| started_hook.store(true, Ordering::SeqCst))
            .on_finish(move || finished_hook.store(true, Ordering::SeqCst));

        submission.notify_start(Some(42));
        assert!(started.load(Ordering::SeqCst));
        assert!(!finished.load(Ordering::SeqCst));
        submission.notify_finish();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn result_producer_reads_captured_output() {
        let mut submission = Submission::single(Command::new("echo hi"))
            .result_with(|commands| commands[0].capture().joined_stdout());

        submission.commands_mut()[0]
            .observe_line(StreamSource::Stdout, "hi")
            .unwrap();
        assert_eq!(submission.into_result(), "hi");
    }

    #[test]
    fn unit_submission_produces_unit() {
        let submission = Submission::new(vec![]);
        submission.into_result();
    }

    #[test]
    fn into_parts_preserves_flags() {
        let submission =
            Submission::single(Command::new("x")).with_terminate_after(true);
        let (commands, terminate_after) = submission.into_parts();
        assert_eq!(commands.len(), 1);
        assert!(terminate_after);
    }

    #[test]
    fn on_start_may_run_multiple_times_across_generations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut submission = Submission::new(vec![]).on_start(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        submission.notify_start(None);
        submission.notify_start(Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
