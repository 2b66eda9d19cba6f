//! The execution queue: external work runs here, off the engine thread.
//!
//! Tasks submit opaque jobs; workers run them and funnel results back to
//! the engine through the task handles the jobs capture. The queue is
//! exclusively owned by the build system for the duration of one build and
//! dropping it waits for every job to finish.

use std::process::{Command, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// The cancellation probe workers poll between and during jobs.
pub type CancellationProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// An opaque unit of external work.
pub struct QueueJob {
    /// The owning command's name, for worker logs.
    pub description: String,
    pub work: Box<dyn FnOnce(&mut JobContext<'_>) + Send>,
}

/// The per-job surface workers hand to the job body: process execution
/// and cancellation.
pub struct JobContext<'a> {
    cancelled: &'a (dyn Fn() -> bool + Send + Sync),
}

impl JobContext<'_> {
    pub fn new(cancelled: &(dyn Fn() -> bool + Send + Sync)) -> JobContext<'_> {
        JobContext { cancelled }
    }

    pub fn is_cancelled(&self) -> bool {
        (self.cancelled)()
    }

    /// Run a process to completion. Returns true iff it exited
    /// successfully; a cancellation kills the child and reports failure.
    pub fn execute_process(&mut self, argv: &[String], env: &[(String, String)]) -> bool {
        let Some((program, args)) = argv.split_first() else {
            tracing::error!("refusing to execute empty command line");
            return false;
        };
        if self.is_cancelled() {
            return false;
        }

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::error!("failed to spawn `{program}`: {error}");
                return false;
            }
        };

        loop {
            if self.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
            match child.try_wait() {
                Ok(Some(status)) => return status.success(),
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(error) => {
                    tracing::error!("failed to wait for `{program}`: {error}");
                    return false;
                }
            }
        }
    }

    /// Run a command line through the shell.
    pub fn execute_shell_command(&mut self, command_line: &str) -> bool {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command_line.to_string(),
        ];
        self.execute_process(&argv, &[])
    }
}

/// The queue contract the build system consumes.
pub trait ExecutionQueue {
    fn add_job(&mut self, job: QueueJob);
}

/// A fixed pool of worker threads over a channel.
pub struct LocalExecutionQueue {
    sender: Option<Sender<QueueJob>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl LocalExecutionQueue {
    /// Create a queue with `jobs` workers (at least one) polling
    /// `cancelled` around process execution.
    pub fn new(jobs: usize, cancelled: CancellationProbe) -> Self {
        let (sender, receiver) = channel::<QueueJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        let count = jobs.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = Arc::clone(&receiver);
            let cancelled = Arc::clone(&cancelled);
            workers.push(thread::spawn(move || {
                worker_loop(index, &receiver, &cancelled);
            }));
        }

        LocalExecutionQueue {
            sender: Some(sender),
            workers,
        }
    }

    /// A queue sized to the machine.
    pub fn with_default_parallelism(cancelled: CancellationProbe) -> Self {
        let jobs = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        LocalExecutionQueue::new(jobs, cancelled)
    }
}

fn worker_loop(
    index: usize,
    receiver: &Mutex<Receiver<QueueJob>>,
    cancelled: &CancellationProbe,
) {
    loop {
        let job = {
            let Ok(guard) = receiver.lock() else { return };
            guard.recv()
        };
        let Ok(job) = job else {
            return;
        };
        tracing::debug!(worker = index, command = %job.description, "running job");
        let mut context = JobContext {
            cancelled: &**cancelled,
        };
        (job.work)(&mut context);
    }
}

impl ExecutionQueue for LocalExecutionQueue {
    fn add_job(&mut self, job: QueueJob) {
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                tracing::error!("execution queue workers exited early");
            }
        }
    }
}

impl Drop for LocalExecutionQueue {
    fn drop(&mut self) {
        // Disconnect the channel so workers drain and exit, then wait for
        // every in-flight job.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
