//! A ready-to-use system delegate for terminal builds.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buildsystem::command::Command;
use crate::buildsystem::queue::{ExecutionQueue, LocalExecutionQueue};
use crate::buildsystem::system::{ManifestToken, SystemDelegate};
use crate::util::fs::{FileSystem, LocalFileSystem};

/// Prints diagnostics and command status to stderr and keeps observable
/// error/failure counts.
pub struct ConsoleDelegate {
    name: String,
    version: u32,
    fs: LocalFileSystem,
    jobs: usize,
    quiet: bool,
    errors: AtomicUsize,
    failures: AtomicUsize,
    cancelled: Arc<AtomicBool>,
}

impl ConsoleDelegate {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        ConsoleDelegate {
            name: name.into(),
            version,
            fs: LocalFileSystem,
            jobs: 0,
            quiet: false,
            errors: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Limit worker parallelism; 0 sizes the queue to the machine.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Suppress command status lines.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// The number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Whether any command failed.
    pub fn had_failure(&self) -> bool {
        self.failures.load(Ordering::SeqCst) > 0
    }

    /// Request cancellation: pending commands are skipped and in-flight
    /// processes are killed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl SystemDelegate for ConsoleDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn file_system(&self) -> &dyn FileSystem {
        &self.fs
    }

    fn error(&self, filename: &str, at: Option<&ManifestToken>, message: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        match at {
            Some(token) => eprintln!("{filename}:{}: error: {message}", token.offset),
            None if filename.is_empty() => eprintln!("error: {message}"),
            None => eprintln!("{filename}: error: {message}"),
        }
    }

    fn had_command_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn command_started(&self, command: &dyn Command) {
        if !self.quiet && command.should_show_status() {
            eprintln!("{}", command.short_description());
        }
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        let cancelled = Arc::clone(&self.cancelled);
        let probe = Arc::new(move || cancelled.load(Ordering::SeqCst));
        if self.jobs == 0 {
            Box::new(LocalExecutionQueue::with_default_parallelism(probe))
        } else {
            Box::new(LocalExecutionQueue::new(self.jobs, probe))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counting() {
        let delegate = ConsoleDelegate::new("basic", 0).quiet(true);
        assert_eq!(delegate.error_count(), 0);
        delegate.error("build.toml", None, "boom");
        delegate.error("", None, "bang");
        assert_eq!(delegate.error_count(), 2);
        assert!(!delegate.had_failure());
        delegate.had_command_failure();
        assert!(delegate.had_failure());
    }

    #[test]
    fn test_cancellation_flag() {
        let delegate = ConsoleDelegate::new("basic", 0);
        assert!(!delegate.is_cancelled());
        delegate.cancel();
        assert!(delegate.is_cancelled());
    }
}
