//! Mock delegates for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buildsystem::command::{Command, Tool};
use crate::buildsystem::queue::{ExecutionQueue, LocalExecutionQueue};
use crate::buildsystem::system::{ManifestToken, SystemDelegate};
use crate::util::fs::{FileSystem, LocalFileSystem};

type ToolFactory = Box<dyn Fn(&str) -> Option<Box<dyn Tool>> + Send + Sync>;

/// A system delegate that records everything it observes.
pub struct RecordingDelegate {
    name: String,
    version: u32,
    fs: LocalFileSystem,
    errors: Mutex<Vec<String>>,
    failures: AtomicUsize,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    cancelled: Arc<AtomicBool>,
    tool_factory: Option<ToolFactory>,
}

impl RecordingDelegate {
    pub fn new(name: &str, version: u32) -> Self {
        RecordingDelegate {
            name: name.to_string(),
            version,
            fs: LocalFileSystem,
            errors: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            tool_factory: None,
        }
    }

    /// Supply client tools by name.
    pub fn with_tool_factory(
        mut self,
        factory: impl Fn(&str) -> Option<Box<dyn Tool>> + Send + Sync + 'static,
    ) -> Self {
        self.tool_factory = Some(Box::new(factory));
        self
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl SystemDelegate for RecordingDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn file_system(&self) -> &dyn FileSystem {
        &self.fs
    }

    fn error(&self, _filename: &str, _at: Option<&ManifestToken>, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn had_command_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn command_started(&self, command: &dyn Command) {
        self.started.lock().unwrap().push(command.name().to_string());
    }

    fn command_finished(&self, command: &dyn Command) {
        self.finished
            .lock()
            .unwrap()
            .push(command.name().to_string());
    }

    fn lookup_tool(&self, name: &str) -> Option<Box<dyn Tool>> {
        self.tool_factory.as_ref().and_then(|factory| factory(name))
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        let cancelled = Arc::clone(&self.cancelled);
        Box::new(LocalExecutionQueue::new(
            2,
            Arc::new(move || cancelled.load(Ordering::SeqCst)),
        ))
    }
}
