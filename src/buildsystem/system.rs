//! The build system: projecting the build-file model onto engine rules.
//!
//! Every engine key the build system mints maps to a rule through
//! [`SystemEngineDelegate::lookup_rule`]: targets re-run every build and
//! fan out to their nodes, input nodes validate against the filesystem,
//! produced nodes chain to their producer command, and commands delegate
//! validity to their tool-specific logic and run their bodies on the
//! execution queue.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::buildsystem::buildfile::{BuildFile, BuildNode};
use crate::buildsystem::command::{Command, ExecutionContext, Tool};
use crate::buildsystem::key::BuildKey;
use crate::buildsystem::queue::{ExecutionQueue, QueueJob};
use crate::buildsystem::value::BuildValue;
use crate::engine::db::FileBuildDb;
use crate::engine::rule::{EngineDelegate, Key, Rule, Task, TaskInterface, ValueData};
use crate::engine::BuildEngine;
use crate::util::fs::{FileInfo, FileSystem};

/// The engine-side schema version, merged with the client's 16-bit
/// version into the persisted 32-bit identifier.
const INTERNAL_SCHEMA_VERSION: u32 = 1;

/// A source location inside the manifest, as a byte offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestToken {
    pub offset: usize,
    pub length: usize,
}

/// The client surface of the build system.
///
/// Implementations must be shareable across the engine thread and queue
/// workers; the command-status and error hooks fire from workers.
pub trait SystemDelegate: Send + Sync {
    /// The client name the manifest must declare.
    fn name(&self) -> &str;

    /// The client version the manifest must declare (16-bit).
    fn version(&self) -> u32;

    fn file_system(&self) -> &dyn FileSystem;

    /// Observes the raw manifest contents before parsing, so diagnostics
    /// can resolve tokens to lines.
    fn file_contents_being_parsed(&self, _buffer: &[u8]) {}

    /// Report an error. `filename` is the manifest or another involved
    /// file; `at` locates manifest errors when known.
    fn error(&self, filename: &str, at: Option<&ManifestToken>, message: &str);

    /// A command failed (or a target could not be built).
    fn had_command_failure(&self);

    fn is_cancelled(&self) -> bool {
        false
    }

    fn command_started(&self, _command: &dyn Command) {}

    fn command_finished(&self, _command: &dyn Command) {}

    /// Give the client a chance to supply a tool before the builtins are
    /// consulted.
    fn lookup_tool(&self, _name: &str) -> Option<Box<dyn Tool>> {
        None
    }

    /// Create the execution queue for one build.
    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue>;
}

/// State shared between the build system, the engine delegate and tasks.
struct SystemState {
    delegate: Arc<dyn SystemDelegate>,
    main_path: PathBuf,
    main_filename: String,
    file: RefCell<Option<Arc<BuildFile>>>,
    /// Only populated while a build is in progress.
    queue: RefCell<Option<Box<dyn ExecutionQueue>>>,
    /// Nodes minted for keys that name no declared node (e.g. discovered
    /// dependencies from earlier builds).
    dynamic_nodes: RefCell<HashMap<String, BuildNode>>,
    /// Commands minted for custom-task keys, owned for the build's
    /// duration.
    custom_commands: RefCell<Vec<Arc<dyn Command>>>,
}

impl SystemState {
    fn error(&self, message: &str) {
        self.delegate.error(&self.main_filename, None, message);
    }

    fn file(&self) -> Option<Arc<BuildFile>> {
        self.file.borrow().clone()
    }
}

fn decode_value(data: &ValueData) -> BuildValue {
    match BuildValue::from_data(data) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!("malformed build value: {error}");
            BuildValue::Invalid
        }
    }
}

// ---------------------------------------------------------------------------
// Task family
// ---------------------------------------------------------------------------

/// Translates a target request into requests for all of its nodes.
struct TargetTask {
    state: Rc<SystemState>,
    name: String,
    node_names: Vec<String>,
    missing_input: bool,
    failed_input: bool,
}

impl Task for TargetTask {
    fn start(&mut self, ti: &mut TaskInterface<'_>) {
        for (id, node) in self.node_names.iter().enumerate() {
            ti.needs_input(BuildKey::node(node.as_str()).to_data(), id);
        }
    }

    fn provide_value(&mut self, _ti: &mut TaskInterface<'_>, input_id: usize, value: &ValueData) {
        match decode_value(value) {
            BuildValue::MissingInput => {
                self.missing_input = true;
                let name = self
                    .node_names
                    .get(input_id)
                    .map(String::as_str)
                    .unwrap_or("<unknown>");
                self.state
                    .error(&format!("missing input '{name}' and no rule to build it"));
            }
            BuildValue::FailedInput => self.failed_input = true,
            _ => {}
        }
    }

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>) {
        if self.missing_input || self.failed_input {
            self.state
                .error(&format!("cannot build target '{}' due to missing input", self.name));
            self.state.delegate.had_command_failure();
        }
        // The target value never validates, so targets re-visit their
        // nodes every build while the nodes stay cached.
        ti.complete(BuildValue::Target.to_data());
    }
}

/// Produces the value for a pure input node.
struct InputNodeTask {
    state: Rc<SystemState>,
    node: BuildNode,
}

impl Task for InputNodeTask {
    fn start(&mut self, _ti: &mut TaskInterface<'_>) {}

    fn provide_value(&mut self, _ti: &mut TaskInterface<'_>, _input_id: usize, _value: &ValueData) {
    }

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>) {
        if self.node.is_virtual {
            ti.complete(BuildValue::VirtualInput.to_data());
            return;
        }
        let info = self
            .state
            .delegate
            .file_system()
            .get_file_info(Path::new(&self.node.name));
        if info.is_missing() {
            ti.complete(BuildValue::MissingInput.to_data());
        } else {
            ti.complete(BuildValue::ExistingInput(info).to_data());
        }
    }
}

/// Chains a produced node to its producer command and projects the
/// command's value onto this output.
struct ProducedNodeTask {
    state: Rc<SystemState>,
    node_name: String,
    node_ix: usize,
    producers: Vec<usize>,
    producer: Option<Arc<dyn Command>>,
    result: Option<BuildValue>,
    invalid: bool,
}

impl Task for ProducedNodeTask {
    fn start(&mut self, ti: &mut TaskInterface<'_>) {
        let Some(file) = self.state.file() else {
            self.invalid = true;
            return;
        };
        if self.producers.len() == 1 {
            let command = Arc::clone(file.command(self.producers[0]));
            ti.needs_input(BuildKey::command(command.name()).to_data(), 0);
            self.producer = Some(command);
            return;
        }

        // Building nodes with multiple producers is unsupported.
        let first = file.command(self.producers[0]).name().to_string();
        let second = file.command(self.producers[1]).name().to_string();
        self.state.error(&format!(
            "unable to build node: '{}' (node is produced by multiple commands; e.g., '{}' and '{}')",
            self.node_name, first, second
        ));
        self.invalid = true;
    }

    fn provide_value(&mut self, _ti: &mut TaskInterface<'_>, _input_id: usize, value: &ValueData) {
        let (Some(producer), Some(file)) = (&self.producer, self.state.file()) else {
            return;
        };
        self.result =
            Some(producer.get_result_for_output(&file, self.node_ix, &decode_value(value)));
    }

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>) {
        if self.invalid {
            ti.complete(BuildValue::FailedInput.to_data());
            return;
        }
        match self.result.take() {
            Some(result) => ti.complete(result.to_data()),
            None => ti.complete(BuildValue::Invalid.to_data()),
        }
    }
}

/// Drives one command: requests its declared inputs, skips on missing or
/// failed inputs (and cancellation), and otherwise runs the command body
/// as a queue job that stats the declared outputs on success.
struct CommandTask {
    state: Rc<SystemState>,
    command: Arc<dyn Command>,
    input_names: Vec<String>,
    should_skip: bool,
    missing_input: bool,
}

impl Task for CommandTask {
    fn start(&mut self, ti: &mut TaskInterface<'_>) {
        let Some(file) = self.state.file() else {
            self.should_skip = true;
            return;
        };
        for (id, &node_ix) in self.command.inputs().iter().enumerate() {
            let name = file.node(node_ix).name.clone();
            ti.needs_input(BuildKey::node(name.as_str()).to_data(), id);
            self.input_names.push(name);
        }
        let base = self.command.inputs().len();
        for (offset, key) in self.command.custom_inputs().into_iter().enumerate() {
            self.input_names.push(key.name().to_string());
            ti.needs_input(key.to_data(), base + offset);
        }
    }

    fn provide_value(&mut self, _ti: &mut TaskInterface<'_>, input_id: usize, value: &ValueData) {
        match decode_value(value) {
            BuildValue::MissingInput => {
                self.should_skip = true;
                self.missing_input = true;
                let name = self
                    .input_names
                    .get(input_id)
                    .map(String::as_str)
                    .unwrap_or("<unknown>");
                self.state
                    .error(&format!("missing input '{name}' and no rule to build it"));
            }
            BuildValue::FailedInput
            | BuildValue::FailedCommand
            | BuildValue::SkippedCommand
            | BuildValue::Invalid => self.should_skip = true,
            _ => {}
        }
    }

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>) {
        if self.state.delegate.is_cancelled() {
            ti.complete(BuildValue::SkippedCommand.to_data());
            return;
        }
        if self.should_skip {
            if self.missing_input {
                self.state.delegate.had_command_failure();
            }
            ti.complete(BuildValue::SkippedCommand.to_data());
            return;
        }
        let Some(file) = self.state.file() else {
            ti.complete(BuildValue::SkippedCommand.to_data());
            return;
        };

        let signature = self.command.signature(&file);
        let output_names: Vec<String> = self
            .command
            .outputs()
            .iter()
            .map(|&ix| file.node(ix).name.clone())
            .collect();
        let command = Arc::clone(&self.command);
        let delegate = Arc::clone(&self.state.delegate);
        let handle = ti.handle();
        let main_filename = self.state.main_filename.clone();

        let job = QueueJob {
            description: command.name().to_string(),
            work: Box::new(move |job_cx| {
                delegate.command_started(command.as_ref());
                let fs = delegate.file_system();
                let cx = ExecutionContext {
                    file: &file,
                    fs,
                    delegate: delegate.as_ref(),
                    handle: &handle,
                    main_filename: &main_filename,
                };
                let success = command.execute(&cx, job_cx);
                delegate.command_finished(command.as_ref());

                if !success {
                    delegate.had_command_failure();
                    handle.complete(BuildValue::FailedCommand.to_data(), false);
                    return;
                }
                let outputs: Vec<FileInfo> = output_names
                    .iter()
                    .map(|name| fs.get_file_info(Path::new(name)))
                    .collect();
                handle.complete(
                    BuildValue::SuccessfulCommand { outputs, signature }.to_data(),
                    false,
                );
            }),
        };

        match self.state.queue.borrow_mut().as_mut() {
            Some(queue) => queue.add_job(job),
            None => ti.complete(BuildValue::SkippedCommand.to_data()),
        }
    }
}

/// Stands in for a command that is no longer in the manifest: completes
/// `Invalid` with a forced change so every dependent rebuilds and observes
/// the absence.
struct MissingCommandTask;

impl Task for MissingCommandTask {
    fn start(&mut self, _ti: &mut TaskInterface<'_>) {}

    fn provide_value(&mut self, _ti: &mut TaskInterface<'_>, _input_id: usize, _value: &ValueData) {
    }

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>) {
        ti.complete_forced(BuildValue::Invalid.to_data());
    }
}

// ---------------------------------------------------------------------------
// Rule construction
// ---------------------------------------------------------------------------

fn missing_rule(key: &[u8]) -> Rule {
    Rule {
        key: key.to_vec(),
        action: Box::new(|| Box::new(MissingCommandTask)),
        is_valid: Box::new(|_| false),
    }
}

fn target_rule(state: Rc<SystemState>, key: &[u8], name: String, node_names: Vec<String>) -> Rule {
    Rule {
        key: key.to_vec(),
        action: Box::new(move || {
            Box::new(TargetTask {
                state: Rc::clone(&state),
                name: name.clone(),
                node_names: node_names.clone(),
                missing_input: false,
                failed_input: false,
            })
        }),
        is_valid: Box::new(|_| false),
    }
}

fn input_node_rule(state: Rc<SystemState>, key: &[u8], node: BuildNode) -> Rule {
    let action_state = Rc::clone(&state);
    let action_node = node.clone();
    Rule {
        key: key.to_vec(),
        action: Box::new(move || {
            Box::new(InputNodeTask {
                state: Rc::clone(&action_state),
                node: action_node.clone(),
            })
        }),
        is_valid: Box::new(move |prior| {
            let Ok(value) = BuildValue::from_data(prior) else {
                return false;
            };
            if node.is_virtual {
                return value.is_virtual_input();
            }
            let info = state
                .delegate
                .file_system()
                .get_file_info(Path::new(&node.name));
            if info.is_missing() {
                value.is_missing_input()
            } else {
                value == BuildValue::ExistingInput(info)
            }
        }),
    }
}

fn produced_node_rule(
    state: Rc<SystemState>,
    key: &[u8],
    node_name: String,
    node_ix: usize,
    producers: Vec<usize>,
) -> Rule {
    Rule {
        key: key.to_vec(),
        action: Box::new(move || {
            Box::new(ProducedNodeTask {
                state: Rc::clone(&state),
                node_name: node_name.clone(),
                node_ix,
                producers: producers.clone(),
                producer: None,
                result: None,
                invalid: false,
            })
        }),
        // A failed result always re-runs so the error is reproduced.
        is_valid: Box::new(|prior| match BuildValue::from_data(prior) {
            Ok(value) => !value.is_failed_input(),
            Err(_) => false,
        }),
    }
}

fn command_rule(state: Rc<SystemState>, key: &[u8], command: Arc<dyn Command>) -> Rule {
    let action_state = Rc::clone(&state);
    let action_command = Arc::clone(&command);
    Rule {
        key: key.to_vec(),
        action: Box::new(move || {
            Box::new(CommandTask {
                state: Rc::clone(&action_state),
                command: Arc::clone(&action_command),
                input_names: Vec::new(),
                should_skip: false,
                missing_input: false,
            })
        }),
        is_valid: Box::new(move |prior| {
            let Ok(value) = BuildValue::from_data(prior) else {
                return false;
            };
            let Some(file) = state.file() else {
                return false;
            };
            command.is_result_valid(&file, state.delegate.file_system(), &value)
        }),
    }
}

// ---------------------------------------------------------------------------
// Engine delegate
// ---------------------------------------------------------------------------

struct SystemEngineDelegate {
    state: Rc<SystemState>,
}

impl EngineDelegate for SystemEngineDelegate {
    fn lookup_rule(&mut self, key_data: &[u8]) -> Rule {
        let key = match BuildKey::from_data(key_data) {
            Ok(key) => key,
            Err(error) => {
                self.state.error(&format!("invalid build key: {error}"));
                return missing_rule(key_data);
            }
        };
        let Some(file) = self.state.file() else {
            return missing_rule(key_data);
        };

        match key {
            BuildKey::Command(name) => match file.command_named(&name) {
                Some(command) => {
                    command_rule(Rc::clone(&self.state), key_data, Arc::clone(command))
                }
                // The command is gone from the manifest; force dependents
                // to rebuild and observe the absence.
                None => missing_rule(key_data),
            },

            BuildKey::CustomTask { .. } => {
                for tool in file.tools() {
                    let Some(command) = tool.create_custom_command(&key) else {
                        continue;
                    };
                    let command: Arc<dyn Command> = Arc::from(command);
                    self.state
                        .custom_commands
                        .borrow_mut()
                        .push(Arc::clone(&command));
                    return command_rule(Rc::clone(&self.state), key_data, command);
                }
                missing_rule(key_data)
            }

            BuildKey::Node(name) => {
                if let Some(node_ix) = file.node_named(&name) {
                    let node = file.node(node_ix).clone();
                    if node.producers.is_empty() {
                        input_node_rule(Rc::clone(&self.state), key_data, node)
                    } else {
                        produced_node_rule(
                            Rc::clone(&self.state),
                            key_data,
                            node.name,
                            node_ix,
                            node.producers,
                        )
                    }
                } else {
                    // Mint nodes on the fly for unknown names; they are
                    // pure inputs.
                    let node = self
                        .state
                        .dynamic_nodes
                        .borrow_mut()
                        .entry(name.clone())
                        .or_insert_with(|| BuildNode::new(name.clone()))
                        .clone();
                    input_node_rule(Rc::clone(&self.state), key_data, node)
                }
            }

            BuildKey::Target(name) => match file.target_named(&name) {
                Some(target) => {
                    let node_names = target
                        .nodes
                        .iter()
                        .map(|&ix| file.node(ix).name.clone())
                        .collect();
                    target_rule(Rc::clone(&self.state), key_data, name, node_names)
                }
                None => {
                    self.state.error(&format!("unknown target '{name}'"));
                    missing_rule(key_data)
                }
            },
        }
    }

    fn cycle_detected(&mut self, cycle: &[Key]) {
        let mut message = String::from("cycle detected while building: ");
        for (index, key_data) in cycle.iter().enumerate() {
            if index > 0 {
                message.push_str(" -> ");
            }
            match BuildKey::from_data(key_data) {
                Ok(key) => {
                    let _ = write!(message, "{key}");
                }
                Err(_) => message.push_str("((unknown))"),
            }
        }
        self.state.error(&message);
    }
}

// ---------------------------------------------------------------------------
// BuildSystem
// ---------------------------------------------------------------------------

/// The top-level entry point: binds a delegate and a manifest, and builds
/// named targets through the engine.
pub struct BuildSystem {
    state: Rc<SystemState>,
    engine: BuildEngine<SystemEngineDelegate>,
}

impl BuildSystem {
    pub fn new(delegate: Arc<dyn SystemDelegate>, main_filename: impl Into<PathBuf>) -> Self {
        let main_path = main_filename.into();
        let state = Rc::new(SystemState {
            delegate,
            main_filename: main_path.display().to_string(),
            main_path,
            file: RefCell::new(None),
            queue: RefCell::new(None),
            dynamic_nodes: RefCell::new(HashMap::new()),
            custom_commands: RefCell::new(Vec::new()),
        });
        let engine = BuildEngine::new(SystemEngineDelegate {
            state: Rc::clone(&state),
        });
        BuildSystem { state, engine }
    }

    /// The schema version for the persisted database: the internal version
    /// merged with the client's 16-bit version.
    fn merged_schema_version(&self) -> Result<u32> {
        let client = self.state.delegate.version();
        if client > u32::from(u16::MAX) {
            bail!("unsupported client version {client}");
        }
        Ok(INTERNAL_SCHEMA_VERSION | (client << 16))
    }

    /// Attach the on-disk build database at `path`. Must precede the
    /// first build; fails if the database carries a different schema
    /// version.
    pub fn attach_db(&mut self, path: &Path) -> Result<()> {
        let version = self.merged_schema_version()?;
        let db = FileBuildDb::open(path, version)?;
        self.engine.attach_db(Box::new(db))
    }

    /// Record an execution trace at `path`.
    pub fn enable_tracing(&mut self, path: &Path) -> Result<()> {
        self.engine.enable_tracing(path)
    }

    /// The loaded build file, if any build has loaded it.
    pub fn build_file(&self) -> Option<Arc<BuildFile>> {
        self.state.file()
    }

    fn ensure_loaded(&mut self) -> bool {
        if self.state.file.borrow().is_some() {
            return true;
        }
        match BuildFile::load(&self.state.main_path, self.state.delegate.as_ref()) {
            Ok(file) => {
                *self.state.file.borrow_mut() = Some(Arc::new(file));
                true
            }
            Err(error) => {
                tracing::debug!("build file load failed: {error:#}");
                self.state.error("unable to load build file");
                false
            }
        }
    }

    /// Build the named target. Returns false if the manifest could not be
    /// loaded or the build aborted on a cycle; command failures are
    /// reported through the delegate and do not fail the call.
    pub fn build(&mut self, target: &str) -> bool {
        if !self.ensure_loaded() {
            return false;
        }

        *self.state.queue.borrow_mut() = Some(self.state.delegate.create_execution_queue());
        let result = self.engine.build(&BuildKey::target(target).to_data());

        // Dropping the queue waits for every in-flight job; only then is
        // the build truly finished.
        let queue = self.state.queue.borrow_mut().take();
        drop(queue);

        result.is_some()
    }
}
