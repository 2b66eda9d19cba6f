//! Commands and tools.
//!
//! A [`Tool`] is a factory for [`Command`]s and a handler for tool-scoped
//! attributes. Commands are configured while the build file loads and are
//! immutable afterwards: they are shared read-only between the engine
//! thread (input requests, validity checks) and queue workers (the
//! `execute` body).

use std::path::Path;

use crate::buildsystem::buildfile::{AttrValue, BuildFile, BuildNode};
use crate::buildsystem::key::BuildKey;
use crate::buildsystem::queue::JobContext;
use crate::buildsystem::system::SystemDelegate;
use crate::buildsystem::value::BuildValue;
use crate::engine::rule::TaskHandle;
use crate::util::fs::FileSystem;
use crate::util::hash::Signature;

/// Context handed to tools and commands while attributes are configured.
pub struct ConfigureContext<'a> {
    pub(crate) delegate: &'a dyn SystemDelegate,
    pub(crate) filename: &'a str,
    pub(crate) nodes: &'a [BuildNode],
}

impl ConfigureContext<'_> {
    /// Report a configuration error against the manifest.
    pub fn error(&self, message: impl AsRef<str>) {
        self.delegate.error(self.filename, None, message.as_ref());
    }

    /// The name of a node by arena index.
    pub fn node_name(&self, index: usize) -> &str {
        self.nodes.get(index).map(|n| n.name.as_str()).unwrap_or("")
    }
}

/// Context available to a command body running on a queue worker.
pub struct ExecutionContext<'a> {
    pub file: &'a BuildFile,
    pub fs: &'a dyn FileSystem,
    pub delegate: &'a dyn SystemDelegate,
    pub handle: &'a TaskHandle,
    pub main_filename: &'a str,
}

impl ExecutionContext<'_> {
    /// Report an execution error against `filename` (or the main build
    /// file when empty).
    pub fn error(&self, filename: &str, message: impl AsRef<str>) {
        let filename = if filename.is_empty() {
            self.main_filename
        } else {
            filename
        };
        self.delegate.error(filename, None, message.as_ref());
    }

    /// Declare a dependency discovered while executing, by node name.
    pub fn discovered_dependency(&self, node_name: &str) {
        self.handle
            .discovered_dependency(BuildKey::node(node_name).to_data());
    }
}

/// A factory for commands, plus a handler for tool-scoped attributes.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Handle a tool-scoped attribute. Returns false (after reporting) for
    /// unsupported attributes.
    fn configure_attribute(
        &mut self,
        ctx: &ConfigureContext<'_>,
        name: &str,
        _value: &AttrValue,
    ) -> bool {
        ctx.error(format!("unexpected attribute: '{name}'"));
        false
    }

    /// Create a command of this tool's kind.
    fn create_command(&self, name: &str) -> Box<dyn Command>;

    /// Create a command for a custom-task key, if this tool claims it.
    fn create_custom_command(&self, _key: &BuildKey) -> Option<Box<dyn Command>> {
        None
    }
}

/// A unit of work transforming declared inputs into declared outputs.
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// A one-line description for status output.
    fn short_description(&self) -> String;

    fn verbose_description(&self) -> String {
        self.short_description()
    }

    /// Whether the command should appear in status output.
    fn should_show_status(&self) -> bool {
        true
    }

    fn configure_description(&mut self, _value: &str) {}

    fn configure_inputs(&mut self, ctx: &ConfigureContext<'_>, inputs: Vec<usize>);

    fn configure_outputs(&mut self, ctx: &ConfigureContext<'_>, outputs: Vec<usize>);

    /// Handle a command-scoped attribute. Returns false (after reporting)
    /// for unsupported attributes.
    fn configure_attribute(
        &mut self,
        ctx: &ConfigureContext<'_>,
        name: &str,
        value: &AttrValue,
    ) -> bool;

    /// Declared input nodes, by arena index.
    fn inputs(&self) -> &[usize];

    /// Declared output nodes, by arena index.
    fn outputs(&self) -> &[usize];

    /// Extra engine keys to request before execution, beyond the declared
    /// inputs. Used by tools that stage work through custom tasks.
    fn custom_inputs(&self) -> Vec<BuildKey> {
        Vec::new()
    }

    /// A hash summarizing the tool-visible invocation parameters.
    fn signature(&self, file: &BuildFile) -> u64;

    /// Whether `prior` can be reused without re-running this command.
    fn is_result_valid(&self, file: &BuildFile, fs: &dyn FileSystem, prior: &BuildValue) -> bool;

    /// Project a command value onto one of its declared outputs.
    fn get_result_for_output(
        &self,
        file: &BuildFile,
        node: usize,
        value: &BuildValue,
    ) -> BuildValue;

    /// Run the command body on a queue worker. Returns success.
    fn execute(&self, cx: &ExecutionContext<'_>, job: &mut JobContext<'_>) -> bool;
}

/// Shared state and behavior for commands that run external work: declared
/// inputs and outputs, a description, and the default signature, validity
/// and output-projection logic.
#[derive(Debug, Default)]
pub struct ExternalCommand {
    name: String,
    description: String,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl ExternalCommand {
    pub fn new(name: impl Into<String>) -> Self {
        ExternalCommand {
            name: name.into(),
            ..ExternalCommand::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, value: &str) {
        self.description = value.to_string();
    }

    pub fn set_inputs(&mut self, inputs: Vec<usize>) {
        self.inputs = inputs;
    }

    pub fn set_outputs(&mut self, outputs: Vec<usize>) {
        self.outputs = outputs;
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    /// The signature contribution shared by all external commands: a hash
    /// over the declared output names.
    pub fn base_signature(&self, file: &BuildFile) -> u64 {
        let mut signature = Signature::new();
        for &output in &self.outputs {
            signature = signature.combine_str(file.node(output).name.as_str());
        }
        signature.value()
    }

    /// The default validity check: the prior run succeeded with the same
    /// signature, and every declared output's file info is unchanged.
    pub fn default_is_result_valid(
        &self,
        file: &BuildFile,
        fs: &dyn FileSystem,
        prior: &BuildValue,
        current_signature: u64,
    ) -> bool {
        let BuildValue::SuccessfulCommand { outputs, signature } = prior else {
            return false;
        };
        if *signature != current_signature || outputs.len() != self.outputs.len() {
            return false;
        }
        for (&node, recorded) in self.outputs.iter().zip(outputs) {
            let info = fs.get_file_info(Path::new(&file.node(node).name));
            if info != *recorded {
                return false;
            }
        }
        true
    }

    /// The default projection of a command value onto one output node.
    pub fn default_result_for_output(
        &self,
        file: &BuildFile,
        node: usize,
        value: &BuildValue,
    ) -> BuildValue {
        match value {
            BuildValue::SuccessfulCommand { outputs, .. } => {
                if file.node(node).is_virtual {
                    return BuildValue::VirtualInput;
                }
                let info = self
                    .outputs
                    .iter()
                    .position(|&output| output == node)
                    .and_then(|position| outputs.get(position));
                match info {
                    Some(info) if !info.is_missing() => BuildValue::ExistingInput(*info),
                    _ => BuildValue::MissingInput,
                }
            }
            _ => BuildValue::FailedInput,
        }
    }
}
