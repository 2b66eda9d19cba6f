//! The phony tool: commands that consume inputs and produce outputs with
//! no observable side effect. Useful for grouping and ordering.

use crate::buildsystem::buildfile::{AttrValue, BuildFile};
use crate::buildsystem::command::{
    Command, ConfigureContext, ExecutionContext, ExternalCommand, Tool,
};
use crate::buildsystem::queue::JobContext;
use crate::buildsystem::value::BuildValue;
use crate::util::fs::FileSystem;

pub struct PhonyTool;

impl Tool for PhonyTool {
    fn name(&self) -> &str {
        "phony"
    }

    fn create_command(&self, name: &str) -> Box<dyn Command> {
        Box::new(PhonyCommand {
            base: ExternalCommand::new(name),
        })
    }
}

struct PhonyCommand {
    base: ExternalCommand,
}

impl Command for PhonyCommand {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn short_description(&self) -> String {
        self.base.name().to_string()
    }

    fn should_show_status(&self) -> bool {
        false
    }

    fn configure_description(&mut self, value: &str) {
        self.base.set_description(value);
    }

    fn configure_inputs(&mut self, _ctx: &ConfigureContext<'_>, inputs: Vec<usize>) {
        self.base.set_inputs(inputs);
    }

    fn configure_outputs(&mut self, _ctx: &ConfigureContext<'_>, outputs: Vec<usize>) {
        self.base.set_outputs(outputs);
    }

    fn configure_attribute(
        &mut self,
        ctx: &ConfigureContext<'_>,
        name: &str,
        _value: &AttrValue,
    ) -> bool {
        ctx.error(format!("unexpected attribute: '{name}'"));
        false
    }

    fn inputs(&self) -> &[usize] {
        self.base.inputs()
    }

    fn outputs(&self) -> &[usize] {
        self.base.outputs()
    }

    fn signature(&self, file: &BuildFile) -> u64 {
        self.base.base_signature(file)
    }

    fn is_result_valid(&self, file: &BuildFile, fs: &dyn FileSystem, prior: &BuildValue) -> bool {
        self.base
            .default_is_result_valid(file, fs, prior, self.signature(file))
    }

    fn get_result_for_output(
        &self,
        file: &BuildFile,
        node: usize,
        value: &BuildValue,
    ) -> BuildValue {
        self.base.default_result_for_output(file, node, value)
    }

    fn execute(&self, _cx: &ExecutionContext<'_>, _job: &mut JobContext<'_>) -> bool {
        // Nothing to do for phony commands.
        true
    }
}
