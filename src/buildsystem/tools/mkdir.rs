//! The mkdir tool: create a directory (including parents).
//!
//! Takes no inputs and exactly one non-virtual output. The recorded file
//! info of the created directory is deliberately not part of the validity
//! check: the result stays valid as long as the output exists and is
//! still a directory, so unrelated timestamp changes never re-run it.

use std::path::Path;

use crate::buildsystem::buildfile::{AttrValue, BuildFile};
use crate::buildsystem::command::{
    Command, ConfigureContext, ExecutionContext, ExternalCommand, Tool,
};
use crate::buildsystem::queue::JobContext;
use crate::buildsystem::value::BuildValue;
use crate::util::fs::FileSystem;
use crate::util::hash::hash64_str;

pub struct MkdirTool;

impl Tool for MkdirTool {
    fn name(&self) -> &str {
        "mkdir"
    }

    fn create_command(&self, name: &str) -> Box<dyn Command> {
        Box::new(MkdirCommand {
            base: ExternalCommand::new(name),
        })
    }
}

struct MkdirCommand {
    base: ExternalCommand,
}

impl MkdirCommand {
    fn output_name<'a>(&self, file: &'a BuildFile) -> Option<&'a str> {
        self.base
            .outputs()
            .first()
            .map(|&ix| file.node(ix).name.as_str())
    }
}

impl Command for MkdirCommand {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn short_description(&self) -> String {
        self.base.description().to_string()
    }

    fn verbose_description(&self) -> String {
        // The output name is not resolvable here; the description carries
        // the intent.
        format!("mkdir ({})", self.base.name())
    }

    fn configure_description(&mut self, value: &str) {
        self.base.set_description(value);
    }

    fn configure_inputs(&mut self, ctx: &ConfigureContext<'_>, inputs: Vec<usize>) {
        if let Some(&first) = inputs.first() {
            ctx.error(format!(
                "unexpected explicit input: '{}'",
                ctx.node_name(first)
            ));
        }
    }

    fn configure_outputs(&mut self, ctx: &ConfigureContext<'_>, outputs: Vec<usize>) {
        match outputs.len() {
            0 => ctx.error("missing declared output"),
            1 => {
                if ctx.nodes[outputs[0]].is_virtual {
                    ctx.error("unexpected virtual output");
                } else {
                    self.base.set_outputs(outputs);
                }
            }
            _ => ctx.error(format!(
                "unexpected explicit output: '{}'",
                ctx.node_name(outputs[1])
            )),
        }
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
        hash64_str(self.output_name(file).unwrap_or_default())
    }

    fn is_result_valid(&self, file: &BuildFile, fs: &dyn FileSystem, prior: &BuildValue) -> bool {
        if !prior.is_successful_command() {
            return false;
        }
        // Valid as long as the directory is still there; the recorded
        // file info is intentionally not compared.
        let Some(name) = self.output_name(file) else {
            return false;
        };
        let info = fs.get_file_info(Path::new(name));
        !info.is_missing() && info.is_directory()
    }

    fn get_result_for_output(
        &self,
        file: &BuildFile,
        node: usize,
        value: &BuildValue,
    ) -> BuildValue {
        self.base.default_result_for_output(file, node, value)
    }

    fn execute(&self, cx: &ExecutionContext<'_>, _job: &mut JobContext<'_>) -> bool {
        let Some(name) = self.output_name(cx.file) else {
            return false;
        };
        let path = Path::new(name);
        if let Err(error) = cx.fs.create_directories(path) {
            tracing::debug!("mkdir failed: {error:#}");
            // TODO: unlink a conflicting non-directory output and retry
            // before failing.
            cx.error("", format!("unable to create directory '{name}'"));
            return false;
        }
        cx.fs.get_file_info(path).is_directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingDelegate;
    use tempfile::TempDir;

    #[test]
    fn test_inputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.dirs]
            tool = "mkdir"
            inputs = ["dep"]
            outputs = ["build-dir"]
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert!(delegate
            .errors()
            .iter()
            .any(|e| e.contains("unexpected explicit input: 'dep'")));
    }

    #[test]
    fn test_virtual_output_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.dirs]
            tool = "mkdir"
            outputs = ["<virtual-dir>"]
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert!(delegate
            .errors()
            .iter()
            .any(|e| e.contains("unexpected virtual output")));
    }

    #[test]
    fn test_multiple_outputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.dirs]
            tool = "mkdir"
            outputs = ["a", "b"]
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert!(delegate
            .errors()
            .iter()
            .any(|e| e.contains("unexpected explicit output: 'b'")));
    }
}
