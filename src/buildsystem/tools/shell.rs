//! The shell tool: commands that run a process.
//!
//! The `args` attribute is either a scalar string (run through
//! `/bin/sh -c`) or an explicit argv list; `env` is a map of extra
//! environment variables.

use crate::buildsystem::buildfile::{AttrValue, BuildFile};
use crate::buildsystem::command::{
    Command, ConfigureContext, ExecutionContext, ExternalCommand, Tool,
};
use crate::buildsystem::queue::JobContext;
use crate::buildsystem::value::BuildValue;
use crate::util::fs::FileSystem;
use crate::util::hash::{hash64_str, Signature};

pub struct ShellTool;

impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn create_command(&self, name: &str) -> Box<dyn Command> {
        Box::new(ShellCommand {
            base: ExternalCommand::new(name),
            args: Vec::new(),
            env: Vec::new(),
        })
    }
}

struct ShellCommand {
    base: ExternalCommand,
    args: Vec<String>,
    /// Extra environment; the process otherwise inherits.
    env: Vec<(String, String)>,
}

impl Command for ShellCommand {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn short_description(&self) -> String {
        if self.base.description().is_empty() {
            self.verbose_description()
        } else {
            self.base.description().to_string()
        }
    }

    fn verbose_description(&self) -> String {
        let mut out = String::new();
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                out.push(' ');
            }
            if arg.contains(' ') {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
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
        value: &AttrValue,
    ) -> bool {
        match (name, value) {
            // A scalar command line runs through the shell.
            ("args", AttrValue::Scalar(line)) => {
                self.args = vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    line.clone(),
                ];
                true
            }
            ("args", AttrValue::List(argv)) => {
                if argv.is_empty() {
                    ctx.error(format!("invalid arguments for command '{}'", self.name()));
                    return false;
                }
                self.args = argv.clone();
                true
            }
            ("env", AttrValue::Map(entries)) => {
                self.env = entries.clone();
                true
            }
            _ => {
                ctx.error(format!("unexpected attribute: '{name}'"));
                false
            }
        }
    }

    fn inputs(&self) -> &[usize] {
        self.base.inputs()
    }

    fn outputs(&self) -> &[usize] {
        self.base.outputs()
    }

    fn signature(&self, file: &BuildFile) -> u64 {
        let mut signature = Signature::new().combine(self.base.base_signature(file));
        for arg in &self.args {
            signature = signature.combine(hash64_str(arg));
        }
        // TODO: fold the environment into the signature as well.
        signature.value()
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

    fn execute(&self, _cx: &ExecutionContext<'_>, job: &mut JobContext<'_>) -> bool {
        job.execute_process(&self.args, &self.env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingDelegate;
    use tempfile::TempDir;

    fn configured(manifest: &str) -> (TempDir, crate::buildsystem::buildfile::BuildFile) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(&path, manifest).unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        let file = crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert_eq!(delegate.errors(), Vec::<String>::new());
        (tmp, file)
    }

    #[test]
    fn test_scalar_args_run_through_shell() {
        let (_tmp, file) = configured(
            r#"
            [client]
            name = "basic"

            [commands.c1]
            tool = "shell"
            outputs = ["out"]
            args = "echo hi > out"
            "#,
        );
        let command = file.command_named("c1").unwrap();
        assert_eq!(command.verbose_description(), "/bin/sh -c \"echo hi > out\"");
    }

    #[test]
    fn test_signature_tracks_argv() {
        let (_tmp, file_a) = configured(
            r#"
            [client]
            name = "basic"

            [commands.c1]
            tool = "shell"
            outputs = ["out"]
            args = ["touch", "out"]
            "#,
        );
        let (_tmp2, file_b) = configured(
            r#"
            [client]
            name = "basic"

            [commands.c1]
            tool = "shell"
            outputs = ["out"]
            args = ["touch", "-a", "out"]
            "#,
        );
        let a = file_a.command_named("c1").unwrap();
        let b = file_b.command_named("c1").unwrap();
        assert_ne!(a.signature(&file_a), b.signature(&file_b));
    }

    #[test]
    fn test_empty_args_list_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.c1]
            tool = "shell"
            args = []
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert!(delegate
            .errors()
            .iter()
            .any(|e| e.contains("invalid arguments for command 'c1'")));
    }
}
