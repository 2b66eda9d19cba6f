//! The clang tool: compiler command lines with discovered dependencies.
//!
//! The `args` attribute is a scalar command line run through the shell.
//! When `deps` names a makefile-format dependency file, it is parsed after
//! a successful run and every listed path becomes a discovered dependency
//! of the command, so header edits re-run it on the next build without
//! any manifest change.

use std::path::Path;

use crate::buildsystem::buildfile::{AttrValue, BuildFile};
use crate::buildsystem::command::{
    Command, ConfigureContext, ExecutionContext, ExternalCommand, Tool,
};
use crate::buildsystem::queue::JobContext;
use crate::buildsystem::value::BuildValue;
use crate::util::fs::FileSystem;
use crate::util::hash::{hash64_str, Signature};
use crate::util::makefile_deps::parse_deps;

pub struct ClangTool;

impl Tool for ClangTool {
    fn name(&self) -> &str {
        "clang"
    }

    fn create_command(&self, name: &str) -> Box<dyn Command> {
        Box::new(ClangCommand {
            base: ExternalCommand::new(name),
            args: String::new(),
            deps_path: String::new(),
        })
    }
}

struct ClangCommand {
    base: ExternalCommand,
    /// The compiler command line, run through the shell.
    args: String,
    /// The dependency output file, if used.
    deps_path: String,
}

impl ClangCommand {
    fn process_discovered_dependencies(&self, cx: &ExecutionContext<'_>) -> bool {
        let Some(contents) = cx.fs.get_file_contents(Path::new(&self.deps_path)) else {
            cx.error(
                &self.deps_path,
                format!("unable to open dependencies file ({})", self.deps_path),
            );
            return false;
        };
        let contents = String::from_utf8_lossy(&contents);

        // The rule target is ignored; every dependency encountered is
        // reported.
        match parse_deps(&contents, |dependency| cx.discovered_dependency(dependency)) {
            Ok(()) => true,
            Err(error) => {
                cx.error(
                    &self.deps_path,
                    format!("error reading dependency file: {error}"),
                );
                false
            }
        }
    }
}

impl Command for ClangCommand {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn short_description(&self) -> String {
        if self.base.description().is_empty() {
            self.args.clone()
        } else {
            self.base.description().to_string()
        }
    }

    fn verbose_description(&self) -> String {
        self.args.clone()
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
            ("args", AttrValue::Scalar(args)) => {
                self.args = args.clone();
                true
            }
            ("deps", AttrValue::Scalar(path)) => {
                self.deps_path = path.clone();
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
        Signature::new()
            .combine(self.base.base_signature(file))
            .combine(hash64_str(&self.args))
            .value()
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

    fn execute(&self, cx: &ExecutionContext<'_>, job: &mut JobContext<'_>) -> bool {
        if !job.execute_shell_command(&self.args) {
            // No point gathering dependencies from a failed run.
            return false;
        }
        if !self.deps_path.is_empty() {
            return self.process_discovered_dependencies(cx);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingDelegate;
    use tempfile::TempDir;

    #[test]
    fn test_configure_and_signature() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.compile]
            tool = "clang"
            inputs = ["main.c"]
            outputs = ["main.o"]
            args = "cc -MMD -MF main.d -c main.c -o main.o"
            deps = "main.d"
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        let file = crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert_eq!(delegate.errors(), Vec::<String>::new());

        let command = file.command_named("compile").unwrap();
        assert!(command.verbose_description().contains("-MF main.d"));
        assert_ne!(command.signature(&file), 0);
    }

    #[test]
    fn test_unexpected_attribute_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            name = "basic"

            [commands.compile]
            tool = "clang"
            args = "true"
            bogus = "x"
            "#,
        )
        .unwrap();
        let delegate = RecordingDelegate::new("basic", 0);
        crate::buildsystem::buildfile::BuildFile::load(&path, &delegate).unwrap();
        assert!(delegate
            .errors()
            .iter()
            .any(|e| e.contains("unexpected attribute: 'bogus'")));
    }
}
