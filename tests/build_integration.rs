//! End-to-end build scenarios driven through the library API.
//!
//! Each scenario uses a fresh `BuildSystem` per build (sharing the on-disk
//! database) so incremental behavior is exercised the way real invocations
//! see it.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use slipway::buildsystem::command::{Command, Tool};
use slipway::buildsystem::queue::{ExecutionQueue, LocalExecutionQueue};
use slipway::buildsystem::system::{BuildSystem, ManifestToken, SystemDelegate};
use slipway::engine::db::FileBuildDb;
use slipway::util::fs::{FileSystem, LocalFileSystem};
use slipway::{BuildKey, BuildValue};

/// Records errors, failures and command activity for assertions.
struct TestDelegate {
    fs: LocalFileSystem,
    errors: Mutex<Vec<String>>,
    failures: AtomicUsize,
    started: Mutex<Vec<String>>,
    cancelled: Arc<AtomicBool>,
}

impl TestDelegate {
    fn new() -> Arc<Self> {
        Arc::new(TestDelegate {
            fs: LocalFileSystem,
            errors: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl SystemDelegate for TestDelegate {
    fn name(&self) -> &str {
        "basic"
    }

    fn version(&self) -> u32 {
        0
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
        // Mirror console behavior: phony commands are excluded from
        // status output.
        if command.should_show_status() {
            self.started.lock().unwrap().push(command.name().to_string());
        }
    }

    fn lookup_tool(&self, _name: &str) -> Option<Box<dyn Tool>> {
        None
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        let cancelled = Arc::clone(&self.cancelled);
        Box::new(LocalExecutionQueue::new(
            2,
            Arc::new(move || cancelled.load(Ordering::SeqCst)),
        ))
    }
}

struct Project {
    tmp: TempDir,
    manifest: PathBuf,
    db: PathBuf,
}

impl Project {
    fn new(manifest_contents: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let manifest = tmp.path().join("build.toml");
        std::fs::write(&manifest, manifest_contents).unwrap();
        let db = tmp.path().join("build.db");
        Project { tmp, manifest, db }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    fn rewrite_manifest(&self, contents: &str) {
        std::fs::write(&self.manifest, contents).unwrap();
    }

    /// Run one build with a fresh build system over the shared database.
    fn build(&self, target: &str) -> (bool, Arc<TestDelegate>) {
        let delegate = TestDelegate::new();
        let mut system = BuildSystem::new(delegate.clone(), &self.manifest);
        system.attach_db(&self.db).unwrap();
        let ok = system.build(target);
        (ok, delegate)
    }

    /// Look up a persisted value in the database.
    fn db_value(&self, key: &BuildKey) -> Option<BuildValue> {
        let db = FileBuildDb::open(&self.db, 1).unwrap();
        let result = db.get_result(&key.to_data())?;
        Some(BuildValue::from_data(&result.value).unwrap())
    }
}

// ============================================================================
// Scenario: fresh build of one shell command, then a null rebuild
// ============================================================================

#[test]
fn test_fresh_build_and_null_rebuild() {
    let project = Project::new("");
    let out = project.path("out");
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{out}"]

        [commands.c1]
        tool = "shell"
        outputs = ["{out}"]
        args = ["/bin/sh", "-c", "echo hi > {out}"]
        "#,
        out = out.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.errors(), Vec::<String>::new());
    assert_eq!(delegate.started(), vec!["c1"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hi\n");

    // The database has entries for the target, the node and the command.
    assert!(matches!(
        project.db_value(&BuildKey::target("all")),
        Some(BuildValue::Target)
    ));
    assert!(matches!(
        project.db_value(&BuildKey::node(out.display().to_string())),
        Some(BuildValue::ExistingInput(_))
    ));
    match project.db_value(&BuildKey::command("c1")) {
        Some(BuildValue::SuccessfulCommand { outputs, signature }) => {
            assert_eq!(outputs.len(), 1);
            assert!(!outputs[0].is_missing());
            assert_ne!(signature, 0);
        }
        other => panic!("unexpected command value: {other:?}"),
    }

    // Nothing changed: the command must not run again.
    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), Vec::<String>::new());
    assert_eq!(delegate.failure_count(), 0);
}

// ============================================================================
// Scenario: input mutation re-executes the consuming command
// ============================================================================

#[test]
fn test_input_mutation_rebuilds() {
    let project = Project::new("");
    let input = project.path("in");
    let out = project.path("out");
    std::fs::write(&input, "first\n").unwrap();
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{out}"]

        [commands.c1]
        tool = "shell"
        inputs = ["{input}"]
        outputs = ["{out}"]
        args = "cat {input} > {out}"
        "#,
        input = input.display(),
        out = out.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["c1"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\n");

    // Unchanged input: no re-execution.
    let (_, delegate) = project.build("all");
    assert_eq!(delegate.started(), Vec::<String>::new());

    // Mutate the input; the command re-runs and the output is regenerated.
    std::fs::write(&input, "second, longer\n").unwrap();
    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["c1"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "second, longer\n");
}

// ============================================================================
// Scenario: missing input skips the command and fails the target
// ============================================================================

#[test]
fn test_missing_input_skips_and_reports() {
    let project = Project::new("");
    let input = project.path("in");
    let out = project.path("out");
    std::fs::write(&input, "data\n").unwrap();
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{out}"]

        [commands.c1]
        tool = "shell"
        inputs = ["{input}"]
        outputs = ["{out}"]
        args = "cat {input} > {out}"
        "#,
        input = input.display(),
        out = out.display()
    ));

    let (ok, _) = project.build("all");
    assert!(ok);

    // Remove the input and rebuild.
    std::fs::remove_file(&input).unwrap();
    let (ok, delegate) = project.build("all");
    assert!(ok, "missing inputs are reported, not a build abort");

    let errors = delegate.errors();
    assert!(
        errors
            .iter()
            .any(|e| e.contains(&format!("missing input '{}'", input.display()))),
        "expected an error naming the missing input, got {errors:?}"
    );
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot build target 'all' due to missing input")));
    assert!(delegate.failure_count() > 0);
    // The command was skipped, not executed.
    assert_eq!(delegate.started(), Vec::<String>::new());
    assert!(matches!(
        project.db_value(&BuildKey::command("c1")),
        Some(BuildValue::SkippedCommand)
    ));
}

// ============================================================================
// Scenario: dependency cycles abort the build with a full path report
// ============================================================================

#[test]
fn test_cycle_detection_reports_path() {
    let project = Project::new("");
    let a = project.path("a");
    let b = project.path("b");
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{a}"]

        [commands.c1]
        tool = "shell"
        inputs = ["{b}"]
        outputs = ["{a}"]
        args = "touch {a}"

        [commands.c2]
        tool = "shell"
        inputs = ["{a}"]
        outputs = ["{b}"]
        args = "touch {b}"
        "#,
        a = a.display(),
        b = b.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(!ok, "a cycle must fail the build");

    let errors = delegate.errors();
    let cycle = errors
        .iter()
        .find(|e| e.starts_with("cycle detected while building: "))
        .unwrap_or_else(|| panic!("no cycle error in {errors:?}"));
    let expected = format!(
        "node '{a}' -> command 'c1' -> node '{b}' -> command 'c2' -> node '{a}'",
        a = a.display(),
        b = b.display()
    );
    assert!(
        cycle.contains(&expected),
        "unexpected cycle path: {cycle}"
    );
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.starts_with("cycle detected"))
            .count(),
        1
    );
}

// ============================================================================
// Scenario: clang discovered dependencies re-run the compile on header
// edits with no manifest change
// ============================================================================

#[test]
fn test_clang_discovered_dependency() {
    let project = Project::new("");
    let object = project.path("main.o");
    let deps = project.path("main.d");
    let header = project.path("header.h");
    std::fs::write(&header, "#define X 1\n").unwrap();
    std::fs::write(
        &deps,
        format!("{}: {}\n", object.display(), header.display()),
    )
    .unwrap();
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{object}"]

        [commands.compile]
        tool = "clang"
        outputs = ["{object}"]
        args = "touch {object}"
        deps = "{deps}"
        "#,
        object = object.display(),
        deps = deps.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.errors(), Vec::<String>::new());
    assert_eq!(delegate.started(), vec!["compile"]);

    // The discovered dependency was recorded and evaluated.
    assert!(matches!(
        project.db_value(&BuildKey::node(header.display().to_string())),
        Some(BuildValue::ExistingInput(_))
    ));

    // No change: cached.
    let (_, delegate) = project.build("all");
    assert_eq!(delegate.started(), Vec::<String>::new());

    // Edit the header; the compile re-runs without any manifest change.
    std::fs::write(&header, "#define X 2 /* bigger */\n").unwrap();
    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["compile"]);
}

// ============================================================================
// Scenario: mkdir validity tracks the directory itself
// ============================================================================

#[test]
fn test_mkdir_validity() {
    let project = Project::new("");
    let dir = project.path("build-dir");
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{dir}"]

        [commands.dirs]
        tool = "mkdir"
        outputs = ["{dir}"]
        description = "MKDIR {dir}"
        "#,
        dir = dir.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["dirs"]);
    assert!(dir.is_dir());

    // Unchanged: no re-execution.
    let (_, delegate) = project.build("all");
    assert_eq!(delegate.started(), Vec::<String>::new());

    // Delete the directory externally: mkdir re-runs and recreates it.
    std::fs::remove_dir(&dir).unwrap();
    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["dirs"]);
    assert!(dir.is_dir());

    // Replace the directory with a regular file: mkdir re-runs.
    std::fs::remove_dir(&dir).unwrap();
    std::fs::write(&dir, "not a directory").unwrap();
    let (_, delegate) = project.build("all");
    assert_eq!(delegate.started(), vec!["dirs"]);
    assert!(delegate
        .errors()
        .iter()
        .any(|e| e.contains("unable to create directory")));
    assert!(delegate.failure_count() > 0);
}

// ============================================================================
// A command removed from the manifest forces dependents to rebuild
// ============================================================================

#[test]
fn test_removed_command_forces_rebuild() {
    let project = Project::new("");
    let out = project.path("out");
    let manifest_with = |name: &str, text: &str| {
        format!(
            r#"
            [client]
            name = "basic"

            [targets]
            all = ["{out}"]

            [commands.{name}]
            tool = "shell"
            outputs = ["{out}"]
            args = "echo {text} > {out}"
            "#,
            out = out.display()
        )
    };
    project.rewrite_manifest(&manifest_with("c1", "one"));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["c1"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "one\n");

    // The output node's recorded producer is gone; the synthesized
    // missing-command result forces the node to rebuild through the new
    // producer.
    project.rewrite_manifest(&manifest_with("c2", "two"));
    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.started(), vec!["c2"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "two\n");
}

// ============================================================================
// Multi-producer nodes are diagnosed and poison the target
// ============================================================================

#[test]
fn test_multi_producer_node_is_error() {
    let project = Project::new("");
    let out = project.path("out");
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["{out}"]

        [commands.c1]
        tool = "shell"
        outputs = ["{out}"]
        args = "touch {out}"

        [commands.c2]
        tool = "shell"
        outputs = ["{out}"]
        args = "touch {out}"
        "#,
        out = out.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    let errors = delegate.errors();
    assert!(
        errors.iter().any(|e| e.contains("produced by multiple commands")
            && e.contains("'c1'")
            && e.contains("'c2'")),
        "expected a multi-producer diagnostic, got {errors:?}"
    );
    assert!(delegate.failure_count() > 0);
    // Neither producer ran.
    assert_eq!(delegate.started(), Vec::<String>::new());
}

// ============================================================================
// Phony commands group inputs without observable effects
// ============================================================================

#[test]
fn test_phony_aggregation() {
    let project = Project::new("");
    let out = project.path("out");
    project.rewrite_manifest(&format!(
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["<everything>"]

        [commands.c1]
        tool = "shell"
        outputs = ["{out}"]
        args = "echo done > {out}"

        [commands.group]
        tool = "phony"
        inputs = ["{out}"]
        outputs = ["<everything>"]
        "#,
        out = out.display()
    ));

    let (ok, delegate) = project.build("all");
    assert!(ok);
    assert_eq!(delegate.errors(), Vec::<String>::new());
    // Phony commands are excluded from status output.
    assert_eq!(delegate.started(), vec!["c1"]);
    assert!(out.exists());

    let (_, delegate) = project.build("all");
    assert_eq!(delegate.started(), Vec::<String>::new());
}
