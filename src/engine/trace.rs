//! Execution tracing.
//!
//! When enabled, the engine records one JSON object per line describing
//! rule lookups, task starts, input provisions, reuses, invalidations,
//! completions and cycles. The trace is purely observational; it never
//! affects scheduling or results.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// A single trace record.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TraceEvent<'a> {
    /// A build began at the given iteration.
    BuildStarted { iteration: u64 },
    /// A key was resolved to its rule.
    RuleLookup { key: &'a str },
    /// A prior result failed validation or an input changed.
    RuleInvalidated { key: &'a str, reason: &'a str },
    /// A prior result was reused without running the action.
    RuleReused { key: &'a str },
    /// A rule's action registered a task.
    TaskStarted { key: &'a str },
    /// An input value was delivered to a waiting task.
    InputProvided { key: &'a str, input: &'a str },
    /// A task completed with a value.
    TaskComplete { key: &'a str, changed: bool },
    /// A dependency cycle was found.
    CycleDetected { keys: Vec<&'a str> },
}

/// A line-oriented JSON trace sink.
#[derive(Debug)]
pub struct TraceWriter {
    out: BufWriter<File>,
}

impl TraceWriter {
    /// Open a trace sink at `path`, truncating any existing file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to open trace file: {}", path.display()))?;
        Ok(TraceWriter {
            out: BufWriter::new(file),
        })
    }

    /// Append one event. Write errors are reported but do not fail the
    /// build; tracing is additive.
    pub fn emit(&mut self, event: &TraceEvent<'_>) {
        match serde_json::to_string(event) {
            Ok(line) => {
                if writeln!(self.out, "{line}").is_err() {
                    tracing::warn!("failed to append to trace file");
                }
            }
            Err(error) => tracing::warn!("failed to serialize trace event: {error}"),
        }
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trace_events_are_json_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.trace");

        let mut writer = TraceWriter::create(&path).unwrap();
        writer.emit(&TraceEvent::BuildStarted { iteration: 1 });
        writer.emit(&TraceEvent::RuleLookup { key: "Tall" });
        writer.emit(&TraceEvent::TaskComplete {
            key: "Tall",
            changed: true,
        });
        writer.flush();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"event\":\"build-started\""));
        assert!(lines[1].contains("\"key\":\"Tall\""));
        assert!(lines[2].contains("\"changed\":true"));
    }

    #[test]
    fn test_create_fails_in_missing_directory() {
        let err = TraceWriter::create(Path::new("/no/such/dir/build.trace")).unwrap_err();
        assert!(err.to_string().contains("failed to open trace file"));
    }
}
