//! The build-system layer.
//!
//! Projects a declarative build description (a manifest of tools, targets,
//! nodes and commands) onto the engine's key space: every target, node and
//! command gets a typed [`key::BuildKey`], a rule with a validity
//! predicate, and a task that computes its [`value::BuildValue`].

pub mod buildfile;
pub mod command;
pub mod console;
pub mod key;
pub mod queue;
pub mod system;
pub mod tools;
pub mod value;

pub use buildfile::{AttrValue, BuildFile, BuildNode, BuildTarget};
pub use command::{Command, ConfigureContext, ExternalCommand, Tool};
pub use console::ConsoleDelegate;
pub use key::BuildKey;
pub use queue::{ExecutionQueue, JobContext, LocalExecutionQueue, QueueJob};
pub use system::{BuildSystem, ManifestToken, SystemDelegate};
pub use value::BuildValue;
