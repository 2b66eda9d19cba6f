//! The generic incremental build engine.
//!
//! The engine evaluates a demand-driven graph of rules identified by opaque
//! byte keys. Each rule's action registers a task; tasks request inputs,
//! the engine schedules producers, and completed values are cached in
//! memory and written through to an attached database so later builds can
//! reuse them. The engine knows nothing about nodes, commands or targets;
//! that projection lives in [`crate::buildsystem`].

pub mod db;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod rule;
pub mod trace;

pub use db::{BuildDb, DbResult};
pub use engine::BuildEngine;
pub use rule::{EngineDelegate, Key, Rule, Task, TaskHandle, TaskInterface, ValueData};
