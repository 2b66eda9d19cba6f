//! The engine vocabulary: keys, values, rules and tasks.

use std::fmt;
use std::sync::mpsc::Sender;

/// An opaque identifier for a rule. The engine never interprets key bytes;
/// the layer above assigns them structure.
pub type Key = Vec<u8>;

/// The serialized outcome of a task, also opaque to the engine.
pub type ValueData = Vec<u8>;

/// A rule binds a key to the action that computes it and the predicate
/// deciding whether a previously persisted value is still usable.
pub struct Rule {
    pub key: Key,
    /// Construct the task that computes this rule's value. Called at most
    /// once per build.
    pub action: Box<dyn Fn() -> Box<dyn Task>>,
    /// Whether `prior` may be reused without running the action. Input
    /// changes are checked separately by the engine.
    pub is_valid: Box<dyn Fn(&ValueData) -> bool>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish_non_exhaustive()
    }
}

/// An in-flight activity registered by a rule's action.
///
/// Callbacks run on the engine thread. A task requests inputs during
/// `start` (or later callbacks), receives each input's value through
/// `provide_value` in resolution order, gets `inputs_available` once every
/// outstanding request is satisfied, and must eventually complete through
/// the [`TaskInterface`] or a [`TaskHandle`].
pub trait Task {
    fn start(&mut self, ti: &mut TaskInterface<'_>);

    /// The value this rule produced in an earlier build, if any.
    fn provide_prior_value(&mut self, _ti: &mut TaskInterface<'_>, _value: &ValueData) {}

    fn provide_value(&mut self, ti: &mut TaskInterface<'_>, input_id: usize, value: &ValueData);

    fn inputs_available(&mut self, ti: &mut TaskInterface<'_>);
}

/// Messages funnelled back into the engine, either from task callbacks on
/// the engine thread or from jobs running on queue workers.
#[derive(Debug)]
pub(crate) enum EngineMessage {
    TaskComplete {
        task: usize,
        value: ValueData,
        force_change: bool,
    },
    TaskDiscoveredDependency {
        task: usize,
        key: Key,
    },
}

/// Buffered requests issued by a task callback; the engine drains them
/// after the callback returns, which keeps all graph mutation on the
/// engine thread without reentrancy.
#[derive(Default)]
pub(crate) struct TaskRequests {
    pub needs: Vec<(Key, usize)>,
    pub must_follow: Vec<Key>,
    pub discovered: Vec<Key>,
    pub complete: Option<(ValueData, bool)>,
}

/// The engine surface available to a task callback.
pub struct TaskInterface<'a> {
    pub(crate) task_id: usize,
    pub(crate) requests: &'a mut TaskRequests,
    pub(crate) sender: &'a Sender<EngineMessage>,
}

impl TaskInterface<'_> {
    /// Request the value of `key` as an input. The value arrives through
    /// `provide_value` tagged with `input_id`.
    pub fn needs_input(&mut self, key: Key, input_id: usize) {
        self.requests.needs.push((key, input_id));
    }

    /// Require that `key` completes before this task's `inputs_available`,
    /// without consuming its value.
    pub fn must_follow(&mut self, key: Key) {
        self.requests.must_follow.push(key);
    }

    /// Declare a dependency observed during execution. It does not block
    /// this task; it is recorded for future validity checks and evaluated
    /// before the build finishes.
    pub fn discovered_dependency(&mut self, key: Key) {
        self.requests.discovered.push(key);
    }

    /// Complete the task with `value`.
    pub fn complete(&mut self, value: ValueData) {
        self.requests.complete = Some((value, false));
    }

    /// Complete the task with `value`, forcing dependents to treat the
    /// input as changed even if the bytes match the prior value.
    pub fn complete_forced(&mut self, value: ValueData) {
        self.requests.complete = Some((value, true));
    }

    /// A handle that can complete this task from a queue worker.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id,
            sender: self.sender.clone(),
        }
    }
}

/// A `Send` handle through which external jobs report back to the engine.
///
/// All calls are serialized through the engine's completion channel, so
/// they are safe from any worker thread.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: usize,
    sender: Sender<EngineMessage>,
}

impl TaskHandle {
    /// Declare a dependency observed during execution. Must be sent before
    /// `complete`.
    pub fn discovered_dependency(&self, key: Key) {
        let _ = self.sender.send(EngineMessage::TaskDiscoveredDependency {
            task: self.task_id,
            key,
        });
    }

    /// Complete the task with `value`.
    pub fn complete(&self, value: ValueData, force_change: bool) {
        let _ = self.sender.send(EngineMessage::TaskComplete {
            task: self.task_id,
            value,
            force_change,
        });
    }
}

/// The client surface the engine is parameterized over.
pub trait EngineDelegate {
    /// Resolve a key to its rule. Called at most once per key per build;
    /// the result is memoized. The delegate must always return a rule,
    /// using a synthetic error rule for keys it cannot resolve.
    fn lookup_rule(&mut self, key: &[u8]) -> Rule;

    /// A dependency cycle was found. `cycle` lists the keys on the cycle
    /// path, starting and ending at the first repeated rule.
    fn cycle_detected(&mut self, cycle: &[Key]);
}
