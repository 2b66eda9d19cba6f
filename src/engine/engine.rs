//! The build engine core.
//!
//! Evaluation is demand driven: `build(key)` seeds a work list, and the
//! engine alternates between draining engine-thread work items and
//! receiving completions from queue workers. All graph mutation happens on
//! the engine thread; worker completions arrive through a channel and are
//! processed in a serialized section, so no two completions race on the
//! same key.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};

use anyhow::{bail, Result};

use crate::engine::db::{BuildDb, DbResult};
use crate::engine::rule::{
    EngineDelegate, EngineMessage, Key, Rule, Task, TaskInterface, TaskRequests, ValueData,
};
use crate::engine::trace::{TraceEvent, TraceWriter};

/// Something waiting for a rule to complete.
#[derive(Debug, Clone, Copy)]
enum Waiter {
    /// The initial `build()` demand, or a discovered-dependency demand;
    /// nothing to notify.
    Root,
    /// A task waiting on an input. If `consumes` is false this is an
    /// ordering-only edge and no value is delivered.
    Task {
        task: usize,
        input_id: usize,
        consumes: bool,
    },
    /// A rule scanning its recorded dependencies is waiting on one of
    /// them.
    Scan { rule: usize },
}

/// Per-build evaluation state of a rule.
#[derive(Debug)]
enum RuleState {
    /// Not demanded yet this build.
    Incomplete,
    /// A prior result passed validation; its recorded dependencies are
    /// being brought up to date one at a time.
    Scanning { deps: Vec<Key>, next: usize },
    /// The rule's action registered a task that has not completed.
    Running { task: usize },
    /// A value is available for this build.
    Complete,
}

struct RuleInfo {
    key: Key,
    /// Memoized rule, resolved through the delegate on first demand.
    rule: Option<Rule>,
    state: RuleState,
    /// The latest result: restored from the database on attach, replaced
    /// when a task completes.
    result: Option<DbResult>,
    waiters: Vec<Waiter>,
    /// Rules this rule currently waits on, for cycle detection.
    waiting_on: Vec<usize>,
    /// Whether this rule was recomputed with a different value (or a
    /// forced change) during the current build.
    changed: bool,
}

impl RuleInfo {
    fn new(key: Key) -> Self {
        RuleInfo {
            key,
            rule: None,
            state: RuleState::Incomplete,
            result: None,
            waiters: Vec::new(),
            waiting_on: Vec::new(),
            changed: false,
        }
    }
}

struct TaskSlot {
    /// Taken out while a callback runs, so callbacks can reach the engine
    /// through [`TaskInterface`] without aliasing the slot.
    task: Option<Box<dyn Task>>,
    rule: usize,
    wait_count: usize,
    started: bool,
    fired_inputs_available: bool,
    complete: bool,
    /// Requested input keys, in request order; discovered dependencies are
    /// appended at completion.
    deps: Vec<Key>,
    discovered: Vec<Key>,
}

enum WorkItem {
    Demand { rule: usize, waiter: Waiter },
    ScanNext { rule: usize },
    InputsAvailable { task: usize },
}

/// A generic incremental evaluator over a rule-defined graph.
pub struct BuildEngine<D: EngineDelegate> {
    delegate: D,
    rules: Vec<RuleInfo>,
    key_table: HashMap<Key, usize>,
    tasks: Vec<TaskSlot>,
    incomplete_tasks: usize,
    work: VecDeque<WorkItem>,
    sender: Sender<EngineMessage>,
    receiver: Receiver<EngineMessage>,
    db: Option<Box<dyn BuildDb>>,
    iteration: u64,
    built: bool,
    cycle_found: bool,
    trace: Option<TraceWriter>,
}

impl<D: EngineDelegate> BuildEngine<D> {
    pub fn new(delegate: D) -> Self {
        let (sender, receiver) = channel();
        BuildEngine {
            delegate,
            rules: Vec::new(),
            key_table: HashMap::new(),
            tasks: Vec::new(),
            incomplete_tasks: 0,
            work: VecDeque::new(),
            sender,
            receiver,
            db: None,
            iteration: 0,
            built: false,
            cycle_found: false,
            trace: None,
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Attach a persistence backend, restoring its prior results. Must be
    /// called before the first build.
    pub fn attach_db(&mut self, mut db: Box<dyn BuildDb>) -> Result<()> {
        if self.built {
            bail!("cannot attach a build database after a build has run");
        }
        self.iteration = db.current_iteration();
        for (key, result) in db.load_results()? {
            let id = self.intern(key);
            self.rules[id].result = Some(result);
        }
        self.db = Some(db);
        Ok(())
    }

    /// Open an execution trace sink at `path`. Tracing is additive and
    /// never affects build semantics.
    pub fn enable_tracing(&mut self, path: &Path) -> Result<()> {
        self.trace = Some(TraceWriter::create(path)?);
        Ok(())
    }

    /// Compute the value for `key`, reusing persisted results where their
    /// rules validate and no recorded dependency changed. Returns `None`
    /// if the build was aborted by a dependency cycle.
    pub fn build(&mut self, key: &[u8]) -> Option<ValueData> {
        self.begin_build();

        let root = self.intern(key.to_vec());
        self.work.push_back(WorkItem::Demand {
            rule: root,
            waiter: Waiter::Root,
        });
        self.run_loop();

        self.end_build();
        if self.cycle_found {
            return None;
        }
        self.rules[root].result.as_ref().map(|r| r.value.clone())
    }

    fn begin_build(&mut self) {
        self.built = true;
        self.iteration += 1;
        self.cycle_found = false;
        self.tasks.clear();
        self.incomplete_tasks = 0;
        self.work.clear();
        // Drop any messages left over from an aborted build.
        while self.receiver.try_recv().is_ok() {}
        for rule in &mut self.rules {
            rule.state = RuleState::Incomplete;
            rule.changed = false;
            rule.waiters.clear();
            rule.waiting_on.clear();
        }
        let iteration = self.iteration;
        self.emit_trace(|| TraceEvent::BuildStarted { iteration });
        tracing::debug!(iteration, "build started");
    }

    fn end_build(&mut self) {
        if let Some(db) = &mut self.db {
            db.set_current_iteration(self.iteration);
            if let Err(error) = db.flush() {
                tracing::warn!("failed to flush build database: {error:#}");
            }
        }
        if let Some(trace) = &mut self.trace {
            trace.flush();
        }
    }

    fn run_loop(&mut self) {
        loop {
            if self.cycle_found {
                break;
            }
            while let Ok(message) = self.receiver.try_recv() {
                self.handle_message(message);
            }
            if let Some(item) = self.work.pop_front() {
                self.process(item);
                continue;
            }
            if self.incomplete_tasks == 0 {
                break;
            }
            // All remaining work is external; block until a completion
            // arrives. The engine holds a sender, so recv cannot fail.
            match self.receiver.recv() {
                Ok(message) => self.handle_message(message),
                Err(_) => break,
            }
        }
    }

    fn process(&mut self, item: WorkItem) {
        match item {
            WorkItem::Demand { rule, waiter } => self.process_demand(rule, waiter),
            WorkItem::ScanNext { rule } => self.process_scan(rule),
            WorkItem::InputsAvailable { task } => self.process_inputs_available(task),
        }
    }

    fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::TaskComplete {
                task,
                value,
                force_change,
            } => self.finish_task(task, value, force_change),
            EngineMessage::TaskDiscoveredDependency { task, key } => {
                if task < self.tasks.len() && !self.tasks[task].complete {
                    self.tasks[task].discovered.push(key);
                } else {
                    tracing::warn!("discovered dependency reported after task completion");
                }
            }
        }
    }

    fn intern(&mut self, key: Key) -> usize {
        if let Some(&id) = self.key_table.get(&key) {
            return id;
        }
        let id = self.rules.len();
        self.key_table.insert(key.clone(), id);
        self.rules.push(RuleInfo::new(key));
        id
    }

    fn ensure_rule(&mut self, rule_id: usize) {
        if self.rules[rule_id].rule.is_some() {
            return;
        }
        let key = self.rules[rule_id].key.clone();
        let key_str = String::from_utf8_lossy(&key).into_owned();
        self.emit_trace(|| TraceEvent::RuleLookup { key: &key_str });
        let rule = self.delegate.lookup_rule(&key);
        self.rules[rule_id].rule = Some(rule);
    }

    fn process_demand(&mut self, rule_id: usize, waiter: Waiter) {
        match self.rules[rule_id].state {
            RuleState::Complete => self.deliver(rule_id, waiter),
            RuleState::Scanning { .. } | RuleState::Running { .. } => {
                self.add_waiter(rule_id, waiter);
            }
            RuleState::Incomplete => {
                self.ensure_rule(rule_id);
                self.add_waiter(rule_id, waiter);
                if self.cycle_found {
                    return;
                }

                let info = &self.rules[rule_id];
                let prior_valid = match (&info.rule, &info.result) {
                    (Some(rule), Some(result)) => (rule.is_valid)(&result.value),
                    _ => false,
                };

                if prior_valid {
                    let deps = self.rules[rule_id]
                        .result
                        .as_ref()
                        .map(|r| r.dependencies.clone())
                        .unwrap_or_default();
                    self.rules[rule_id].state = RuleState::Scanning { deps, next: 0 };
                    self.work.push_back(WorkItem::ScanNext { rule: rule_id });
                } else {
                    if self.rules[rule_id].result.is_some() {
                        let key_str =
                            String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
                        self.emit_trace(|| TraceEvent::RuleInvalidated {
                            key: &key_str,
                            reason: "prior-result-invalid",
                        });
                    }
                    self.run_task(rule_id);
                }
            }
        }
    }

    fn process_scan(&mut self, rule_id: usize) {
        loop {
            let dep_key = {
                let RuleState::Scanning { deps, next } = &mut self.rules[rule_id].state else {
                    return;
                };
                if *next >= deps.len() {
                    break;
                }
                let key = deps[*next].clone();
                *next += 1;
                key
            };

            let dep_id = self.intern(dep_key);
            match self.rules[dep_id].state {
                RuleState::Complete => {
                    if self.rules[dep_id].changed {
                        self.invalidate_for_input(rule_id, dep_id);
                        return;
                    }
                }
                _ => {
                    // Bring the dependency up to date, then resume.
                    self.work.push_back(WorkItem::Demand {
                        rule: dep_id,
                        waiter: Waiter::Scan { rule: rule_id },
                    });
                    return;
                }
            }
        }

        // Every recorded dependency is current and unchanged; reuse the
        // prior value without running the action.
        self.rules[rule_id].state = RuleState::Complete;
        self.rules[rule_id].changed = false;
        let key_str = String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
        self.emit_trace(|| TraceEvent::RuleReused { key: &key_str });
        tracing::trace!(key = %key_str, "reused prior result");
        self.notify_waiters(rule_id);
    }

    fn invalidate_for_input(&mut self, rule_id: usize, dep_id: usize) {
        let key_str = String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
        let dep_str = String::from_utf8_lossy(&self.rules[dep_id].key).into_owned();
        self.emit_trace(|| TraceEvent::RuleInvalidated {
            key: &key_str,
            reason: "input-changed",
        });
        tracing::trace!(key = %key_str, input = %dep_str, "input changed, re-running");
        self.run_task(rule_id);
    }

    fn run_task(&mut self, rule_id: usize) {
        let task = {
            let Some(rule) = &self.rules[rule_id].rule else {
                return;
            };
            (rule.action)()
        };

        let task_id = self.tasks.len();
        self.tasks.push(TaskSlot {
            task: Some(task),
            rule: rule_id,
            wait_count: 0,
            started: false,
            fired_inputs_available: false,
            complete: false,
            deps: Vec::new(),
            discovered: Vec::new(),
        });
        self.incomplete_tasks += 1;
        self.rules[rule_id].state = RuleState::Running { task: task_id };

        let key_str = String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
        self.emit_trace(|| TraceEvent::TaskStarted { key: &key_str });

        self.invoke(task_id, |task, ti| task.start(ti));
        if !self.tasks[task_id].complete {
            if let Some(prior) = self.rules[rule_id].result.as_ref().map(|r| r.value.clone()) {
                self.invoke(task_id, |task, ti| task.provide_prior_value(ti, &prior));
            }
        }

        let slot = &mut self.tasks[task_id];
        slot.started = true;
        if slot.wait_count == 0 && !slot.complete {
            self.work.push_back(WorkItem::InputsAvailable { task: task_id });
        }
    }

    /// Run a task callback with a fresh request buffer, then apply the
    /// requests it issued.
    fn invoke(&mut self, task_id: usize, f: impl FnOnce(&mut dyn Task, &mut TaskInterface<'_>)) {
        let Some(mut task) = self.tasks[task_id].task.take() else {
            return;
        };
        let mut requests = TaskRequests::default();
        {
            let mut ti = TaskInterface {
                task_id,
                requests: &mut requests,
                sender: &self.sender,
            };
            f(task.as_mut(), &mut ti);
        }
        self.tasks[task_id].task = Some(task);
        self.apply_requests(task_id, requests);
    }

    fn apply_requests(&mut self, task_id: usize, requests: TaskRequests) {
        for (key, input_id) in requests.needs {
            self.tasks[task_id].deps.push(key.clone());
            self.tasks[task_id].wait_count += 1;
            let rule = self.intern(key);
            self.work.push_back(WorkItem::Demand {
                rule,
                waiter: Waiter::Task {
                    task: task_id,
                    input_id,
                    consumes: true,
                },
            });
        }
        for key in requests.must_follow {
            self.tasks[task_id].deps.push(key.clone());
            self.tasks[task_id].wait_count += 1;
            let rule = self.intern(key);
            self.work.push_back(WorkItem::Demand {
                rule,
                waiter: Waiter::Task {
                    task: task_id,
                    input_id: 0,
                    consumes: false,
                },
            });
        }
        for key in requests.discovered {
            self.tasks[task_id].discovered.push(key);
        }
        if let Some((value, force_change)) = requests.complete {
            self.finish_task(task_id, value, force_change);
        }
    }

    fn process_inputs_available(&mut self, task_id: usize) {
        let slot = &mut self.tasks[task_id];
        if slot.complete || slot.fired_inputs_available || slot.wait_count != 0 {
            return;
        }
        slot.fired_inputs_available = true;
        self.invoke(task_id, |task, ti| task.inputs_available(ti));
    }

    fn finish_task(&mut self, task_id: usize, value: ValueData, force_change: bool) {
        if task_id >= self.tasks.len() || self.tasks[task_id].complete {
            return;
        }
        self.tasks[task_id].complete = true;
        self.incomplete_tasks -= 1;
        let rule_id = self.tasks[task_id].rule;

        // Record discovered dependencies and make sure each one gets a
        // result this build, so future scans can validate against it.
        let discovered = std::mem::take(&mut self.tasks[task_id].discovered);
        for key in discovered {
            self.tasks[task_id].deps.push(key.clone());
            let dep = self.intern(key);
            self.work.push_back(WorkItem::Demand {
                rule: dep,
                waiter: Waiter::Root,
            });
        }

        let changed =
            force_change || self.rules[rule_id].result.as_ref().map(|r| &r.value) != Some(&value);

        let result = DbResult {
            value,
            iteration: self.iteration,
            dependencies: self.tasks[task_id].deps.clone(),
        };
        if let Some(db) = &mut self.db {
            if let Err(error) = db.set_result(&self.rules[rule_id].key, result.clone()) {
                tracing::warn!("failed to persist build result: {error:#}");
            }
        }

        let key_str = String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
        self.emit_trace(|| TraceEvent::TaskComplete {
            key: &key_str,
            changed,
        });

        self.rules[rule_id].result = Some(result);
        self.rules[rule_id].changed = changed;
        self.rules[rule_id].state = RuleState::Complete;
        self.notify_waiters(rule_id);
    }

    fn notify_waiters(&mut self, rule_id: usize) {
        let waiters = std::mem::take(&mut self.rules[rule_id].waiters);
        for waiter in waiters {
            self.deliver(rule_id, waiter);
        }
    }

    /// Hand a completed rule's outcome to one waiter.
    fn deliver(&mut self, rule_id: usize, waiter: Waiter) {
        match waiter {
            Waiter::Root => {}
            Waiter::Task {
                task,
                input_id,
                consumes,
            } => {
                if self.tasks[task].complete {
                    return;
                }
                if consumes {
                    let value = match &self.rules[rule_id].result {
                        Some(result) => result.value.clone(),
                        None => Vec::new(),
                    };
                    let input_str = String::from_utf8_lossy(&self.rules[rule_id].key).into_owned();
                    let task_str =
                        String::from_utf8_lossy(&self.rules[self.tasks[task].rule].key).into_owned();
                    self.emit_trace(|| TraceEvent::InputProvided {
                        key: &task_str,
                        input: &input_str,
                    });
                    self.invoke(task, |t, ti| t.provide_value(ti, input_id, &value));
                }
                if self.tasks[task].complete {
                    return;
                }
                self.tasks[task].wait_count -= 1;
                if self.tasks[task].wait_count == 0 && self.tasks[task].started {
                    self.work.push_back(WorkItem::InputsAvailable { task });
                }
            }
            Waiter::Scan { rule } => {
                if !matches!(self.rules[rule].state, RuleState::Scanning { .. }) {
                    return;
                }
                if self.rules[rule_id].changed {
                    self.invalidate_for_input(rule, rule_id);
                } else {
                    self.work.push_back(WorkItem::ScanNext { rule });
                }
            }
        }
    }

    /// Register a waiter and the corresponding waits-for edge, aborting
    /// the build if the edge closes a cycle.
    fn add_waiter(&mut self, rule_id: usize, waiter: Waiter) {
        self.rules[rule_id].waiters.push(waiter);

        let from = match waiter {
            Waiter::Root => return,
            Waiter::Task { task, .. } => self.tasks[task].rule,
            Waiter::Scan { rule } => rule,
        };

        if let Some(path) = self.find_path(rule_id, from) {
            let mut cycle: Vec<Key> = path
                .iter()
                .map(|&id| self.rules[id].key.clone())
                .collect();
            cycle.push(self.rules[rule_id].key.clone());
            self.emit_trace(|| TraceEvent::CycleDetected {
                keys: cycle
                    .iter()
                    .map(|k| {
                        // Keys in the build system are printable.
                        std::str::from_utf8(k).unwrap_or("<binary>")
                    })
                    .collect(),
            });
            self.delegate.cycle_detected(&cycle);
            self.cycle_found = true;
            return;
        }

        self.rules[from].waiting_on.push(rule_id);
    }

    /// Find a waits-for path from `start` to `goal`, ignoring completed
    /// rules.
    fn find_path(&self, start: usize, goal: usize) -> Option<Vec<usize>> {
        if start == goal {
            return Some(vec![start]);
        }
        let mut parents: HashMap<usize, usize> = HashMap::new();
        let mut stack = vec![start];
        parents.insert(start, start);
        while let Some(node) = stack.pop() {
            if matches!(self.rules[node].state, RuleState::Complete) {
                continue;
            }
            for &next in &self.rules[node].waiting_on {
                if parents.contains_key(&next) {
                    continue;
                }
                parents.insert(next, node);
                if next == goal {
                    let mut path = vec![goal];
                    let mut cursor = goal;
                    while cursor != start {
                        cursor = parents[&cursor];
                        path.push(cursor);
                    }
                    path.reverse();
                    return Some(path);
                }
                stack.push(next);
            }
        }
        None
    }

    fn emit_trace<'a>(&mut self, event: impl FnOnce() -> TraceEvent<'a>) {
        if let Some(trace) = &mut self.trace {
            trace.emit(&event());
        }
    }
}
