use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::error::ConfigError;
use crate::stats::EventSink;

/// What a task body tells the engine to do next.
///
/// These are control-flow signals, not errors: they are never recorded as
/// failures and pass through the failure policy untouched. Failures travel
/// in the `Err` branch of [`TaskResult`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Normal completion; the session proceeds to its wait phase.
    Continue,
    /// Unwind one group level; the parent treats the interrupted child as a
    /// completed iteration and continues immediately, skipping its wait.
    InterruptReschedule,
    /// Unwind one group level; the parent waits, then resumes its own
    /// scheduling loop.
    InterruptDefer,
    /// Stop the whole session cooperatively.
    Stop,
}

/// A failure raised by a task body.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

pub type TaskResult = Result<TaskOutcome, TaskError>;

pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// A task body bound to the running session's context.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Handle passed into every task invocation.
///
/// Carries the shared [`EventSink`] (through which the external request
/// client reports measurements) and lets the body schedule explicit task
/// invocations on the group that is currently running it.
#[derive(Clone)]
pub struct TaskContext {
    events: EventSink,
    user: Arc<str>,
    scheduled: Arc<Mutex<Vec<(String, bool)>>>,
}

impl TaskContext {
    pub(crate) fn new(events: EventSink, user: Arc<str>) -> Self {
        Self {
            events,
            user,
            scheduled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The sink request clients report into.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Name of the user type this session simulates.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Queue an explicit invocation of `name` on the currently running
    /// group. With `first`, the invocation jumps ahead of everything already
    /// queued. Queued invocations always run before the group's scheduling
    /// mode picks another task.
    pub fn schedule_task(&self, name: impl Into<String>, first: bool) {
        self.scheduled
            .lock()
            .expect("schedule queue lock poisoned")
            .push((name.into(), first));
    }

    /// Clone with a fresh schedule queue, for handing to a nested group.
    pub(crate) fn with_fresh_queue(&self) -> Self {
        Self {
            events: self.events.clone(),
            user: Arc::clone(&self.user),
            scheduled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn drain_scheduled(&self) -> Vec<(String, bool)> {
        std::mem::take(&mut *self.scheduled.lock().expect("schedule queue lock poisoned"))
    }
}

pub(crate) enum TaskBody {
    Action(TaskFn),
    Group(Arc<TaskGroup>),
}

/// A unit of simulated work with a selection weight, registered on a
/// [`TaskGroupBuilder`].
pub struct Task {
    pub(crate) name: String,
    pub(crate) weight: usize,
    pub(crate) body: TaskBody,
    /// Declared Markov transitions: `(target task name, weight)`.
    pub(crate) transitions: Vec<(String, usize)>,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, weight: usize, body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            body: TaskBody::Action(Arc::new(move |ctx| Box::pin(body(ctx)))),
            transitions: Vec::new(),
        }
    }

    /// A task whose body is a nested group: when selected, control transfers
    /// to the group's own run loop until it interrupts back out.
    pub fn group(weight: usize, group: TaskGroup) -> Self {
        Self {
            name: group.name.clone(),
            weight,
            body: TaskBody::Group(Arc::new(group)),
            transitions: Vec::new(),
        }
    }

    /// Declare a weighted Markov transition from this task to `target`.
    /// Only meaningful in a group built with [`SchedulingMode::Markov`].
    pub fn transition(mut self, target: impl Into<String>, weight: usize) -> Self {
        self.transitions.push((target.into(), weight));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How a group picks the next task when its pending queue is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Pick uniformly from the weight-expanded task list (the default).
    WeightedRandom,
    /// Advance through the weight-expanded list in declaration order,
    /// wrapping at the end.
    Sequential,
    /// Pick from the just-executed task's declared transition table.
    /// The chain starts at the first registered task.
    Markov,
}

/// A named collection of tasks (and/or nested groups) with a scheduling
/// mode. Built and validated once via [`TaskGroup::builder`]; all Markov
/// configuration errors surface here, never at run time.
pub struct TaskGroup {
    pub(crate) name: String,
    pub(crate) mode: SchedulingMode,
    pub(crate) tasks: Vec<Task>,
    /// Task indices repeated by weight; selection source for the
    /// weighted-random and sequential modes.
    pub(crate) expanded: Vec<usize>,
    /// Per-task weight-expanded transition targets (Markov mode only).
    pub(crate) transitions: Vec<Vec<usize>>,
    pub(crate) on_start: Option<TaskFn>,
    pub(crate) on_stop: Option<TaskFn>,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field(
                "tasks",
                &self.tasks.iter().map(|t| &t.name).collect::<Vec<_>>(),
            )
            .field("expanded", &self.expanded)
            .field("transitions", &self.transitions)
            .field("on_start", &self.on_start.as_ref().map(|_| "..."))
            .field("on_stop", &self.on_stop.as_ref().map(|_| "..."))
            .finish()
    }
}

impl TaskGroup {
    pub fn builder(name: impl Into<String>, mode: SchedulingMode) -> TaskGroupBuilder {
        TaskGroupBuilder {
            name: name.into(),
            mode,
            tasks: Vec::new(),
            on_start: None,
            on_stop: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.name == name)
    }
}

pub struct TaskGroupBuilder {
    name: String,
    mode: SchedulingMode,
    tasks: Vec<Task>,
    on_start: Option<TaskFn>,
    on_stop: Option<TaskFn>,
}

impl TaskGroupBuilder {
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Hook run when a session starts executing this group.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.on_start = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Hook run when the group unwinds, via interrupt or session stop.
    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.on_stop = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn build(self) -> Result<TaskGroup, ConfigError> {
        let Self {
            name,
            mode,
            tasks,
            on_start,
            on_stop,
        } = self;

        if tasks.is_empty() {
            return Err(ConfigError::EmptyGroup(name));
        }
        for (i, task) in tasks.iter().enumerate() {
            if tasks[..i].iter().any(|other| other.name == task.name) {
                return Err(ConfigError::DuplicateTask {
                    group: name,
                    task: task.name.clone(),
                });
            }
        }

        let expanded: Vec<usize> = tasks
            .iter()
            .enumerate()
            .flat_map(|(i, task)| std::iter::repeat(i).take(task.weight))
            .collect();

        let transitions = match mode {
            SchedulingMode::Markov => validate_markov(&name, &tasks)?,
            _ => {
                if expanded.is_empty() {
                    return Err(ConfigError::NoSchedulableTasks(name));
                }
                vec![Vec::new(); tasks.len()]
            }
        };

        Ok(TaskGroup {
            name,
            mode,
            tasks,
            expanded,
            transitions,
            on_start,
            on_stop,
        })
    }
}

/// Resolve and validate a Markov transition table: every target must exist,
/// every task must declare an effective (nonzero-weight) transition, and
/// every task must have inbound weight from some other task.
fn validate_markov(group: &str, tasks: &[Task]) -> Result<Vec<Vec<usize>>, ConfigError> {
    let mut resolved: Vec<Vec<usize>> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut targets = Vec::new();
        for (target, weight) in &task.transitions {
            let Some(index) = tasks.iter().position(|other| other.name == *target) else {
                return Err(ConfigError::UnknownTransitionTarget {
                    group: group.to_owned(),
                    from: task.name.clone(),
                    to: target.clone(),
                });
            };
            targets.extend(std::iter::repeat(index).take(*weight));
        }
        if targets.is_empty() {
            return Err(ConfigError::MissingTransitions {
                group: group.to_owned(),
                task: task.name.clone(),
            });
        }
        resolved.push(targets);
    }

    for (i, task) in tasks.iter().enumerate() {
        let inbound = resolved
            .iter()
            .enumerate()
            .any(|(src, targets)| src != i && targets.contains(&i));
        if !inbound {
            return Err(ConfigError::UnreachableTask {
                group: group.to_owned(),
                task: task.name.clone(),
            });
        }
    }

    // The chain starts at the first task; everything must be reachable from
    // there through effective transitions.
    let mut visited = vec![false; tasks.len()];
    let mut stack = vec![0usize];
    while let Some(index) = stack.pop() {
        if std::mem::replace(&mut visited[index], true) {
            continue;
        }
        for target in &resolved[index] {
            if !visited[*target] {
                stack.push(*target);
            }
        }
    }
    if let Some(index) = visited.iter().position(|seen| !seen) {
        return Err(ConfigError::UnreachableTask {
            group: group.to_owned(),
            task: tasks[index].name.clone(),
        });
    }

    Ok(resolved)
}

/// Per-run scheduling state of one group instance.
pub(crate) struct GroupRun {
    pub(crate) queue: VecDeque<usize>,
    seq_index: usize,
    markov_current: usize,
}

impl GroupRun {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            seq_index: 0,
            markov_current: 0,
        }
    }

    /// Pop the earliest queued invocation, or fall back to the group's
    /// scheduling mode.
    pub(crate) fn next_task(&mut self, group: &TaskGroup) -> usize {
        use rand::seq::SliceRandom;

        if let Some(index) = self.queue.pop_front() {
            return index;
        }
        match group.mode {
            SchedulingMode::WeightedRandom => *group
                .expanded
                .choose(&mut rand::thread_rng())
                .expect("validated at build time"),
            SchedulingMode::Sequential => {
                let index = group.expanded[self.seq_index % group.expanded.len()];
                self.seq_index += 1;
                index
            }
            SchedulingMode::Markov => {
                let index = self.markov_current;
                self.markov_current = *group.transitions[index]
                    .choose(&mut rand::thread_rng())
                    .expect("validated at build time");
                index
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, weight: usize) -> Task {
        Task::new(name, weight, |_ctx| async { Ok(TaskOutcome::Continue) })
    }

    #[test]
    fn empty_group_is_rejected() {
        let err = TaskGroup::builder("empty", SchedulingMode::WeightedRandom)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyGroup("empty".to_owned()));
    }

    #[test]
    fn all_zero_task_weights_are_rejected() {
        let err = TaskGroup::builder("idle", SchedulingMode::WeightedRandom)
            .task(noop("a", 0))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NoSchedulableTasks("idle".to_owned()));
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let err = TaskGroup::builder("dup", SchedulingMode::Sequential)
            .task(noop("a", 1))
            .task(noop("a", 1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTask { .. }));
    }

    #[test]
    fn markov_transition_to_unknown_task_is_rejected() {
        let err = TaskGroup::builder("chain", SchedulingMode::Markov)
            .task(noop("a", 1).transition("ghost", 1))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownTransitionTarget {
                group: "chain".to_owned(),
                from: "a".to_owned(),
                to: "ghost".to_owned(),
            }
        );
    }

    #[test]
    fn markov_task_without_transitions_is_rejected() {
        let err = TaskGroup::builder("chain", SchedulingMode::Markov)
            .task(noop("a", 1).transition("b", 1))
            .task(noop("b", 1))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingTransitions {
                group: "chain".to_owned(),
                task: "b".to_owned(),
            }
        );
    }

    #[test]
    fn markov_task_with_zero_inbound_weight_is_rejected() {
        // `a` points only at itself; `b` has no inbound edge from another task.
        let err = TaskGroup::builder("chain", SchedulingMode::Markov)
            .task(noop("a", 1).transition("a", 1))
            .task(noop("b", 1).transition("a", 1))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnreachableTask {
                group: "chain".to_owned(),
                task: "b".to_owned(),
            }
        );
    }

    #[test]
    fn valid_markov_chain_builds() {
        let group = TaskGroup::builder("chain", SchedulingMode::Markov)
            .task(noop("a", 1).transition("b", 3).transition("a", 1))
            .task(noop("b", 1).transition("a", 1))
            .build()
            .unwrap();
        assert_eq!(group.transitions[0], vec![1, 1, 1, 0]);
        assert_eq!(group.transitions[1], vec![0]);
    }

    #[test]
    fn sequential_selection_wraps() {
        let group = TaskGroup::builder("seq", SchedulingMode::Sequential)
            .task(noop("a", 2))
            .task(noop("b", 1))
            .build()
            .unwrap();
        let mut run = GroupRun::new();
        let picks: Vec<usize> = (0..7).map(|_| run.next_task(&group)).collect();
        assert_eq!(picks, vec![0, 0, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn queued_tasks_run_before_mode_selection() {
        let group = TaskGroup::builder("seq", SchedulingMode::Sequential)
            .task(noop("a", 1))
            .task(noop("b", 1))
            .build()
            .unwrap();
        let mut run = GroupRun::new();
        run.queue.push_back(1);
        run.queue.push_front(1);
        assert_eq!(run.next_task(&group), 1);
        assert_eq!(run.next_task(&group), 1);
        assert_eq!(run.next_task(&group), 0);
    }

    #[test]
    fn zero_weight_task_is_never_selected() {
        let group = TaskGroup::builder("mix", SchedulingMode::WeightedRandom)
            .task(noop("never", 0))
            .task(noop("always", 1))
            .build()
            .unwrap();
        let mut run = GroupRun::new();
        for _ in 0..50 {
            assert_eq!(run.next_task(&group), 1);
        }
    }
}
