use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::task::{GroupRun, TaskBody, TaskContext, TaskFn, TaskGroup, TaskOutcome};
use super::wait::{WaitState, WaitTime};
use crate::error::EngineError;
use crate::stats::EventSink;

/// Lifecycle of one session. `Interrupted` is transient and only observable
/// while a nested group unwinds to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Waiting,
    Interrupted,
    Stopped,
}

/// Per-session configuration, supplied by the spawn orchestrator.
#[derive(TypedBuilder)]
pub struct UserConfig {
    /// User-type identifier, as configured on the population controller.
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = WaitTime::constant(Duration::from_secs(1)))]
    pub wait_time: WaitTime,
    /// When true (the default), task failures are recorded and the loop
    /// continues; when false, the first failure stops the session.
    #[builder(default = true)]
    pub catch_exceptions: bool,
    /// Hard end of this session's run loop, checked before each iteration.
    #[builder(default, setter(strip_option))]
    pub stop_deadline: Option<Instant>,
}

/// How a finished group run hands control back to its parent.
enum GroupExit {
    /// A task interrupted with reschedule: the parent continues
    /// immediately, skipping its wait.
    Immediate,
    /// A task interrupted without reschedule: the parent waits, then
    /// resumes its own scheduling loop.
    AfterWait,
    /// The session is stopping.
    Stop,
}

/// What the current group's loop does after one task execution.
enum Flow {
    Wait,
    Immediate,
    Exit(GroupExit),
}

/// One simulated client: drives its root [`TaskGroup`] until stopped.
///
/// Everything in the run loop is cooperative: cancellation (the shared
/// watch channel) and the stop deadline take effect at iteration
/// boundaries and during waits, never mid-task.
pub struct UserSession {
    config: UserConfig,
    group: Arc<TaskGroup>,
    ctx: TaskContext,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    wait_state: WaitState,
}

impl UserSession {
    pub fn new(
        config: UserConfig,
        group: TaskGroup,
        events: EventSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ctx = TaskContext::new(events, Arc::from(config.name.as_str()));
        Self {
            config,
            group: Arc::new(group),
            ctx,
            shutdown,
            state: SessionState::Idle,
            wait_state: WaitState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it stops.
    ///
    /// Returns `Ok(())` on a cooperative stop (signal, deadline, or a task
    /// returning [`TaskOutcome::Stop`]). Returns an error when a task fails
    /// with `catch_exceptions` disabled, or when a task interrupts at the
    /// root group.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        tracing::debug!(user = %self.config.name, "session starting");
        self.state = SessionState::Running;
        let group = Arc::clone(&self.group);
        let result = self.run_group(&group).await;
        self.state = SessionState::Stopped;
        tracing::debug!(user = %self.config.name, "session stopped");
        match result? {
            GroupExit::Stop => Ok(()),
            GroupExit::Immediate | GroupExit::AfterWait => {
                Err(EngineError::InterruptOutsideGroup)
            }
        }
    }

    fn run_group<'a>(
        &'a mut self,
        group: &'a TaskGroup,
    ) -> Pin<Box<dyn Future<Output = Result<GroupExit, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let ctx = self.ctx.with_fresh_queue();
            let mut run = GroupRun::new();

            if let Some(hook) = &group.on_start {
                let name = format!("{}::on_start", group.name);
                match self.invoke(hook, &ctx, &name).await? {
                    Flow::Wait | Flow::Immediate => {}
                    Flow::Exit(exit) => {
                        run_on_stop(group, &ctx).await;
                        return Ok(exit);
                    }
                }
            }

            loop {
                if self.stop_requested() || self.deadline_exceeded() {
                    run_on_stop(group, &ctx).await;
                    return Ok(GroupExit::Stop);
                }
                self.state = SessionState::Running;

                for (name, first) in ctx.drain_scheduled() {
                    match group.index_of(&name) {
                        Some(index) if first => run.queue.push_front(index),
                        Some(index) => run.queue.push_back(index),
                        None => tracing::warn!(
                            group = %group.name,
                            task = %name,
                            "scheduled task not found in group"
                        ),
                    }
                }

                let index = run.next_task(group);
                match self.execute(group, index, &ctx).await? {
                    Flow::Wait => self.wait().await,
                    Flow::Immediate => {}
                    Flow::Exit(exit) => {
                        run_on_stop(group, &ctx).await;
                        return Ok(exit);
                    }
                }
            }
        })
    }

    async fn execute(
        &mut self,
        group: &TaskGroup,
        index: usize,
        ctx: &TaskContext,
    ) -> Result<Flow, EngineError> {
        match &group.tasks[index].body {
            TaskBody::Action(body) => self.invoke(body, ctx, &group.tasks[index].name).await,
            TaskBody::Group(nested) => {
                let nested = Arc::clone(nested);
                match self.run_group(&nested).await? {
                    GroupExit::Immediate => Ok(Flow::Immediate),
                    GroupExit::AfterWait => Ok(Flow::Wait),
                    GroupExit::Stop => Ok(Flow::Exit(GroupExit::Stop)),
                }
            }
        }
    }

    /// Run one task body and apply the failure policy. Interrupt outcomes
    /// pass through untouched; only the `Err` branch counts as a failure.
    async fn invoke(
        &mut self,
        body: &TaskFn,
        ctx: &TaskContext,
        name: &str,
    ) -> Result<Flow, EngineError> {
        let started = Instant::now();
        match body(ctx.clone()).await {
            Ok(TaskOutcome::Continue) => Ok(Flow::Wait),
            Ok(TaskOutcome::InterruptReschedule) => {
                self.state = SessionState::Interrupted;
                Ok(Flow::Exit(GroupExit::Immediate))
            }
            Ok(TaskOutcome::InterruptDefer) => {
                self.state = SessionState::Interrupted;
                Ok(Flow::Exit(GroupExit::AfterWait))
            }
            Ok(TaskOutcome::Stop) => Ok(Flow::Exit(GroupExit::Stop)),
            Err(error) => {
                let message = error.to_string();
                self.ctx
                    .events()
                    .task_failure(name, started.elapsed(), &message);
                if self.config.catch_exceptions {
                    tracing::error!(
                        user = %self.config.name,
                        task = %name,
                        %message,
                        "task failed"
                    );
                    Ok(Flow::Wait)
                } else {
                    Err(EngineError::TaskFailed {
                        task: name.to_owned(),
                        message,
                    })
                }
            }
        }
    }

    async fn wait(&mut self) {
        self.state = SessionState::Waiting;
        let delay = self.config.wait_time.next(&mut self.wait_state);
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
    }

    fn stop_requested(&self) -> bool {
        // A dropped sender counts as a stop request.
        self.shutdown.has_changed().is_err() || *self.shutdown.borrow()
    }

    fn deadline_exceeded(&self) -> bool {
        self.config
            .stop_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

async fn run_on_stop(group: &TaskGroup, ctx: &TaskContext) {
    if let Some(hook) = &group.on_stop {
        if let Err(error) = hook(ctx.clone()).await {
            tracing::warn!(group = %group.name, error = %error, "on_stop hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::user::task::{SchedulingMode, Task};

    fn session(group: TaskGroup, wait: WaitTime) -> (UserSession, watch::Sender<bool>, EventSink) {
        let (tx, rx) = watch::channel(false);
        let events = EventSink::new();
        let config = UserConfig::builder().name("test-user").wait_time(wait).build();
        (
            UserSession::new(config, group, events.clone(), rx),
            tx,
            events,
        )
    }

    fn interrupting_root(outcome: TaskOutcome, hits: Arc<AtomicUsize>) -> TaskGroup {
        let inner = TaskGroup::builder("inner", SchedulingMode::WeightedRandom)
            .task(Task::new("bail", 1, move |_ctx| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(outcome)
                }
            }))
            .build()
            .unwrap();
        TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::group(1, inner))
            .task(Task::new("finish", 1, |_ctx| async {
                Ok(TaskOutcome::Stop)
            }))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_defer_resumes_parent_after_wait_without_failure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let group = interrupting_root(TaskOutcome::InterruptDefer, Arc::clone(&hits));
        let (mut session, _tx, events) =
            session(group, WaitTime::constant(Duration::from_secs(10)));

        let started = Instant::now();
        session.run().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The parent resumed via its normal wait phase.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(events.stats().lock().unwrap().total().num_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_reschedule_skips_parent_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let group = interrupting_root(TaskOutcome::InterruptReschedule, Arc::clone(&hits));
        let (mut session, _tx, _events) =
            session(group, WaitTime::constant(Duration::from_secs(10)));

        let started = Instant::now();
        session.run().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_at_root_group_is_an_error() {
        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::new("bail", 1, |_ctx| async {
                Ok(TaskOutcome::InterruptDefer)
            }))
            .build()
            .unwrap();
        let (mut session, _tx, _events) = session(group, WaitTime::constant(Duration::ZERO));
        assert_eq!(
            session.run().await,
            Err(EngineError::InterruptOutsideGroup)
        );
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_deadline_ends_the_loop_cleanly() {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);
        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::new("tick", 1, move |_ctx| {
                let count = Arc::clone(&task_count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskOutcome::Continue)
                }
            }))
            .build()
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let config = UserConfig::builder()
            .name("deadline-user")
            .wait_time(WaitTime::constant(Duration::from_secs(1)))
            .stop_deadline(Instant::now() + Duration::from_secs_f64(3.5))
            .build();
        let mut session = UserSession::new(config, group, EventSink::new(), rx);

        session.run().await.unwrap();
        drop(tx);

        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn external_stop_signal_is_observed_during_wait() {
        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::new("tick", 1, |_ctx| async {
                Ok(TaskOutcome::Continue)
            }))
            .build()
            .unwrap();
        let (mut session, tx, _events) =
            session(group, WaitTime::constant(Duration::from_secs(600)));

        let handle = tokio::spawn(async move {
            let result = session.run().await;
            (result, session.state())
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        let (result, state) = handle.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(state, SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn caught_task_failures_are_recorded_and_the_loop_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task_calls = Arc::clone(&calls);
        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::new("flaky", 1, move |_ctx| {
                let calls = Arc::clone(&task_calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("boom".into())
                    } else {
                        Ok(TaskOutcome::Stop)
                    }
                }
            }))
            .build()
            .unwrap();
        let (mut session, _tx, events) = session(group, WaitTime::constant(Duration::ZERO));

        session.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = events.stats();
        let stats = stats.lock().unwrap();
        assert_eq!(stats.get("TASK", "flaky").unwrap().num_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_task_failure_stops_the_session() {
        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(Task::new("flaky", 1, |_ctx| async { Err("boom".into()) }))
            .build()
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let events = EventSink::new();
        let config = UserConfig::builder()
            .name("strict-user")
            .wait_time(WaitTime::constant(Duration::ZERO))
            .catch_exceptions(false)
            .build();
        let mut session = UserSession::new(config, group, events.clone(), rx);

        let err = session.run().await.unwrap_err();
        assert_eq!(
            err,
            EngineError::TaskFailed {
                task: "flaky".to_owned(),
                message: "boom".to_owned(),
            }
        );
        assert_eq!(
            events.stats().lock().unwrap().get("TASK", "flaky").unwrap().num_failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_tasks_preempt_mode_selection() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let total = Arc::new(AtomicUsize::new(0));

        let record = |name: &'static str, schedule_on_first: bool| {
            let order = Arc::clone(&order);
            let total = Arc::clone(&total);
            Task::new(name, 1, move |ctx| {
                let order = Arc::clone(&order);
                let total = Arc::clone(&total);
                async move {
                    order.lock().unwrap().push(name);
                    let n = total.fetch_add(1, Ordering::SeqCst) + 1;
                    if schedule_on_first && n == 1 {
                        ctx.schedule_task("c", true);
                    }
                    if n >= 4 {
                        Ok(TaskOutcome::Stop)
                    } else {
                        Ok(TaskOutcome::Continue)
                    }
                }
            })
        };

        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .task(record("a", true))
            .task(record("b", false))
            .task(record("c", false))
            .build()
            .unwrap();
        let (mut session, _tx, _events) = session(group, WaitTime::constant(Duration::ZERO));

        session.run().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn markov_chain_follows_transitions() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let total = Arc::new(AtomicUsize::new(0));

        let step = |name: &'static str| {
            let order = Arc::clone(&order);
            let total = Arc::clone(&total);
            Task::new(name, 1, move |_ctx| {
                let order = Arc::clone(&order);
                let total = Arc::clone(&total);
                async move {
                    order.lock().unwrap().push(name);
                    if total.fetch_add(1, Ordering::SeqCst) + 1 >= 4 {
                        Ok(TaskOutcome::Stop)
                    } else {
                        Ok(TaskOutcome::Continue)
                    }
                }
            })
        };

        let group = TaskGroup::builder("chain", SchedulingMode::Markov)
            .task(step("a").transition("b", 1))
            .task(step("b").transition("a", 1))
            .build()
            .unwrap();
        let (mut session, _tx, _events) = session(group, WaitTime::constant(Duration::ZERO));

        session.run().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_hooks_run_on_start_and_stop() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let hook_started = Arc::clone(&started);
        let hook_stopped = Arc::clone(&stopped);

        let group = TaskGroup::builder("root", SchedulingMode::Sequential)
            .on_start(move |_ctx| {
                let started = Arc::clone(&hook_started);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskOutcome::Continue)
                }
            })
            .on_stop(move |_ctx| {
                let stopped = Arc::clone(&hook_stopped);
                async move {
                    stopped.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskOutcome::Continue)
                }
            })
            .task(Task::new("halt", 1, |_ctx| async { Ok(TaskOutcome::Stop) }))
            .build()
            .unwrap();
        let (mut session, _tx, _events) = session(group, WaitTime::constant(Duration::ZERO));

        session.run().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
