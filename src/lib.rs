//! Stampede — weighted-user load generation with mergeable statistics and a
//! master/worker transport.
//!
//! Stampede simulates load as a population of concurrent *users*, each
//! running a weighted mix of tasks against a target service, rather than as
//! a flat request rate. The pieces are small and composable:
//!
//! - [`TaskGroup`] / [`UserSession`]: one simulated client. A session owns a
//!   (possibly nested) task group and drives it (pick a task, execute it,
//!   wait, repeat) until stopped. Groups schedule weighted-random,
//!   sequential, or via a Markov transition table, and nested groups can
//!   interrupt back to their parent.
//! - [`PopulationController`]: decides, for a target total and a set of
//!   weighted user types, exactly which sessions to spawn or stop so the
//!   live mix stays proportional through ramp-ups, ramp-downs, and crashes.
//! - [`RequestStats`] / [`EventSink`]: the measurement registry. Request
//!   clients report successes and failures through the sink; entries keep
//!   counters, min/max, a bounded response-time sample log for percentiles,
//!   and per-second buckets for trailing-window rates. Registries merge, so
//!   worker-local stats combine into a global view.
//! - [`transport`]: a length-prefixed TCP layer with two patterns: one-shot
//!   commands with a single reply, and a broadcast event channel that
//!   collects one reply per connected worker (used to pull stats snapshots).
//!
//! The crate does not ship a protocol client: task bodies drive whatever
//! client they like and report through [`EventSink`]. Orchestration (when to
//! ramp, how many users) is likewise left to the embedding binary; the
//! controller only turns targets into concrete spawn/stop deltas.
//!
//! # Example
//!
//! One user type with two weighted tasks, stopped externally after 30s:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use stampede::{
//!     EventSink, SchedulingMode, Task, TaskGroup, TaskOutcome, UserConfig, UserSession, WaitTime,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let group = TaskGroup::builder("browse", SchedulingMode::WeightedRandom)
//!         .task(Task::new("index", 3, |ctx| async move {
//!             // A real task drives an HTTP client here and reports the
//!             // outcome through the sink.
//!             ctx.events().success("GET", "/", Duration::from_millis(12), 512);
//!             Ok(TaskOutcome::Continue)
//!         }))
//!         .task(Task::new("checkout", 1, |ctx| async move {
//!             ctx.events()
//!                 .success("GET", "/checkout", Duration::from_millis(40), 2048);
//!             Ok(TaskOutcome::Continue)
//!         }))
//!         .build()?;
//!
//!     let (stop, stop_rx) = watch::channel(false);
//!     let events = EventSink::new();
//!     let config = UserConfig::builder()
//!         .name("shopper")
//!         .wait_time(WaitTime::between(Duration::from_secs(1), Duration::from_secs(3)))
//!         .build();
//!     let mut session = UserSession::new(config, group, events.clone(), stop_rx);
//!
//!     tokio::spawn(async move {
//!         tokio::time::sleep(Duration::from_secs(30)).await;
//!         let _ = stop.send(true);
//!     });
//!     session.run().await?;
//!
//!     let stats = events.stats();
//!     let stats = stats.lock().unwrap();
//!     println!("requests: {}", stats.total().num_requests);
//!     Ok(())
//! }
//! ```
//!
//! # Distributed runs
//!
//! A master binds a [`CommandServer`] for control traffic and an
//! [`EventDispatcher`] (conventionally on the next port) for the event
//! channel. Workers attach an [`EventListener`] whose handler answers each
//! "collect" event with a serialized [`StatsSnapshot`]; the master merges
//! the replies with [`RequestStats::merge_snapshot`]. Payloads are opaque
//! bytes; any serialization both ends agree on works.

/// Setup-time configuration errors and fatal session errors.
pub mod error;
/// Spawn/stop planning that keeps the user mix proportional to weights.
pub mod population;
/// The measurement registry and the sink request clients report into.
pub mod stats;
/// Framed command and event channels between master and workers.
pub mod transport;
/// Task groups, scheduling modes, wait strategies, and the session loop.
pub mod user;

pub use error::{ConfigError, EngineError};
pub use population::{PopulationController, PopulationEntry, PopulationError, RebalancePlan};
pub use stats::{EventSink, RequestStats, StatsEntry, StatsKey, StatsSnapshot};
pub use transport::{
    CommandHandler, CommandServer, Envelope, EnvelopeKind, EventDispatcher,
    EventDispatcherConfig, EventHandler, EventListener, EventListenerConfig, TransportError,
    send_command,
};
pub use user::{
    SchedulingMode, SessionState, Task, TaskContext, TaskError, TaskGroup, TaskOutcome,
    TaskResult, UserConfig, UserSession, WaitTime,
};
