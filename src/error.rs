use thiserror::Error;

/// Errors detected while building a task group. These are fatal at setup
/// time and are never raised from a running session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("task group `{0}` has no tasks")]
    EmptyGroup(String),
    #[error("task group `{0}` has no task with nonzero weight")]
    NoSchedulableTasks(String),
    #[error("duplicate task name `{task}` in group `{group}`")]
    DuplicateTask { group: String, task: String },
    #[error("task `{task}` in markov group `{group}` declares no transitions")]
    MissingTransitions { group: String, task: String },
    #[error("transition from `{from}` to unknown task `{to}` in group `{group}`")]
    UnknownTransitionTarget {
        group: String,
        from: String,
        to: String,
    },
    #[error("task `{task}` in group `{group}` is unreachable (zero inbound transition weight)")]
    UnreachableTask { group: String, task: String },
}

/// Fatal errors from a running user session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A task body failed while `catch_exceptions` was disabled.
    #[error("task `{task}` failed: {message}")]
    TaskFailed { task: String, message: String },
    /// A task signaled an interrupt while running directly under the root
    /// group; there is no parent scheduling loop to unwind to.
    #[error("task signaled an interrupt outside any nested task group")]
    InterruptOutsideGroup,
}
