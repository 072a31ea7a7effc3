//! The per-user task engine: task groups, scheduling modes, wait-time
//! strategies, and the session run loop.

pub mod session;
pub mod task;
pub mod wait;

pub use session::{SessionState, UserConfig, UserSession};
pub use task::{
    SchedulingMode, Task, TaskContext, TaskError, TaskGroup, TaskGroupBuilder, TaskOutcome,
    TaskResult,
};
pub use wait::WaitTime;
