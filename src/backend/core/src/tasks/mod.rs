//! Distributed task queue.
//!
//! Hands work to remote agents and tracks it to completion:
//!
//! - **Task**: one unit of work for one host, with its own status lifecycle
//! - **TaskQueue**: enqueue, long-poll dispatch, status updates with retry
//! - **Maintenance**: periodic stale-task reaping and aged-task cleanup

mod maintenance;
mod queue;
mod task;

pub use maintenance::{MaintenanceHandle, MaintenanceReport, STALE_TASK_MESSAGE};
pub use queue::TaskQueue;
pub use task::{
    StatusChange, Task, TaskId, TaskStats, TaskStatus, ACTION_START, ACTION_STOP,
    COLLECTOR_TASK_TYPE,
};
