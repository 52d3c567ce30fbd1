//! Orchestration layer for plan execution.
//!
//! This module drives a validated plan to completion: the scheduler
//! launches ready tasks through typed handlers, retries failures with
//! backoff, cascades blocked state to dependents, and streams lifecycle
//! events. The registry exposes running plans for external cancellation.

mod events;
mod handler;
mod registry;
mod retry;
mod scheduler;

pub use events::{RecoveryAction, TaskEvent};
pub use handler::{
    role_for, EchoHandler, ErrorKind, HandlerRegistry, PoolHandler, TaskContext, TaskError,
    TaskHandler, TaskOutcome,
};
pub use registry::ExecutorRegistry;
pub use retry::RetryPolicy;
pub use scheduler::{Execution, ExecutionSummary, Scheduler, SchedulerConfig};
