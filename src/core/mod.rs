//! Core domain models for plan execution.
//!
//! This module contains the fundamental data structures used throughout
//! the execution core: tasks, plans, and the dependency graph.

pub mod dag;
pub mod plan;
pub mod task;

pub use dag::TaskGraph;
pub use plan::{Plan, PlanId, PlanSpec};
pub use task::{AgentType, ErrorKind, Task, TaskFailure, TaskId, TaskSpec, TaskStatus};
