pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod models;
pub mod orchestration;
pub mod util;

pub use config::Config;
pub use crate::core::{AgentType, Plan, PlanId, PlanSpec, Task, TaskId, TaskSpec, TaskStatus};
pub use error::{Error, Result};
pub use models::{FallbackRequest, ModelPoolManager, ModelRole};
pub use orchestration::{
    ExecutionSummary, ExecutorRegistry, HandlerRegistry, Scheduler, SchedulerConfig, TaskEvent,
};
