use thiserror::Error;

use crate::core::{PlanId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {missing}")]
    UnknownDependency { task: TaskId, missing: TaskId },

    #[error("Dependency cycle detected at task {0}")]
    CycleDetected(TaskId),

    #[error("No handler registered for agent type {0}")]
    MissingHandler(crate::core::AgentType),

    #[error("Plan already registered: {0}")]
    PlanAlreadyRegistered(PlanId),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
