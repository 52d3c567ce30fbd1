//! Plans: a named DAG of tasks for one generation pipeline run.

use crate::core::dag::TaskGraph;
use crate::core::task::{Task, TaskSpec};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Unique identifier for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Plan input as produced by the external plan builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub goal: String,
    pub tasks: Vec<TaskSpec>,
}

impl PlanSpec {
    pub fn new(session_id: &str, goal: &str, tasks: Vec<TaskSpec>) -> Self {
        Self {
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            tasks,
        }
    }

    /// Read a plan spec from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading plan spec");
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// A validated plan. Construction guarantees every dependency resolves
/// inside the plan and that the dependency edges are acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub session_id: String,
    pub goal: String,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Validate a spec and create its Pending tasks.
    ///
    /// Tasks without an explicit retry budget get `default_max_retries`.
    /// A plan with no tasks is valid and completes as soon as it runs.
    pub fn build(spec: PlanSpec, default_max_retries: u32) -> Result<Self> {
        let tasks: Vec<Task> = spec
            .tasks
            .into_iter()
            .map(|t| Task::from_spec(t, default_max_retries))
            .collect();

        // Full structural validation: duplicates, unknown ids, cycles.
        TaskGraph::from_tasks(tasks.iter().cloned())?;

        let plan = Self {
            id: PlanId::new(),
            session_id: spec.session_id,
            goal: spec.goal,
            tasks,
            created_at: Utc::now(),
        };
        tracing::debug!(plan_id = %plan.id, tasks = plan.tasks.len(), "plan built");
        Ok(plan)
    }

    /// Build the execution graph for this plan.
    pub fn graph(&self) -> Result<TaskGraph> {
        TaskGraph::from_tasks(self.tasks.iter().cloned())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
