//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to agent handlers. Each task
//! carries an opaque payload, its dependency set, and the state the
//! scheduler mutates as the task moves through its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Unique identifier for a task within a plan.
///
/// Ids are supplied by the plan builder and only need to be unique
/// inside a single plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of agent that handles a task.
///
/// This is a closed set: an unrecognised tag fails when the plan is parsed,
/// long before any task is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Drafts the product document from the conversation.
    ProductDoc,
    /// Plans the sitemap from the product document.
    Sitemap,
    /// Writes the first version of a page.
    PageWriter,
    /// Expands a written page with additional sections.
    PageExpander,
    /// Validates generated output.
    Validator,
    /// Refines page styling.
    StyleRefiner,
}

impl AgentType {
    pub const ALL: [AgentType; 6] = [
        AgentType::ProductDoc,
        AgentType::Sitemap,
        AgentType::PageWriter,
        AgentType::PageExpander,
        AgentType::Validator,
        AgentType::StyleRefiner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ProductDoc => "product_doc",
            AgentType::Sitemap => "sitemap",
            AgentType::PageWriter => "page_writer",
            AgentType::PageExpander => "page_expander",
            AgentType::Validator => "validator",
            AgentType::StyleRefiner => "style_refiner",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `Pending → Ready → Running → {Done | Retrying → Running | Failed | Blocked | Skipped}`.
/// Done, Failed, Skipped and Blocked are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Every dependency is Done; waiting for a free slot.
    Ready,
    /// Handler invocation in flight.
    Running,
    /// Completed successfully.
    Done,
    /// Terminal failure after the retry budget was spent.
    Failed,
    /// Waiting out a backoff delay before the next attempt.
    Retrying,
    /// Ended without running to completion (handler skip or cancellation).
    Skipped,
    /// Cannot run because an upstream task did not finish.
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Blocked
        )
    }

    /// Terminal states that leave dependents unable to run.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Blocked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy applied to every handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout or connection failure; retried with backoff.
    Temporary,
    /// Bad output or failed validation; retried, then terminal.
    Logic,
    /// An upstream task did not finish; never retried.
    Dependency,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Temporary => write!(f, "temporary"),
            ErrorKind::Logic => write!(f, "logic"),
            ErrorKind::Dependency => write!(f, "dependency"),
        }
    }
}

/// Classified error recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A task as supplied by the plan builder, before any state is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    /// Opaque payload forwarded verbatim to the handler.
    #[serde(default)]
    pub description: Value,
    pub agent_type: AgentType,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Advisory only. Dependency edges decide ordering.
    #[serde(default)]
    pub can_parallel: bool,
    /// Overrides the scheduler's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, title: &str, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: Value::Null,
            agent_type,
            depends_on: Vec::new(),
            can_parallel: false,
            max_retries: None,
        }
    }

    pub fn with_description(mut self, description: Value) -> Self {
        self.description = description;
        self
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn parallel(mut self, can_parallel: bool) -> Self {
        self.can_parallel = can_parallel;
        self
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Value,
    pub agent_type: AgentType,
    pub depends_on: BTreeSet<TaskId>,
    pub can_parallel: bool,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Handler output once Done.
    pub result: Option<Value>,
    /// Last classified error.
    pub error: Option<TaskFailure>,
    /// Failed, skipped or blocked ancestors once Blocked.
    pub blocked_by: BTreeSet<TaskId>,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a Pending task from its spec.
    pub fn from_spec(spec: TaskSpec, default_max_retries: u32) -> Self {
        Self {
            id: spec.id,
            title: spec.title,
            description: spec.description,
            agent_type: spec.agent_type,
            depends_on: spec.depends_on.into_iter().collect(),
            can_parallel: spec.can_parallel,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            result: None,
            error: None,
            blocked_by: BTreeSet::new(),
            skip_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Transition to Running. The first start time is kept across retries.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, result: Option<Value>) {
        self.status = TaskStatus::Done;
        self.result = result;
        self.completed_at = Some(Utc::now());
    }

    /// Record a retryable failure and move to Retrying.
    ///
    /// Returns the new retry count.
    pub fn retry(&mut self, failure: TaskFailure) -> u32 {
        self.retry_count += 1;
        self.error = Some(failure);
        self.status = TaskStatus::Retrying;
        self.retry_count
    }

    pub fn fail(&mut self, failure: TaskFailure) {
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
    }

    pub fn block(&mut self, blocked_by: BTreeSet<TaskId>) {
        self.status = TaskStatus::Blocked;
        self.blocked_by = blocked_by;
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = TaskStatus::Skipped;
        self.skip_reason = reason;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt fits in the retry budget.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
