//! Task handler contract.
//!
//! Handlers implement the work behind an `AgentType`. The scheduler hands
//! them the task's opaque description and a `TaskContext`; every error they
//! return is classified through `TaskError::kind`.

use crate::core::{AgentType, PlanId, TaskId};
use crate::models::{FallbackRequest, ModelError, ModelPoolManager, ModelRole, PoolError};
use crate::orchestration::events::TaskEvent;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crate::core::ErrorKind;

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Work finished, with an optional opaque result.
    Completed(Option<Value>),
    /// Handler decided the task does not apply. Terminal; dependents block.
    Skipped { reason: Option<String> },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    ModelExhausted(String),

    #[error("dependency unavailable: {0}")]
    Dependency(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Failure class that decides retry behaviour.
    ///
    /// `Cancelled` only skips the task when the plan itself was cancelled;
    /// otherwise it is retried like any other temporary failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Timeout(_) | TaskError::Connection(_) | TaskError::Cancelled => {
                ErrorKind::Temporary
            }
            TaskError::Validation(_)
            | TaskError::MissingField(_)
            | TaskError::InvalidOutput(_)
            | TaskError::ModelExhausted(_)
            | TaskError::Panicked(_)
            | TaskError::Other(_) => ErrorKind::Logic,
            TaskError::Dependency(_) => ErrorKind::Dependency,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<PoolError> for TaskError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled => TaskError::Cancelled,
            exhausted @ PoolError::Exhausted { .. } => {
                TaskError::ModelExhausted(exhausted.to_string())
            }
        }
    }
}

impl From<ModelError> for TaskError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Timeout(d) => TaskError::Timeout(d),
            ModelError::Connection(msg) => TaskError::Connection(msg),
            api @ ModelError::Api { .. } => TaskError::Connection(api.to_string()),
            ModelError::Cancelled => TaskError::Cancelled,
            ModelError::Other(msg) => TaskError::Other(msg),
        }
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    plan_id: PlanId,
    task_id: TaskId,
    attempt: u32,
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
}

impl TaskContext {
    pub fn new(
        plan_id: PlanId,
        task_id: TaskId,
        attempt: u32,
        cancel: CancellationToken,
        events: mpsc::Sender<TaskEvent>,
    ) -> Self {
        Self {
            plan_id,
            task_id,
            attempt,
            cancel,
            events,
        }
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// 1-indexed invocation number; 2 is the first retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token cancelled when the plan is cancelled. Long calls should
    /// select on it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a `TaskProgress` event. `progress` is clamped to `0.0..=1.0`.
    pub async fn progress(&self, progress: f32, message: Option<&str>) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let _ = self
            .events
            .send(TaskEvent::TaskProgress {
                task_id: self.task_id.clone(),
                progress,
                message: message.map(str::to_string),
            })
            .await;
    }
}

/// Work behind one or more agent types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        agent_type: AgentType,
        description: &Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError>;
}

/// Typed dispatch table from agent type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<AgentType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one handler for every agent type.
    pub fn uniform(handler: Arc<dyn TaskHandler>) -> Self {
        let mut registry = Self::new();
        for agent in AgentType::ALL {
            registry.register(agent, handler.clone());
        }
        registry
    }

    pub fn register(&mut self, agent_type: AgentType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(agent_type, handler);
    }

    pub fn with(mut self, agent_type: AgentType, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(agent_type, handler);
        self
    }

    pub fn get(&self, agent_type: AgentType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&agent_type).cloned()
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.handlers.contains_key(&agent_type)
    }

    /// First agent type in `required` with no handler.
    pub fn first_missing<I>(&self, required: I) -> Option<AgentType>
    where
        I: IntoIterator<Item = AgentType>,
    {
        required.into_iter().find(|agent| !self.contains(*agent))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<_> = self.handlers.keys().map(AgentType::as_str).collect();
        agents.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("agents", &agents)
            .finish()
    }
}

/// Model role used for an agent's LLM work.
pub fn role_for(agent_type: AgentType) -> ModelRole {
    match agent_type {
        AgentType::ProductDoc | AgentType::Sitemap | AgentType::PageWriter => ModelRole::Writer,
        AgentType::PageExpander => ModelRole::Expander,
        AgentType::Validator => ModelRole::Validator,
        AgentType::StyleRefiner => ModelRole::StyleRefiner,
    }
}

/// Handler that reflects the description back as its result.
///
/// Used by the CLI for dry runs of a plan.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    delay: Duration,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated work time per task.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(
        &self,
        agent_type: AgentType,
        description: &Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        if !self.delay.is_zero() {
            ctx.progress(0.5, Some("working")).await;
            tokio::time::sleep(self.delay).await;
        }
        Ok(TaskOutcome::Completed(Some(json!({
            "agent_type": agent_type,
            "attempt": ctx.attempt(),
            "echo": description,
        }))))
    }
}

/// Handler that sends the description to the model pool for the agent's role.
///
/// Optional description keys steer selection: `product_type`,
/// `preferred_model` and `capabilities` (array of strings).
#[derive(Debug, Clone)]
pub struct PoolHandler {
    pool: Arc<ModelPoolManager>,
}

impl PoolHandler {
    pub fn new(pool: Arc<ModelPoolManager>) -> Self {
        Self { pool }
    }

    fn request_for(agent_type: AgentType, description: &Value) -> FallbackRequest {
        let mut request = FallbackRequest::new(role_for(agent_type));
        if let Some(product_type) = description.get("product_type").and_then(Value::as_str) {
            request = request.product_type(product_type);
        }
        if let Some(model) = description.get("preferred_model").and_then(Value::as_str) {
            request = request.preferred(model);
        }
        if let Some(caps) = description.get("capabilities").and_then(Value::as_array) {
            for cap in caps.iter().filter_map(Value::as_str) {
                request = request.require(cap);
            }
        }
        request
    }
}

#[async_trait]
impl TaskHandler for PoolHandler {
    async fn handle(
        &self,
        agent_type: AgentType,
        description: &Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        let request = Self::request_for(agent_type, description);
        let token = ctx.cancellation_token().clone();

        let outcome = self
            .pool
            .run_with_fallback(
                &request,
                |_model_id, client| {
                    let token = token.clone();
                    async move {
                        tokio::select! {
                            _ = token.cancelled() => Err(ModelError::Cancelled),
                            result = client.invoke(description) => result,
                        }
                    }
                },
                None,
            )
            .await?;

        ctx.progress(1.0, Some(&format!("served by {}", outcome.model_id)))
            .await;
        Ok(TaskOutcome::Completed(Some(json!({
            "model_id": outcome.model_id,
            "response": outcome.response,
        }))))
    }
}
