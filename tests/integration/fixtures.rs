//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building plans from compact task lists
//! - A scripted task handler that records concurrency and call order
//! - Scripted model clients and factories

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use sitegen::core::{AgentType, Plan, PlanSpec, TaskId, TaskSpec};
use sitegen::models::{ModelClient, ModelClientFactory, ModelError};
use sitegen::orchestration::{
    ExecutionSummary, HandlerRegistry, Scheduler, SchedulerConfig, TaskContext, TaskError,
    TaskEvent, TaskHandler, TaskOutcome,
};

/// A page-writer task with the given dependencies and scripted behaviour.
pub fn task(id: &str, deps: &[&str], script: Value) -> TaskSpec {
    TaskSpec::new(id, &format!("{} page", id), AgentType::PageWriter)
        .depends_on(deps.iter().copied())
        .with_description(script)
}

pub fn plan(tasks: Vec<TaskSpec>, default_retries: u32) -> Plan {
    Plan::build(PlanSpec::new("session", "test site", tasks), default_retries)
        .expect("valid plan")
}

pub fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        task_timeout_seconds: 30,
        ..Default::default()
    }
}

/// One entry in the handler's call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enter(TaskId),
    Exit(TaskId),
}

/// Handler driven by keys in the task description:
///
/// - `sleep_ms`: simulated work before returning
/// - `fail_times`: fail this many invocations, then succeed
/// - `always_fail`: never succeed
/// - `error`: `"timeout"`, `"connection"`, `"cancelled"`, `"logic"` or
///   `"dependency"`
#[derive(Default)]
pub struct ScriptedHandler {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    attempts: Mutex<HashMap<TaskId, u32>>,
}

impl ScriptedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&TaskId::from(id))
            .copied()
            .unwrap_or(0)
    }

    /// Position of an entry in the call log.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    fn error_for(script: &Value) -> TaskError {
        match script.get("error").and_then(Value::as_str) {
            Some("timeout") => TaskError::Timeout(Duration::from_secs(1)),
            Some("connection") => TaskError::Connection("connection reset".to_string()),
            Some("dependency") => TaskError::Dependency("upstream missing".to_string()),
            Some("cancelled") => TaskError::Cancelled,
            _ => TaskError::Validation("output failed validation".to_string()),
        }
    }
}

/// Decrements the in-flight gauge even when the handler future is dropped.
struct InFlight<'a>(&'a ScriptedHandler, TaskId);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
        self.0.calls.lock().unwrap().push(Call::Exit(self.1.clone()));
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(
        &self,
        _agent_type: AgentType,
        description: &Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        let id = ctx.task_id().clone();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        self.calls.lock().unwrap().push(Call::Enter(id.clone()));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self, id.clone());

        if let Some(ms) = description.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let fail_times = description
            .get("fail_times")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let always_fail = description
            .get("always_fail")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if always_fail || attempt <= fail_times {
            return Err(Self::error_for(description));
        }

        Ok(TaskOutcome::Completed(Some(json!({
            "task": id.as_str(),
            "attempt": ctx.attempt(),
        }))))
    }
}

pub fn scheduler(plan: Plan, handler: Arc<ScriptedHandler>, config: SchedulerConfig) -> Arc<Scheduler> {
    Arc::new(
        Scheduler::new(plan, HandlerRegistry::uniform(handler), config).expect("scheduler"),
    )
}

/// Execute to completion and collect every emitted event.
pub async fn run_to_end(scheduler: Arc<Scheduler>) -> (ExecutionSummary, Vec<TaskEvent>) {
    let mut execution = scheduler.spawn();
    let mut events = Vec::new();
    while let Some(event) = execution.events.recv().await {
        events.push(event);
    }
    let summary = execution
        .handle
        .await
        .expect("scheduler task joined")
        .expect("execution succeeded");
    (summary, events)
}

pub fn started(events: &[TaskEvent], id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TaskEvent::TaskStarted { task_id, .. } if task_id.as_str() == id))
        .count()
}

pub fn ids(list: &[&str]) -> Vec<TaskId> {
    list.iter().map(|s| TaskId::from(*s)).collect()
}

/// What a scripted model does on every invocation.
#[derive(Debug, Clone)]
pub enum Script {
    Respond(Value),
    Fail(ModelError),
    Hang,
}

pub struct ScriptedClient {
    model_id: String,
    script: Script,
    calls: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

/// Sets a flag when an in-flight model call is dropped before finishing.
struct DropFlag(Arc<AtomicBool>, bool);

impl Drop for DropFlag {
    fn drop(&mut self) {
        if !self.1 {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, _request: &Value) -> Result<Value, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut flag = DropFlag(self.dropped.clone(), false);
        let result = match &self.script {
            Script::Respond(value) => Ok(value.clone()),
            Script::Fail(err) => Err(err.clone()),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ModelError::Timeout(Duration::from_secs(3600)))
            }
        };
        flag.1 = true;
        result
    }
}

/// Factory returning scripted clients; unknown models respond with content.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<String, Script>,
    calls: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    pub dropped: Arc<AtomicBool>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, model_id: &str, script: Script) -> Self {
        self.scripts.insert(model_id.to_string(), script);
        self
    }

    pub fn calls(&self, model_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(model_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl ModelClientFactory for ScriptedFactory {
    fn create(&self, model_id: &str) -> Result<Arc<dyn ModelClient>, ModelError> {
        let script = self
            .scripts
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| Script::Respond(json!({"content": format!("from {}", model_id)})));
        let calls = self
            .calls
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .clone();
        Ok(Arc::new(ScriptedClient {
            model_id: model_id.to_string(),
            script,
            calls,
            dropped: self.dropped.clone(),
        }))
    }
}

/// Drain whatever events are already buffered.
pub fn drain(rx: &mut mpsc::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
