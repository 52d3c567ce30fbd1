//! Scheduler for concurrent plan execution.
//!
//! The Scheduler drives a plan's `TaskGraph` to a terminal state. A single
//! loop owns every state transition; handler invocations and retry timers
//! run as units in a `JoinSet` and report back to the loop. At most
//! `max_concurrent_tasks` handler invocations are in flight; tasks waiting
//! out a backoff delay do not hold a slot.

use crate::core::{Plan, PlanId, Task, TaskFailure, TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::events::{RecoveryAction, TaskEvent};
use crate::orchestration::handler::{
    ErrorKind, HandlerRegistry, TaskContext, TaskError, TaskOutcome,
};
use crate::orchestration::retry::RetryPolicy;
use crate::util;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CANCELLED_REASON: &str = "cancelled";

/// Scheduler settings, loaded as the `[scheduler]` table of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Per-invocation handler deadline. 0 disables it.
    pub task_timeout_seconds: u64,
    /// Default retry budget for tasks without their own.
    pub max_retries: u32,
    pub base_delay_seconds: f64,
    pub multiplier: f64,
    pub max_delay_seconds: Option<f64>,
    /// Capacity of the event channel created by `Scheduler::spawn`.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            task_timeout_seconds: 300,
            max_retries: 3,
            base_delay_seconds: 1.0,
            multiplier: 2.0,
            max_delay_seconds: None,
            event_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    /// Reject settings that would stall or never schedule a plan.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Validation(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        let non_negative = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(Error::Validation(format!(
                    "{} must be a finite, non-negative number (got {})",
                    name, value
                )))
            }
        };
        non_negative("base_delay_seconds", self.base_delay_seconds)?;
        non_negative("multiplier", self.multiplier)?;
        if let Some(cap) = self.max_delay_seconds {
            non_negative("max_delay_seconds", cap)?;
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_seconds > 0).then(|| Duration::from_secs(self.task_timeout_seconds))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let secs = |s: f64| Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO);
        let policy = RetryPolicy::new(
            self.max_retries,
            secs(self.base_delay_seconds),
            self.multiplier,
        );
        match self.max_delay_seconds {
            Some(cap) => policy.with_max_delay(secs(cap)),
            None => policy,
        }
    }
}

/// Final state of a plan run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub plan_id: PlanId,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub cancelled: bool,
    pub duration: Duration,
    /// Every task in its final state, in plan order.
    pub tasks: Vec<Task>,
}

impl ExecutionSummary {
    /// Every task ended Done.
    pub fn is_complete(&self) -> bool {
        self.done == self.tasks.len()
    }

    /// Some tasks ended Done and some did not.
    pub fn is_partial(&self) -> bool {
        self.done > 0 && !self.is_complete()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.task(id).map(|t| t.status)
    }
}

/// A spawned plan run: the event stream plus the join handle.
pub struct Execution {
    pub events: mpsc::Receiver<TaskEvent>,
    pub handle: JoinHandle<Result<ExecutionSummary>>,
}

/// Message from a unit back to the scheduling loop.
enum UnitOutcome {
    Finished {
        task_id: TaskId,
        result: std::result::Result<TaskOutcome, TaskError>,
    },
    RetryDue {
        task_id: TaskId,
    },
}

/// Transitions produced by settling one unit result.
#[derive(Default)]
struct Settled {
    events: Vec<TaskEvent>,
    retry_in: Option<Duration>,
}

pub struct Scheduler {
    plan_id: PlanId,
    graph: Mutex<TaskGraph>,
    handlers: HandlerRegistry,
    config: SchedulerConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Scheduler {
    /// Prepare a plan for execution.
    ///
    /// # Errors
    /// - `MissingHandler` if any task's agent type has no registered handler
    /// - `Validation` if `max_concurrent_tasks` is zero, or a backoff setting
    ///   is negative or not finite
    pub fn new(plan: Plan, handlers: HandlerRegistry, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        if let Some(agent) = handlers.first_missing(plan.tasks.iter().map(|t| t.agent_type)) {
            return Err(Error::MissingHandler(agent));
        }

        let graph = plan.graph()?;
        let retry = config.retry_policy();
        Ok(Self {
            plan_id: plan.id,
            graph: Mutex::new(graph),
            handlers,
            config,
            retry,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn graph(&self) -> MutexGuard<'_, TaskGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status of one task.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.graph().get_task(id).map(|t| t.status)
    }

    /// Copy of every task in its current state.
    pub fn snapshot(&self) -> Vec<Task> {
        self.graph().snapshot()
    }

    /// Stop launching tasks and signal in-flight handlers.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(plan_id = %self.plan_id, "plan cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `execute` on a new tokio task with a fresh event channel.
    pub fn spawn(self: Arc<Self>) -> Execution {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let handle = tokio::spawn(async move { self.execute(tx).await });
        Execution { events: rx, handle }
    }

    /// Drive the plan until every task is terminal, streaming events.
    ///
    /// A scheduler runs at most once; a second call fails with `Validation`.
    pub async fn execute(&self, events: mpsc::Sender<TaskEvent>) -> Result<ExecutionSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation(format!(
                "plan {} has already been executed",
                self.plan_id
            )));
        }

        let started_at = Instant::now();
        tracing::info!(
            plan_id = %self.plan_id,
            tasks = self.graph().task_count(),
            max_concurrent = self.config.max_concurrent_tasks,
            "plan execution started"
        );

        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut in_flight: HashSet<TaskId> = HashSet::new();
        let mut due: VecDeque<TaskId> = VecDeque::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                due.clear();
                let skipped = self.skip_open_tasks(&in_flight, CANCELLED_REASON);
                emit(&events, skipped).await;
            }
            if !cancelled {
                let started = self.launch(&mut units, &mut in_flight, &mut due, &events);
                emit(&events, started).await;
            }
            if units.is_empty() {
                break;
            }

            tokio::select! {
                // Handled at the top of the loop.
                _ = self.cancel.cancelled(), if !cancelled => {}
                joined = units.join_next() => {
                    match joined {
                        Some(Ok(UnitOutcome::Finished { task_id, result })) => {
                            in_flight.remove(&task_id);
                            let settled = self.settle(&task_id, result);
                            if let Some(delay) = settled.retry_in {
                                self.schedule_retry(&mut units, task_id, delay);
                            }
                            emit(&events, settled.events).await;
                        }
                        Some(Ok(UnitOutcome::RetryDue { task_id })) => {
                            if !cancelled {
                                due.push_back(task_id);
                            }
                        }
                        Some(Err(join_err)) => {
                            tracing::error!(plan_id = %self.plan_id, error = %join_err, "scheduler unit aborted");
                        }
                        None => {}
                    }
                }
            }
        }

        // Unreachable for a validated DAG; execute still ends with every task
        // terminal.
        if !self.graph().all_terminal() {
            let leftover = self.skip_open_tasks(&HashSet::new(), "unreachable");
            tracing::warn!(plan_id = %self.plan_id, tasks = leftover.len(), "skipping unreachable tasks");
            emit(&events, leftover).await;
        }

        let summary = self.summary(started_at.elapsed(), cancelled || self.is_cancelled());
        tracing::info!(
            plan_id = %self.plan_id,
            done = summary.done,
            failed = summary.failed,
            blocked = summary.blocked,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            elapsed_ms = summary.duration.as_millis() as u64,
            "plan execution finished"
        );
        Ok(summary)
    }

    /// Promote newly ready tasks and fill free slots, due retries first.
    fn launch(
        &self,
        units: &mut JoinSet<UnitOutcome>,
        in_flight: &mut HashSet<TaskId>,
        due: &mut VecDeque<TaskId>,
        events: &mpsc::Sender<TaskEvent>,
    ) -> Vec<TaskEvent> {
        let mut graph = self.graph();
        for id in graph.promote_ready() {
            tracing::debug!(plan_id = %self.plan_id, task_id = %id, "task ready");
        }

        let mut started = Vec::new();
        while in_flight.len() < self.config.max_concurrent_tasks {
            let next = match due.pop_front() {
                Some(id) => id,
                None => match graph.ids_with_status(TaskStatus::Ready).into_iter().next() {
                    Some(id) => id,
                    None => break,
                },
            };
            let Some(task) = graph.get_task_mut(&next) else {
                continue;
            };
            if !matches!(task.status, TaskStatus::Ready | TaskStatus::Retrying) {
                continue;
            }

            task.start();
            let attempt = task.retry_count + 1;
            tracing::debug!(plan_id = %self.plan_id, task_id = %task.id, attempt, agent = %task.agent_type, "task started");
            started.push(TaskEvent::TaskStarted {
                task_id: task.id.clone(),
                title: task.title.clone(),
            });
            in_flight.insert(task.id.clone());
            self.spawn_invocation(units, task, attempt, events);
        }
        started
    }

    fn spawn_invocation(
        &self,
        units: &mut JoinSet<UnitOutcome>,
        task: &Task,
        attempt: u32,
        events: &mpsc::Sender<TaskEvent>,
    ) {
        let task_id = task.id.clone();
        let agent_type = task.agent_type;
        let description = task.description.clone();
        let handler = self.handlers.get(agent_type);
        let token = self.cancel.child_token();
        let ctx = TaskContext::new(
            self.plan_id,
            task_id.clone(),
            attempt,
            token.clone(),
            events.clone(),
        );
        let deadline = self.config.task_timeout();

        units.spawn(async move {
            let invocation = async {
                let Some(handler) = handler else {
                    return Err(TaskError::Other(format!(
                        "no handler registered for {}",
                        agent_type
                    )));
                };
                let call =
                    AssertUnwindSafe(handler.handle(agent_type, &description, &ctx)).catch_unwind();
                match util::with_deadline(deadline, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
                    Err(elapsed) => Err(TaskError::Timeout(elapsed)),
                }
            };

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Cancelled),
                result = invocation => result,
            };
            UnitOutcome::Finished { task_id, result }
        });
    }

    fn schedule_retry(&self, units: &mut JoinSet<UnitOutcome>, task_id: TaskId, delay: Duration) {
        let token = self.cancel.clone();
        units.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            UnitOutcome::RetryDue { task_id }
        });
    }

    /// Apply one invocation result to the graph.
    fn settle(
        &self,
        task_id: &TaskId,
        result: std::result::Result<TaskOutcome, TaskError>,
    ) -> Settled {
        let mut graph = self.graph();
        let mut settled = Settled::default();
        let plan_id = self.plan_id;

        // A handler reporting `Cancelled` while the plan runs on is an
        // ordinary temporary failure.
        let plan_cancelled = self.cancel.is_cancelled();
        let result = match result {
            Err(_) if plan_cancelled => Err(TaskError::Cancelled),
            other => other,
        };

        match result {
            Ok(TaskOutcome::Completed(value)) => {
                if let Some(task) = graph.get_task_mut(task_id) {
                    task.complete(value.clone());
                }
                tracing::debug!(plan_id = %plan_id, task_id = %task_id, "task done");
                settled.events.push(TaskEvent::TaskDone {
                    task_id: task_id.clone(),
                    result: value,
                });
            }
            Ok(TaskOutcome::Skipped { reason }) => {
                if let Some(task) = graph.get_task_mut(task_id) {
                    task.skip(reason.clone());
                }
                tracing::info!(plan_id = %plan_id, task_id = %task_id, reason = ?reason, "task skipped by handler");
                settled.events.push(TaskEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    reason,
                });
                let (_, blocked) = cascade(&mut graph, task_id, "dependency skipped");
                settled.events.extend(blocked);
            }
            Err(TaskError::Cancelled) if plan_cancelled => {
                if let Some(task) = graph.get_task_mut(task_id) {
                    task.skip(Some(CANCELLED_REASON.to_string()));
                }
                tracing::debug!(plan_id = %plan_id, task_id = %task_id, "in-flight task cancelled");
                settled.events.push(TaskEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    reason: Some(CANCELLED_REASON.to_string()),
                });
                let (_, blocked) = cascade(&mut graph, task_id, "dependency skipped");
                settled.events.extend(blocked);
            }
            Err(err) => self.settle_error(&mut graph, task_id, err, &mut settled),
        }
        settled
    }

    fn settle_error(
        &self,
        graph: &mut TaskGraph,
        task_id: &TaskId,
        err: TaskError,
        settled: &mut Settled,
    ) {
        let plan_id = self.plan_id;
        let kind = err.kind();
        let failure = TaskFailure::new(kind, err.to_string());

        if kind == ErrorKind::Dependency {
            let blocked_by: BTreeSet<TaskId> = graph
                .dependencies(task_id)
                .into_iter()
                .filter(|dep| dep.status != TaskStatus::Done)
                .map(|dep| dep.id.clone())
                .collect();
            if let Some(task) = graph.get_task_mut(task_id) {
                task.block(blocked_by.clone());
                task.error = Some(failure);
            }
            tracing::warn!(plan_id = %plan_id, task_id = %task_id, error = %err, "task blocked by dependency error");
            settled.events.push(TaskEvent::TaskBlocked {
                task_id: task_id.clone(),
                blocked_by: blocked_by.into_iter().collect(),
                reason: Some(err.to_string()),
            });
            let (_, blocked) = cascade(graph, task_id, "dependency blocked");
            settled.events.extend(blocked);
            return;
        }

        let Some(task) = graph.get_task_mut(task_id) else {
            return;
        };

        if task.has_retries_left() {
            let attempt = task.retry(failure);
            let delay = self.retry.get_delay(attempt);
            tracing::warn!(
                plan_id = %plan_id,
                task_id = %task_id,
                kind = %kind,
                error = %err,
                attempt,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                "task failed, retrying"
            );
            settled.events.push(TaskEvent::TaskRetrying {
                task_id: task_id.clone(),
                attempt,
                max_attempts: task.max_retries,
                next_retry_in: delay,
            });
            settled.retry_in = Some(delay);
            return;
        }

        task.fail(failure);
        let retry_count = task.retry_count;
        let max_retries = task.max_retries;
        tracing::error!(
            plan_id = %plan_id,
            task_id = %task_id,
            kind = %kind,
            error = %err,
            retry_count,
            "task failed"
        );

        let reason = format!("dependency {} failed", task_id);
        let (blocked_ids, blocked_events) = cascade(graph, task_id, &reason);
        settled.events.push(TaskEvent::TaskFailed {
            task_id: task_id.clone(),
            error_type: kind,
            error_message: err.to_string(),
            retry_count,
            max_retries,
            available_actions: RecoveryAction::for_failure(!blocked_ids.is_empty()),
            blocked_tasks: blocked_ids,
        });
        settled.events.extend(blocked_events);
    }

    /// Skip every open task that has no invocation in flight.
    fn skip_open_tasks(&self, in_flight: &HashSet<TaskId>, reason: &str) -> Vec<TaskEvent> {
        let mut graph = self.graph();
        let open: Vec<TaskId> = graph
            .tasks()
            .filter(|t| !t.is_terminal() && !in_flight.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        open.into_iter()
            .filter_map(|id| {
                let task = graph.get_task_mut(&id)?;
                task.skip(Some(reason.to_string()));
                tracing::debug!(plan_id = %self.plan_id, task_id = %id, reason, "task skipped");
                Some(TaskEvent::TaskSkipped {
                    task_id: id,
                    reason: Some(reason.to_string()),
                })
            })
            .collect()
    }

    fn summary(&self, duration: Duration, cancelled: bool) -> ExecutionSummary {
        let graph = self.graph();
        ExecutionSummary {
            plan_id: self.plan_id,
            done: graph.count_with_status(TaskStatus::Done),
            failed: graph.count_with_status(TaskStatus::Failed),
            skipped: graph.count_with_status(TaskStatus::Skipped),
            blocked: graph.count_with_status(TaskStatus::Blocked),
            cancelled,
            duration,
            tasks: graph.snapshot(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("plan_id", &self.plan_id)
            .field("config", &self.config)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Block every open transitive dependent of `root`.
///
/// Returns the newly blocked ids and one `TaskBlocked` event per task.
/// `blocked_by` holds every failed, skipped or blocked ancestor.
fn cascade(graph: &mut TaskGraph, root: &TaskId, reason: &str) -> (Vec<TaskId>, Vec<TaskEvent>) {
    let targets: Vec<TaskId> = graph
        .transitive_dependents(root)
        .into_iter()
        .filter(|id| graph.get_task(id).is_some_and(|t| !t.is_terminal()))
        .collect();

    // Mark first so each blocked_by sees every blocked sibling on its path.
    for id in &targets {
        if let Some(task) = graph.get_task_mut(id) {
            task.block(BTreeSet::new());
        }
    }

    let mut events = Vec::with_capacity(targets.len());
    for id in &targets {
        let blocked_by = graph.unsuccessful_ancestors(id);
        if let Some(task) = graph.get_task_mut(id) {
            task.blocked_by = blocked_by.clone();
        }
        tracing::debug!(task_id = %id, root = %root, "task blocked");
        events.push(TaskEvent::TaskBlocked {
            task_id: id.clone(),
            blocked_by: blocked_by.into_iter().collect(),
            reason: Some(reason.to_string()),
        });
    }
    (targets, events)
}

async fn emit(events: &mpsc::Sender<TaskEvent>, batch: Vec<TaskEvent>) {
    for event in batch {
        let _ = events.send(event).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
