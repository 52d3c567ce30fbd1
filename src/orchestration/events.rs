//! Lifecycle events streamed to the caller while a plan executes.

use crate::core::{ErrorKind, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Follow-up actions a caller may take after a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-submit only the failed task.
    RetryTask,
    /// Re-submit the failed task and everything it blocked.
    RetrySubtree,
    /// Treat the failed task as skipped.
    SkipTask,
    /// Keep the results that did finish.
    AcceptPartial,
}

impl RecoveryAction {
    /// Actions offered for a failure; subtree retry only when it blocked work.
    pub fn for_failure(blocked_any: bool) -> Vec<RecoveryAction> {
        let mut actions = vec![RecoveryAction::RetryTask];
        if blocked_any {
            actions.push(RecoveryAction::RetrySubtree);
        }
        actions.push(RecoveryAction::SkipTask);
        actions.push(RecoveryAction::AcceptPartial);
        actions
    }
}

/// Events emitted by the scheduler.
///
/// Serialised with an `event` tag so each line of a JSON event log is
/// self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: TaskId,
        title: String,
    },
    TaskProgress {
        task_id: TaskId,
        /// Fraction in `0.0..=1.0`.
        progress: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskDone {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    TaskFailed {
        task_id: TaskId,
        error_type: ErrorKind,
        error_message: String,
        retry_count: u32,
        max_retries: u32,
        available_actions: Vec<RecoveryAction>,
        blocked_tasks: Vec<TaskId>,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        #[serde(with = "duration_secs")]
        next_retry_in: Duration,
    },
    TaskSkipped {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TaskBlocked {
        task_id: TaskId,
        blocked_by: Vec<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::TaskStarted { task_id, .. }
            | TaskEvent::TaskProgress { task_id, .. }
            | TaskEvent::TaskDone { task_id, .. }
            | TaskEvent::TaskFailed { task_id, .. }
            | TaskEvent::TaskRetrying { task_id, .. }
            | TaskEvent::TaskSkipped { task_id, .. }
            | TaskEvent::TaskBlocked { task_id, .. } => task_id,
        }
    }

    /// Short event name, matching the serialised tag.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskStarted { .. } => "task_started",
            TaskEvent::TaskProgress { .. } => "task_progress",
            TaskEvent::TaskDone { .. } => "task_done",
            TaskEvent::TaskFailed { .. } => "task_failed",
            TaskEvent::TaskRetrying { .. } => "task_retrying",
            TaskEvent::TaskSkipped { .. } => "task_skipped",
            TaskEvent::TaskBlocked { .. } => "task_blocked",
        }
    }
}

/// Durations on the wire are fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
