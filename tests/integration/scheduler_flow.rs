//! Scheduler integration tests.
//!
//! These tests verify dependency ordering, the concurrency cap, retry
//! backoff and failure cascading over whole plans.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use sitegen::core::{ErrorKind, TaskId, TaskStatus};
use sitegen::orchestration::{RecoveryAction, TaskEvent};

use crate::fixtures::{config, ids, plan, run_to_end, scheduler, started, task, Call, ScriptedHandler};

/// Test: Concurrency cap
/// Given 5 independent tasks and max_concurrent_tasks=2
/// When the plan executes
/// Then the handler never sees more than 2 concurrent entries
#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_respected() {
    let handler = ScriptedHandler::new();
    let tasks = (1..=5)
        .map(|i| task(&format!("page{}", i), &[], json!({"sleep_ms": 100})))
        .collect();
    let scheduler = scheduler(plan(tasks, 0), handler.clone(), config(2));

    let (summary, _) = run_to_end(scheduler).await;

    assert!(summary.is_complete());
    assert_eq!(summary.done, 5);
    assert_eq!(handler.max_concurrency(), 2);
}

/// Test: Fan-out after a shared dependency
/// Given A, then B and C both depending on A
/// When the plan executes with two slots
/// Then A runs alone, B and C overlap, and all end Done
#[tokio::test(start_paused = true)]
async fn test_fan_out_after_root() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("A", &[], json!({"sleep_ms": 50})),
                task("B", &["A"], json!({"sleep_ms": 50})),
                task("C", &["A"], json!({"sleep_ms": 50})),
            ],
            0,
        ),
        handler.clone(),
        config(2),
    );

    let (summary, _) = run_to_end(scheduler).await;

    for id in ["A", "B", "C"] {
        assert_eq!(summary.status(&TaskId::from(id)), Some(TaskStatus::Done));
    }
    let a_exit = handler.position(&Call::Exit(TaskId::from("A"))).unwrap();
    let b_enter = handler.position(&Call::Enter(TaskId::from("B"))).unwrap();
    let c_enter = handler.position(&Call::Enter(TaskId::from("C"))).unwrap();
    assert!(a_exit < b_enter);
    assert!(a_exit < c_enter);
    assert_eq!(handler.max_concurrency(), 2);
}

/// Test: Dependencies gate readiness across a deeper graph
/// Given a diamond plus a tail
/// When the plan executes with generous slots
/// Then no task is entered before all of its dependencies have exited
#[tokio::test(start_paused = true)]
async fn test_never_running_before_dependencies_done() {
    let handler = ScriptedHandler::new();
    let edges: &[(&str, &[&str])] = &[
        ("doc", &[]),
        ("map", &["doc"]),
        ("home", &["map"]),
        ("about", &["map"]),
        ("pricing", &["map"]),
        ("style", &["home", "about", "pricing"]),
        ("check", &["style"]),
    ];
    let tasks = edges
        .iter()
        .enumerate()
        .map(|(i, (id, deps))| task(id, deps, json!({"sleep_ms": 10 * (i as u64 + 1)})))
        .collect();
    let scheduler = scheduler(plan(tasks, 0), handler.clone(), config(4));

    let (summary, events) = run_to_end(scheduler).await;
    assert!(summary.is_complete());

    for (id, deps) in edges {
        let enter = handler.position(&Call::Enter(TaskId::from(*id))).unwrap();
        for dep in *deps {
            let exit = handler.position(&Call::Exit(TaskId::from(*dep))).unwrap();
            assert!(exit < enter, "{} entered before {} finished", id, dep);
        }
    }

    // Each TaskStarted follows the TaskDone of every dependency.
    let started_style = events
        .iter()
        .position(|e| matches!(e, TaskEvent::TaskStarted { task_id, .. } if task_id.as_str() == "style"))
        .unwrap();
    for dep in ["home", "about", "pricing"] {
        let done = events
            .iter()
            .position(|e| matches!(e, TaskEvent::TaskDone { task_id, .. } if task_id.as_str() == dep))
            .unwrap();
        assert!(done < started_style);
    }
    assert!(events.contains(&TaskEvent::TaskStarted {
        task_id: TaskId::from("doc"),
        title: "doc page".to_string(),
    }));
}

/// Test: Failure cascade
/// Given A that always fails, with B and C depending on A
/// When A exhausts its retries
/// Then A is Failed and B, C are Blocked by A without ever starting
#[tokio::test(start_paused = true)]
async fn test_failed_root_blocks_dependents() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("A", &[], json!({"always_fail": true, "error": "logic"})),
                task("B", &["A"], json!({})),
                task("C", &["A"], json!({})),
            ],
            2,
        ),
        handler.clone(),
        config(2),
    );

    let (summary, events) = run_to_end(scheduler).await;

    let a = summary.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 2);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::Logic);
    assert_eq!(handler.attempts("A"), 3);

    let expected: BTreeSet<TaskId> = ids(&["A"]).into_iter().collect();
    for id in ["B", "C"] {
        let t = summary.task(&TaskId::from(id)).unwrap();
        assert_eq!(t.status, TaskStatus::Blocked);
        assert_eq!(t.blocked_by, expected);
        assert!(t.started_at.is_none());
        assert_eq!(started(&events, id), 0);
        assert_eq!(handler.attempts(id), 0);
    }

    // Backoff delays follow the default 1s doubling policy.
    let delays: Vec<(u32, Duration)> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::TaskRetrying {
                attempt,
                next_retry_in,
                max_attempts,
                ..
            } => {
                assert_eq!(*max_attempts, 2);
                Some((*attempt, *next_retry_in))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
    );

    let failed = events
        .iter()
        .find_map(|e| match e {
            TaskEvent::TaskFailed {
                task_id,
                error_type,
                retry_count,
                max_retries,
                available_actions,
                blocked_tasks,
                ..
            } => Some((
                task_id.clone(),
                *error_type,
                *retry_count,
                *max_retries,
                available_actions.clone(),
                blocked_tasks.clone(),
            )),
            _ => None,
        })
        .expect("TaskFailed emitted");
    assert_eq!(failed.0, TaskId::from("A"));
    assert_eq!(failed.1, ErrorKind::Logic);
    assert_eq!((failed.2, failed.3), (2, 2));
    assert!(failed.4.contains(&RecoveryAction::RetrySubtree));
    let mut blocked = failed.5;
    blocked.sort();
    assert_eq!(blocked, ids(&["B", "C"]));

    let blocked_events: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::TaskBlocked { task_id, blocked_by, .. } => {
                Some((task_id.clone(), blocked_by.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(blocked_events.len(), 2);
    assert!(blocked_events.iter().all(|(_, by)| by == &ids(&["A"])));

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.blocked, 2);
    assert!(!summary.is_complete());
}

/// Test: Transient failures recover
/// Given a task failing twice with connection errors
/// When retries remain
/// Then it is re-launched after backoff and ends Done
#[tokio::test(start_paused = true)]
async fn test_temporary_failures_retry_then_succeed() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("flaky", &[], json!({"fail_times": 2, "error": "connection"})),
                task("after", &["flaky"], json!({})),
            ],
            3,
        ),
        handler.clone(),
        config(2),
    );

    let (summary, events) = run_to_end(scheduler).await;

    let flaky = summary.task(&TaskId::from("flaky")).unwrap();
    assert_eq!(flaky.status, TaskStatus::Done);
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(flaky.result.as_ref().unwrap()["attempt"], 3);
    assert_eq!(started(&events, "flaky"), 3);
    assert_eq!(summary.status(&TaskId::from("after")), Some(TaskStatus::Done));

    let retries = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(!events.iter().any(|e| matches!(e, TaskEvent::TaskFailed { .. })));
}

/// Test: Per-task timeout
/// Given a handler slower than task_timeout_seconds
/// When the deadline passes on every attempt
/// Then the failure is classified Temporary and follows the retry path
#[tokio::test(start_paused = true)]
async fn test_timeout_classified_temporary() {
    let handler = ScriptedHandler::new();
    let mut cfg = config(1);
    cfg.task_timeout_seconds = 1;
    let scheduler = scheduler(
        plan(vec![task("slow", &[], json!({"sleep_ms": 10_000}))], 1),
        handler.clone(),
        cfg,
    );

    let (summary, events) = run_to_end(scheduler).await;

    let slow = summary.task(&TaskId::from("slow")).unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    let failure = slow.error.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Temporary);
    assert!(failure.message.contains("timed out"));
    assert_eq!(handler.attempts("slow"), 2);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetrying { .. }))
            .count(),
        1
    );
}

/// Test: Per-task retry override
/// Given a task with max_retries=0 in a plan defaulting to 3
/// When it fails
/// Then it fails immediately without a retry event
#[tokio::test(start_paused = true)]
async fn test_task_retry_override() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![task("once", &[], json!({"always_fail": true})).with_max_retries(0)],
            3,
        ),
        handler.clone(),
        config(1),
    );

    let (summary, events) = run_to_end(scheduler).await;
    assert_eq!(summary.status(&TaskId::from("once")), Some(TaskStatus::Failed));
    assert_eq!(handler.attempts("once"), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, TaskEvent::TaskRetrying { .. })));
}

/// Test: Independent branches survive a failure
/// Given two independent chains where one root fails
/// When the plan executes
/// Then the other chain completes and the summary is partial
#[tokio::test(start_paused = true)]
async fn test_partial_completion() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("bad", &[], json!({"always_fail": true})),
                task("bad-child", &["bad"], json!({})),
                task("good", &[], json!({"sleep_ms": 5})),
                task("good-child", &["good"], json!({})),
            ],
            1,
        ),
        handler,
        config(3),
    );

    let (summary, _) = run_to_end(scheduler).await;
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.blocked, 1);
    assert!(summary.is_partial());
    assert!(!summary.cancelled);
    assert!(summary.tasks.iter().all(|t| t.is_terminal()));
}

/// Test: Cancelled reported by a handler while the plan runs on
/// Given a task whose handler returns Cancelled once, in a live plan
/// When the task settles
/// Then it is retried as a temporary failure and its dependent still runs
#[tokio::test(start_paused = true)]
async fn test_handler_cancelled_error_is_retried() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("A", &[], json!({"fail_times": 1, "error": "cancelled"})),
                task("B", &["A"], json!({})),
            ],
            3,
        ),
        handler.clone(),
        config(2),
    );

    let (summary, events) = run_to_end(scheduler).await;

    assert!(!summary.cancelled);
    let a = summary.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Done);
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::Temporary);
    assert_eq!(summary.status(&TaskId::from("B")), Some(TaskStatus::Done));
    assert_eq!(handler.attempts("A"), 2);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TaskEvent::TaskRetrying { .. }))
            .count(),
        1
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, TaskEvent::TaskSkipped { .. } | TaskEvent::TaskBlocked { .. })));
    assert!(summary.is_complete());
}

/// Test: Empty plan
/// Given a plan with no tasks
/// When it executes
/// Then it finishes at once as complete, emitting no events
#[tokio::test]
async fn test_empty_plan_completes_immediately() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(plan(vec![], 3), handler.clone(), config(2));

    let (summary, events) = run_to_end(scheduler).await;

    assert!(summary.is_complete());
    assert!(!summary.is_partial());
    assert!(!summary.cancelled);
    assert!(summary.tasks.is_empty());
    assert!(events.is_empty());
    assert!(handler.calls().is_empty());
}
