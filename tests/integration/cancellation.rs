//! Cancellation integration tests.
//!
//! Plans are cancelled through the executor registry, the way an outside
//! caller that only knows the plan id would do it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use sitegen::core::{PlanId, TaskId, TaskStatus};
use sitegen::models::{ModelPoolConfig, ModelPoolManager, ModelRole};
use sitegen::orchestration::{ExecutorRegistry, HandlerRegistry, PoolHandler, Scheduler, TaskEvent};

use crate::fixtures::{config, drain, plan, run_to_end, scheduler, started, task, Script, ScriptedFactory, ScriptedHandler};

fn is_started(event: &TaskEvent, id: &str) -> bool {
    matches!(event, TaskEvent::TaskStarted { task_id, .. } if task_id.as_str() == id)
}

/// Test: Cancel a running plan by id
/// Given A done and a long-running B with C waiting on B
/// When the plan is cancelled through the registry while B runs
/// Then A stays Done and B, C end Skipped with reason "cancelled"
#[tokio::test]
async fn test_cancel_running_plan_through_registry() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![
                task("A", &[], json!({})),
                task("B", &["A"], json!({"sleep_ms": 60_000})),
                task("C", &["B"], json!({})),
            ],
            0,
        ),
        handler.clone(),
        config(2),
    );
    let plan_id = scheduler.plan_id();
    let registry = Arc::new(ExecutorRegistry::new());
    let (tx, mut rx) = mpsc::channel(64);

    let run = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run(scheduler, tx).await })
    };

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let b_started = is_started(&event, "B");
        events.push(event);
        if b_started {
            assert!(registry.lookup(&plan_id).is_some());
            assert!(registry.cancel(&plan_id));
        }
    }

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled plan finishes promptly")
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.status(&TaskId::from("A")), Some(TaskStatus::Done));
    for id in ["B", "C"] {
        let t = summary.task(&TaskId::from(id)).unwrap();
        assert_eq!(t.status, TaskStatus::Skipped);
        assert_eq!(t.skip_reason.as_deref(), Some("cancelled"));
    }
    assert_eq!(started(&events, "C"), 0);
    assert_eq!(handler.attempts("C"), 0);
    assert!(events.contains(&TaskEvent::TaskSkipped {
        task_id: TaskId::from("B"),
        reason: Some("cancelled".to_string()),
    }));
    assert!(registry.is_empty());
    assert!(!registry.cancel(&plan_id));
}

/// Test: Cancellation reaches an in-flight model call
/// Given a pool-backed task whose model never answers
/// When the plan is cancelled
/// Then the pending call is dropped and no failure is charged to the model
#[tokio::test]
async fn test_cancel_drops_in_flight_model_call() {
    let factory = Arc::new(ScriptedFactory::new().script("slow-model", Script::Hang));
    let pool = Arc::new(ModelPoolManager::new(
        ModelPoolConfig {
            default_model: String::new(),
            ..Default::default()
        }
        .with_pool(ModelRole::Writer, "default", &["slow-model"]),
        factory.clone(),
    ));
    let scheduler = Arc::new(
        Scheduler::new(
            plan(vec![task("home", &[], json!({}))], 3),
            HandlerRegistry::uniform(Arc::new(PoolHandler::new(pool.clone()))),
            config(1),
        )
        .unwrap(),
    );

    let mut execution = scheduler.clone().spawn();
    while factory.calls("slow-model") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    scheduler.cancel();

    let mut events = Vec::new();
    while let Some(event) = execution.events.recv().await {
        events.push(event);
    }
    let summary = execution.handle.await.unwrap().unwrap();

    assert!(factory.dropped.load(Ordering::SeqCst));
    assert_eq!(pool.failure_count("slow-model"), 0);
    assert_eq!(summary.status(&TaskId::from("home")), Some(TaskStatus::Skipped));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TaskEvent::TaskRetrying { .. } | TaskEvent::TaskFailed { .. })));
}

/// Test: Cancel before start
/// Given a scheduler cancelled before execute is called
/// When it executes
/// Then nothing is launched and every task is skipped
#[tokio::test]
async fn test_cancel_before_start_launches_nothing() {
    let handler = ScriptedHandler::new();
    let scheduler = scheduler(
        plan(
            vec![task("A", &[], json!({})), task("B", &["A"], json!({}))],
            0,
        ),
        handler.clone(),
        config(2),
    );
    scheduler.cancel();

    let (summary, events) = run_to_end(scheduler).await;

    assert!(summary.cancelled);
    assert_eq!(summary.skipped, 2);
    assert!(handler.calls().is_empty());
    assert!(!events.iter().any(|e| matches!(e, TaskEvent::TaskStarted { .. })));
}

/// Test: Cancellation interrupts a pending retry
/// Given a task waiting out a long backoff
/// When the plan is cancelled
/// Then the task is skipped without another attempt
#[tokio::test]
async fn test_cancel_during_backoff() {
    let handler = ScriptedHandler::new();
    let mut cfg = config(1);
    cfg.base_delay_seconds = 3600.0;
    let scheduler = scheduler(
        plan(vec![task("flaky", &[], json!({"always_fail": true, "error": "connection"}))], 3),
        handler.clone(),
        cfg,
    );

    let mut execution = scheduler.clone().spawn();
    loop {
        let event = execution.events.recv().await.expect("retry scheduled");
        if matches!(event, TaskEvent::TaskRetrying { .. }) {
            break;
        }
    }
    scheduler.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), execution.handle)
        .await
        .expect("cancel interrupts backoff")
        .unwrap()
        .unwrap();
    let rest = drain(&mut execution.events);

    assert_eq!(handler.attempts("flaky"), 1);
    assert_eq!(summary.status(&TaskId::from("flaky")), Some(TaskStatus::Skipped));
    assert!(rest.iter().any(|e| matches!(
        e,
        TaskEvent::TaskSkipped { reason: Some(r), .. } if r == "cancelled"
    )));
}

/// Test: Registry bookkeeping
/// Given an empty registry
/// When an unknown plan is cancelled
/// Then the call reports false and changes nothing
#[test]
fn test_cancel_unknown_plan() {
    let registry = ExecutorRegistry::new();
    assert!(!registry.cancel(&PlanId::new()));
    assert_eq!(registry.cancel_all(), 0);
    assert!(registry.active_plans().is_empty());
}
