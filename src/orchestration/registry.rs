//! Directory of running schedulers, keyed by plan id.
//!
//! Lets an outside caller (a "cancel build" endpoint, the CLI's Ctrl-C
//! handler) reach a plan it did not start.

use crate::core::PlanId;
use crate::error::{Error, Result};
use crate::orchestration::events::TaskEvent;
use crate::orchestration::scheduler::{ExecutionSummary, Scheduler};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

/// The lock is never held across an `.await`, so registration can be undone
/// from `Drop`.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<PlanId, Arc<Scheduler>>>,
}

/// Removes a plan from the registry when `run` finishes or its future is
/// dropped.
struct Registration<'a> {
    registry: &'a ExecutorRegistry,
    plan_id: PlanId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.plan_id);
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PlanId, Arc<Scheduler>>> {
        self.executors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PlanId, Arc<Scheduler>>> {
        self.executors.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, plan_id: PlanId, scheduler: Arc<Scheduler>) -> Result<()> {
        let mut executors = self.write();
        if executors.contains_key(&plan_id) {
            return Err(Error::PlanAlreadyRegistered(plan_id));
        }
        executors.insert(plan_id, scheduler);
        tracing::debug!(plan_id = %plan_id, active = executors.len(), "scheduler registered");
        Ok(())
    }

    pub fn unregister(&self, plan_id: &PlanId) -> Option<Arc<Scheduler>> {
        let removed = self.write().remove(plan_id);
        if removed.is_some() {
            tracing::debug!(plan_id = %plan_id, "scheduler unregistered");
        }
        removed
    }

    pub fn lookup(&self, plan_id: &PlanId) -> Option<Arc<Scheduler>> {
        self.read().get(plan_id).cloned()
    }

    /// Cancel a registered plan. Returns false if no such plan is running.
    pub fn cancel(&self, plan_id: &PlanId) -> bool {
        match self.lookup(plan_id) {
            Some(scheduler) => {
                scheduler.cancel();
                true
            }
            None => {
                tracing::debug!(plan_id = %plan_id, "cancel requested for unknown plan");
                false
            }
        }
    }

    /// Cancel every registered plan, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let executors = self.read();
        for scheduler in executors.values() {
            scheduler.cancel();
        }
        executors.len()
    }

    pub fn active_plans(&self) -> Vec<PlanId> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Register, execute and unregister.
    ///
    /// The plan is unregistered when execution returns, fails, or the
    /// returned future is dropped before completion.
    pub async fn run(
        &self,
        scheduler: Arc<Scheduler>,
        events: mpsc::Sender<TaskEvent>,
    ) -> Result<ExecutionSummary> {
        let plan_id = scheduler.plan_id();
        self.register(plan_id, scheduler.clone())?;
        let _registration = Registration {
            registry: self,
            plan_id,
        };
        scheduler.execute(events).await
    }
}
