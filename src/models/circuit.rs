//! Per-model failure tracking with lazy TTL reset.
//!
//! A model is blocked once its failure count reaches the threshold and its
//! last failure is younger than the TTL. Expired records are cleared on the
//! next access; there is no background timer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub failure_count: u32,
    pub last_failure_time: Instant,
}

impl FailureRecord {
    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_failure_time) >= ttl
    }
}

/// Process-wide failure map shared by every plan and task.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    ttl: Duration,
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, ttl: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, FailureRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the live record for a model, dropping it if the TTL has passed.
    fn live_record(
        records: &mut HashMap<String, FailureRecord>,
        model_id: &str,
        ttl: Duration,
        now: Instant,
    ) -> Option<FailureRecord> {
        let record = *records.get(model_id)?;
        if record.expired(ttl, now) {
            records.remove(model_id);
            tracing::debug!(model_id, "failure record expired");
            return None;
        }
        Some(record)
    }

    /// Record a failure and return the new count.
    pub fn report_failure(&self, model_id: &str) -> u32 {
        let now = Instant::now();
        let mut records = self.records();
        let previous = Self::live_record(&mut records, model_id, self.ttl, now)
            .map(|r| r.failure_count)
            .unwrap_or(0);
        let count = previous + 1;
        records.insert(
            model_id.to_string(),
            FailureRecord {
                failure_count: count,
                last_failure_time: now,
            },
        );
        if count == self.threshold {
            tracing::warn!(
                model_id,
                failures = count,
                ttl_secs = self.ttl.as_secs(),
                "circuit opened for model"
            );
        }
        count
    }

    /// Clear the failure record after a successful call.
    pub fn report_success(&self, model_id: &str) {
        if self.records().remove(model_id).is_some() {
            tracing::debug!(model_id, "failure record cleared after success");
        }
    }

    pub fn is_blocked(&self, model_id: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records();
        Self::live_record(&mut records, model_id, self.ttl, now)
            .map(|r| r.failure_count >= self.threshold)
            .unwrap_or(false)
    }

    pub fn failure_count(&self, model_id: &str) -> u32 {
        let now = Instant::now();
        let mut records = self.records();
        Self::live_record(&mut records, model_id, self.ttl, now)
            .map(|r| r.failure_count)
            .unwrap_or(0)
    }

    pub fn reset(&self, model_id: &str) {
        self.records().remove(model_id);
    }
}
