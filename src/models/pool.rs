//! Model pool manager: candidate resolution, fallback and circuit breaking.
//!
//! One `ModelPoolManager` is built per process and shared (behind `Arc`) by
//! every plan. Its failure and usage maps are the only process-wide mutable
//! state in the crate.

use crate::models::circuit::CircuitBreaker;
use crate::models::client::{ModelClient, ModelClientFactory, ModelError};
use crate::models::config::ModelPoolConfig;
use crate::models::fallback::{self, FallbackTrigger, ResponseChecker};
use crate::models::role::{ModelCandidate, ModelRole};
use crate::util;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("all models exhausted for role {role} (tried: [{}])", .tried.join(", "))]
    Exhausted {
        role: ModelRole,
        tried: Vec<String>,
        last_trigger: Option<FallbackTrigger>,
        #[source]
        last_error: Option<ModelError>,
    },

    #[error("model call cancelled")]
    Cancelled,
}

/// What to run against the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub role: ModelRole,
    pub product_type: Option<String>,
    pub preferred_model: Option<String>,
    pub required_capabilities: Vec<String>,
    /// Overrides the pool-wide attempt cap.
    pub max_attempts: Option<usize>,
}

impl FallbackRequest {
    pub fn new(role: ModelRole) -> Self {
        Self {
            role,
            product_type: None,
            preferred_model: None,
            required_capabilities: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn preferred(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Successful pool call.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    pub model_id: String,
    pub response: Value,
    /// Invocations made, including the successful one.
    pub attempts: usize,
}

pub struct ModelPoolManager {
    config: ModelPoolConfig,
    factory: Arc<dyn ModelClientFactory>,
    circuit: CircuitBreaker,
    usage: Mutex<HashMap<String, u64>>,
}

impl ModelPoolManager {
    pub fn new(config: ModelPoolConfig, factory: Arc<dyn ModelClientFactory>) -> Self {
        let circuit = CircuitBreaker::new(config.failure_threshold, config.failure_ttl());
        Self {
            config,
            factory,
            circuit,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ModelPoolConfig {
        &self.config
    }

    fn usage(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ordered, de-duplicated, capability-filtered candidates for a role.
    ///
    /// Precedence: preferred model, product-type bucket (or the default
    /// bucket), role override, process default. Circuit state is ignored.
    pub fn resolve_candidates(
        &self,
        role: ModelRole,
        product_type: Option<&str>,
        preferred_model: Option<&str>,
        required_capabilities: &[String],
    ) -> Vec<String> {
        let mut ordered: Vec<&str> = Vec::new();
        if let Some(preferred) = preferred_model {
            ordered.push(preferred);
        }
        if let Some(pool) = self.config.pools.get(&role) {
            ordered.extend(pool.bucket(product_type).iter().map(String::as_str));
            if let Some(global) = pool.global_override.as_deref() {
                ordered.push(global);
            }
        }
        if !self.config.default_model.is_empty() {
            ordered.push(&self.config.default_model);
        }

        let mut seen = HashSet::new();
        ordered
            .into_iter()
            .map(|name| self.config.resolve_alias(name))
            .filter(|id| seen.insert(*id))
            .filter(|id| self.config.supports(id, required_capabilities))
            .map(str::to_string)
            .collect()
    }

    /// Candidates for a request with circuit-open models removed.
    pub fn get_candidate_model_ids(&self, request: &FallbackRequest) -> Vec<String> {
        self.resolve_candidates(
            request.role,
            request.product_type.as_deref(),
            request.preferred_model.as_deref(),
            &request.required_capabilities,
        )
        .into_iter()
        .filter(|id| !self.circuit.is_blocked(id))
        .collect()
    }

    /// Same order as [`get_candidate_model_ids`](Self::get_candidate_model_ids).
    ///
    /// A model listed in the request's own product-type bucket carries that
    /// key; models from the default bucket, overrides and the process default
    /// are unscoped.
    pub fn candidates(&self, request: &FallbackRequest) -> Vec<ModelCandidate> {
        let scoped: Option<(&str, HashSet<&str>)> =
            request.product_type.as_deref().and_then(|key| {
                let models = self.config.pools.get(&request.role)?.by_product_type.get(key)?;
                let ids = models
                    .iter()
                    .map(|m| self.config.resolve_alias(m))
                    .collect();
                Some((key, ids))
            });

        self.get_candidate_model_ids(request)
            .into_iter()
            .map(|model_id| {
                let product_type = scoped
                    .as_ref()
                    .filter(|(_, ids)| ids.contains(model_id.as_str()))
                    .map(|(key, _)| key.to_string());
                ModelCandidate {
                    model_id,
                    role: request.role,
                    product_type,
                }
            })
            .collect()
    }

    /// Run `call` against candidates in order until one produces a usable
    /// response.
    ///
    /// Every transport error or rejected response counts a failure against
    /// that model. A `ModelError::Cancelled` stops the loop immediately
    /// without touching the failure map.
    pub async fn run_with_fallback<F, Fut>(
        &self,
        request: &FallbackRequest,
        mut call: F,
        checker: Option<&dyn ResponseChecker>,
    ) -> Result<FallbackOutcome, PoolError>
    where
        F: FnMut(String, Arc<dyn ModelClient>) -> Fut,
        Fut: Future<Output = Result<Value, ModelError>>,
    {
        let role = request.role;
        let candidates = self.resolve_candidates(
            role,
            request.product_type.as_deref(),
            request.preferred_model.as_deref(),
            &request.required_capabilities,
        );
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.max_attempts)
            .max(1);
        let required_fields = self.config.required_fields_for(role);

        tracing::debug!(role = %role, candidates = ?candidates, max_attempts, "resolving model");

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ModelError> = None;
        let mut last_trigger: Option<FallbackTrigger> = None;

        for model_id in candidates {
            if tried.len() >= max_attempts {
                break;
            }
            if self.circuit.is_blocked(&model_id) {
                tracing::debug!(model_id = %model_id, role = %role, "skipping circuit-open model");
                continue;
            }

            tried.push(model_id.clone());
            let result = match self.factory.create(&model_id) {
                Ok(client) => {
                    match util::with_deadline(
                        self.config.call_timeout(),
                        call(model_id.clone(), client),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(elapsed) => Err(ModelError::Timeout(elapsed)),
                    }
                }
                Err(err) => Err(err),
            };

            let trigger = match result {
                Err(ModelError::Cancelled) => return Err(PoolError::Cancelled),
                Err(err) => {
                    let trigger = fallback::should_fallback(Some(&err), None, role, &[])
                        .unwrap_or(FallbackTrigger::ConnectionError);
                    tracing::warn!(model_id = %model_id, role = %role, error = %err, trigger = %trigger, "model call failed, falling back");
                    last_error = Some(err);
                    trigger
                }
                Ok(response) => {
                    match fallback::classify_response(role, &response, required_fields, checker) {
                        None => {
                            self.report_success(&model_id);
                            *self.usage().entry(model_id.clone()).or_insert(0) += 1;
                            tracing::debug!(model_id = %model_id, role = %role, attempts = tried.len(), "model call succeeded");
                            return Ok(FallbackOutcome {
                                model_id,
                                response,
                                attempts: tried.len(),
                            });
                        }
                        Some(trigger) => {
                            tracing::warn!(model_id = %model_id, role = %role, trigger = %trigger, "model response rejected, falling back");
                            last_error = None;
                            trigger
                        }
                    }
                }
            };

            self.report_failure(&model_id);
            last_trigger = Some(trigger);
        }

        tracing::warn!(role = %role, tried = ?tried, "all model candidates exhausted");
        Err(PoolError::Exhausted {
            role,
            tried,
            last_trigger,
            last_error,
        })
    }

    /// Count a failure against a model. Returns the new count.
    pub fn report_failure(&self, model_id: &str) -> u32 {
        self.circuit.report_failure(model_id)
    }

    pub fn report_success(&self, model_id: &str) {
        self.circuit.report_success(model_id);
    }

    pub fn failure_count(&self, model_id: &str) -> u32 {
        self.circuit.failure_count(model_id)
    }

    pub fn is_blocked(&self, model_id: &str) -> bool {
        self.circuit.is_blocked(model_id)
    }

    pub fn reset_failures(&self, model_id: &str) {
        self.circuit.reset(model_id);
    }

    /// Snapshot of successful invocations per model.
    pub fn get_usage_counts(&self) -> HashMap<String, u64> {
        self.usage().clone()
    }
}

impl std::fmt::Debug for ModelPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPoolManager")
            .field("default_model", &self.config.default_model)
            .field("failure_threshold", &self.circuit.threshold())
            .field("failure_ttl", &self.circuit.ttl())
            .finish()
    }
}
