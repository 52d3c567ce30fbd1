//! Model pool definition, loaded as the `[models]` table of the config file.

use crate::models::role::ModelRole;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Bucket key used when no product-type bucket matches.
pub const DEFAULT_BUCKET: &str = "default";

/// Candidate models for one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolePool {
    /// Ordered models per product type, plus the `"default"` bucket.
    #[serde(default)]
    pub by_product_type: BTreeMap<String, Vec<String>>,
    /// Tried after the product-type bucket, before the process default.
    #[serde(default)]
    pub global_override: Option<String>,
}

impl RolePool {
    /// Models for a product type, falling back to the default bucket.
    pub fn bucket(&self, product_type: Option<&str>) -> &[String] {
        product_type
            .and_then(|key| self.by_product_type.get(key))
            .or_else(|| self.by_product_type.get(DEFAULT_BUCKET))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPoolConfig {
    /// Last-resort model for every role.
    pub default_model: String,
    /// Failures within the TTL that open the circuit for a model.
    pub failure_threshold: u32,
    pub failure_ttl_seconds: u64,
    /// Maximum model invocations per `run_with_fallback` call.
    pub max_attempts: usize,
    /// Per-invocation deadline; unset means the caller's own timeout applies.
    pub call_timeout_seconds: Option<u64>,
    /// Configured name to canonical model id.
    pub aliases: HashMap<String, String>,
    /// Capabilities advertised by each canonical model id.
    pub capabilities: HashMap<String, Vec<String>>,
    /// Per-role required response fields; replaces the built-in defaults.
    pub required_fields: BTreeMap<ModelRole, Vec<String>>,
    pub pools: BTreeMap<ModelRole, RolePool>,
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            default_model: "default-model".to_string(),
            failure_threshold: 3,
            failure_ttl_seconds: 300,
            max_attempts: 3,
            call_timeout_seconds: None,
            aliases: HashMap::new(),
            capabilities: HashMap::new(),
            required_fields: BTreeMap::new(),
            pools: BTreeMap::new(),
        }
    }
}

impl ModelPoolConfig {
    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_seconds)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_seconds.map(Duration::from_secs)
    }

    /// Map a configured name to its canonical id. Unknown names pass through.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Whether a canonical model advertises every required capability.
    pub fn supports(&self, model_id: &str, required: &[String]) -> bool {
        if required.is_empty() {
            return true;
        }
        let Some(advertised) = self.capabilities.get(model_id) else {
            return false;
        };
        required.iter().all(|cap| advertised.contains(cap))
    }

    pub fn required_fields_for(&self, role: ModelRole) -> &[String] {
        self.required_fields
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Builder-style helper for assembling pools in code.
    pub fn with_pool(
        mut self,
        role: ModelRole,
        product_type: &str,
        models: &[&str],
    ) -> Self {
        self.pools
            .entry(role)
            .or_default()
            .by_product_type
            .insert(
                product_type.to_string(),
                models.iter().map(|m| m.to_string()).collect(),
            );
        self
    }
}
