//! Fallback classification for model outcomes.
//!
//! `should_fallback` turns a failed call or an unusable response into a
//! `FallbackTrigger`. A caller-supplied `ResponseChecker` runs first on
//! successful responses and may accept, reject, or defer to the defaults.

use crate::models::client::ModelError;
use crate::models::role::ModelRole;
use serde::Serialize;
use serde_json::Value;

/// Why the pool moved on to the next candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum FallbackTrigger {
    Timeout,
    ConnectionError,
    ValidatorHardFail,
    MissingField { field: String },
    InvalidStructure { reason: String },
}

impl std::fmt::Display for FallbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackTrigger::Timeout => write!(f, "timeout"),
            FallbackTrigger::ConnectionError => write!(f, "connection_error"),
            FallbackTrigger::ValidatorHardFail => write!(f, "validator_hard_fail"),
            FallbackTrigger::MissingField { field } => write!(f, "missing_field({})", field),
            FallbackTrigger::InvalidStructure { reason } => {
                write!(f, "invalid_structure({})", reason)
            }
        }
    }
}

/// Verdict from a caller-supplied response check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    /// Response is usable; skip the default checks.
    Accept,
    /// Response is unusable for the given reason.
    Reject(FallbackTrigger),
    /// Fall through to the default checks.
    Defer,
}

/// Caller hook for response classification.
pub trait ResponseChecker: Send + Sync {
    fn check(&self, role: ModelRole, response: &Value) -> CheckVerdict;
}

impl<F> ResponseChecker for F
where
    F: Fn(ModelRole, &Value) -> CheckVerdict + Send + Sync,
{
    fn check(&self, role: ModelRole, response: &Value) -> CheckVerdict {
        self(role, response)
    }
}

/// Fields every response for a role must carry when none are configured.
pub fn default_required_fields(role: ModelRole) -> &'static [&'static str] {
    match role {
        ModelRole::Validator => &["passed"],
        ModelRole::Classifier => &["category"],
        ModelRole::Writer | ModelRole::Expander | ModelRole::StyleRefiner => &[],
    }
}

/// Classify a model outcome. `None` means the outcome is usable.
///
/// Exactly one of `error` or `response` is expected; an error always wins.
pub fn should_fallback(
    error: Option<&ModelError>,
    response: Option<&Value>,
    role: ModelRole,
    required_fields: &[String],
) -> Option<FallbackTrigger> {
    if let Some(err) = error {
        return Some(if err.is_timeout() {
            FallbackTrigger::Timeout
        } else {
            FallbackTrigger::ConnectionError
        });
    }

    let Some(response) = response else {
        return Some(FallbackTrigger::InvalidStructure {
            reason: "empty response".to_string(),
        });
    };

    let Some(object) = response.as_object() else {
        return Some(FallbackTrigger::InvalidStructure {
            reason: format!("expected object, got {}", json_kind(response)),
        });
    };

    if is_hard_fail(role, response) {
        return Some(FallbackTrigger::ValidatorHardFail);
    }

    let missing = if required_fields.is_empty() {
        default_required_fields(role)
            .iter()
            .find(|field| is_absent(object.get(**field)))
            .map(|field| field.to_string())
    } else {
        required_fields
            .iter()
            .find(|field| is_absent(object.get(field.as_str())))
            .cloned()
    };
    if let Some(field) = missing {
        return Some(FallbackTrigger::MissingField { field });
    }

    shape_violation(role, object).map(|reason| FallbackTrigger::InvalidStructure { reason })
}

/// Apply a caller checker, then the default classification.
pub fn classify_response(
    role: ModelRole,
    response: &Value,
    required_fields: &[String],
    checker: Option<&dyn ResponseChecker>,
) -> Option<FallbackTrigger> {
    match checker.map(|c| c.check(role, response)) {
        Some(CheckVerdict::Accept) => None,
        Some(CheckVerdict::Reject(trigger)) => Some(trigger),
        Some(CheckVerdict::Defer) | None => {
            should_fallback(None, Some(response), role, required_fields)
        }
    }
}

fn is_hard_fail(role: ModelRole, response: &Value) -> bool {
    if response.get("hard_fail").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    role == ModelRole::Validator
        && response.get("passed").and_then(Value::as_bool) == Some(false)
        && response.get("severity").and_then(Value::as_str) == Some("hard")
}

fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn shape_violation(role: ModelRole, object: &serde_json::Map<String, Value>) -> Option<String> {
    match role {
        ModelRole::Validator => match object.get("passed") {
            Some(Value::Bool(_)) | None => None,
            Some(other) => Some(format!("passed must be a boolean, got {}", json_kind(other))),
        },
        ModelRole::Classifier => match object.get("category") {
            Some(Value::String(s)) if s.trim().is_empty() => {
                Some("category is empty".to_string())
            }
            Some(Value::String(_)) | None => None,
            Some(other) => Some(format!("category must be a string, got {}", json_kind(other))),
        },
        ModelRole::Writer | ModelRole::Expander | ModelRole::StyleRefiner => {
            ["content", "html", "css"].iter().find_map(|key| match object.get(*key) {
                Some(Value::String(s)) if s.trim().is_empty() => Some(format!("{} is empty", key)),
                Some(Value::String(_)) | None => None,
                Some(other) => Some(format!("{} must be a string, got {}", key, json_kind(other))),
            })
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
