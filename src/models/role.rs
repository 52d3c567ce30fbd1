//! Logical LLM-usage categories used to select a model pool.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Classifier,
    Writer,
    Expander,
    Validator,
    StyleRefiner,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Classifier => "classifier",
            ModelRole::Writer => "writer",
            ModelRole::Expander => "expander",
            ModelRole::Validator => "validator",
            ModelRole::StyleRefiner => "style_refiner",
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classifier" => Ok(ModelRole::Classifier),
            "writer" => Ok(ModelRole::Writer),
            "expander" => Ok(ModelRole::Expander),
            "validator" => Ok(ModelRole::Validator),
            "style_refiner" => Ok(ModelRole::StyleRefiner),
            other => Err(format!("unknown model role: {}", other)),
        }
    }
}

/// A model that may serve a role, optionally scoped to one product type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub model_id: String,
    pub role: ModelRole,
    #[serde(default)]
    pub product_type: Option<String>,
}
