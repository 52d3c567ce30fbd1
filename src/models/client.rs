//! Model client abstraction.
//!
//! The pool manager never talks to a provider directly. A
//! `ModelClientFactory` turns a canonical model id into a client; transport
//! and auth live behind that seam.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a model invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("model call cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ModelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Timeout(_))
    }
}

/// Uniform invocation surface over one model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Canonical id of the model this client talks to.
    fn model_id(&self) -> &str;

    /// Send a request payload and return the model's parsed response.
    async fn invoke(&self, request: &Value) -> Result<Value, ModelError>;
}

/// Builds clients for canonical model ids.
pub trait ModelClientFactory: Send + Sync {
    fn create(&self, model_id: &str) -> Result<Arc<dyn ModelClient>, ModelError>;
}
