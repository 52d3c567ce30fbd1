//! Model pool: role-based candidate selection with fallback and circuit
//! breaking across LLM providers.

pub mod circuit;
pub mod client;
pub mod config;
pub mod fallback;
pub mod pool;
pub mod role;

pub use circuit::{CircuitBreaker, FailureRecord};
pub use client::{ModelClient, ModelClientFactory, ModelError};
pub use config::{ModelPoolConfig, RolePool, DEFAULT_BUCKET};
pub use fallback::{should_fallback, CheckVerdict, FallbackTrigger, ResponseChecker};
pub use pool::{FallbackOutcome, FallbackRequest, ModelPoolManager, PoolError};
pub use role::{ModelCandidate, ModelRole};
