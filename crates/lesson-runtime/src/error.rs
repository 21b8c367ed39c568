//! Runtime-level error taxonomy.

use crate::guardrail::GuardrailViolation;
use crate::lesson::ConfigError;
use crate::registry::RegistryError;
use crate::sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid lesson: {0}")]
    ConfigValidation(#[from] ConfigError),

    #[error("invalid runtime config: {0}")]
    InvalidRuntimeConfig(String),

    #[error("template registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("guardrail violation: {0}")]
    Guardrail(#[from] GuardrailViolation),

    #[error("storage error: {0}")]
    Storage(#[from] lesson_store::StorageError),

    #[error("activity {activity_id} failed after {attempts} attempt(s): {source}")]
    ActivityLoad {
        activity_id: String,
        attempts: u32,
        #[source]
        source: SandboxError,
    },

    #[error("no lesson is loaded")]
    NoLesson,
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
