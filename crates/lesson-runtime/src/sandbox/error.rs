//! Error types for the sandbox layer.

use crate::guardrail::GuardrailViolation;
use crate::module::ActivityError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("invalid params for {template_id}: {}", errors.join("; "))]
    ParameterValidation {
        template_id: String,
        errors: Vec<String>,
    },

    #[error("{phase} timed out after {limit_ms}ms")]
    Timeout { phase: &'static str, limit_ms: u64 },

    #[error("activity {activity_id} failed: {source}")]
    ActivityRuntime {
        activity_id: String,
        #[source]
        source: ActivityError,
    },

    #[error("no mounted activity {0}")]
    NotMounted(String),

    #[error("guardrail violation: {0}")]
    Guardrail(#[from] GuardrailViolation),
}

impl SandboxError {
    pub(crate) fn runtime(activity_id: &str, source: ActivityError) -> Self {
        SandboxError::ActivityRuntime {
            activity_id: activity_id.to_string(),
            source,
        }
    }

    /// Whether retrying the same step could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SandboxError::Timeout { .. } | SandboxError::ActivityRuntime { .. } => true,
            SandboxError::Registry(RegistryError::Fetch(_)) => true,
            SandboxError::Registry(RegistryError::Script { .. }) => true,
            SandboxError::Registry(_) => false,
            SandboxError::ParameterValidation { .. } => false,
            SandboxError::NotMounted(_) => false,
            SandboxError::Guardrail(_) => false,
        }
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_runtime_errors_are_transient() {
        assert!(SandboxError::Timeout {
            phase: "mount",
            limit_ms: 15_000
        }
        .is_transient());
        assert!(SandboxError::runtime("a1", ActivityError::runtime("boom")).is_transient());
        assert!(!SandboxError::ParameterValidation {
            template_id: "quiz@1.0.0".into(),
            errors: vec!["missing questions".into()],
        }
        .is_transient());
        assert!(!SandboxError::Registry(RegistryError::NotFound("x".into())).is_transient());
    }

    #[test]
    fn display_joins_param_errors() {
        let err = SandboxError::ParameterValidation {
            template_id: "quiz@1.0.0".into(),
            errors: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "invalid params for quiz@1.0.0: a; b");
    }
}
