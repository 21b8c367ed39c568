//! The activity module contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dom::Element;
use crate::fetch::FetchError;
use crate::guardrail::GuardrailViolation;
use crate::registry::ActivityManifest;
use crate::sandbox::ActivityContext;

/// Errors raised by module code.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("activity runtime error: {0}")]
    Runtime(String),

    #[error("guardrail violation: {0}")]
    Guardrail(#[from] GuardrailViolation),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("storage error: {0}")]
    Storage(#[from] lesson_store::StorageError),

    #[error("activity is not mounted")]
    NotMounted,
}

impl ActivityError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        ActivityError::Runtime(msg.into())
    }
}

/// Outcome of one activity run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResult {
    /// Normalised to `[0, 1]`.
    pub score: f64,
    pub duration_ms: u64,
    #[serde(default)]
    pub details: Value,
}

impl ActivityResult {
    pub fn new(score: f64, duration_ms: u64, details: Value) -> Self {
        Self {
            score: clamp_score(score),
            duration_ms,
            details,
        }
    }

    /// Zero-score placeholder stored when `get_result` itself fails.
    pub fn failed(error: &dyn std::fmt::Display) -> Self {
        Self {
            score: 0.0,
            duration_ms: 0,
            details: serde_json::json!({ "error": error.to_string() }),
        }
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// An interactive unit the runtime can mount into a container.
///
/// One instance may be cached per template id and mounted many times, so
/// per-run state belongs in whatever `mount` creates, not in the instance
/// itself at construction.
#[async_trait]
pub trait ActivityModule: Send + Sync {
    fn manifest(&self) -> &ActivityManifest;

    async fn preload(&self, _params: &Value) -> Result<(), ActivityError> {
        Ok(())
    }

    async fn mount(
        &self,
        container: &Element,
        params: &Value,
        context: ActivityContext,
    ) -> Result<(), ActivityError>;

    async fn unmount(&self) -> Result<(), ActivityError>;

    async fn get_result(&self) -> Result<ActivityResult, ActivityError>;

    async fn pause(&self) -> Result<(), ActivityError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), ActivityError> {
        Ok(())
    }
}
