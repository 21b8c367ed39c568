//! Bounded recovery decisions for activities that fail to load or fail
//! while running.
//!
//! The orchestrator feeds each failure into a [`RecoveryLog`], which records
//! an auditable decision per attempt and says whether to retry or give up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxError;

/// Coarse failure taxonomy used by the recovery planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, module runtime errors, fetch and script failures.
    Transient,
    /// Bad params, unknown templates, interface and policy violations.
    Permanent,
}

pub fn classify_failure(error: &SandboxError) -> FailureClass {
    if error.is_transient() {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Pending,
    Recovered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub attempt: u32,
    pub failure_class: FailureClass,
    pub action: RecoveryAction,
    pub error: String,
    pub rationale: String,
}

/// Recovery timeline for one activity load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryLog {
    pub activity_id: String,
    pub template: String,
    pub policy: RecoveryPolicy,
    pub decisions: Vec<RecoveryDecision>,
    pub outcome: RecoveryOutcome,
    pub evaluated_at: DateTime<Utc>,
}

impl RecoveryLog {
    pub fn new(activity_id: &str, template: &str, policy: RecoveryPolicy) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            template: template.to_string(),
            policy,
            decisions: Vec::new(),
            outcome: RecoveryOutcome::Pending,
            evaluated_at: Utc::now(),
        }
    }

    pub fn retries_used(&self) -> u32 {
        self.decisions
            .iter()
            .filter(|d| d.action == RecoveryAction::Retry)
            .count() as u32
    }

    /// Record a failed attempt and decide what happens next.
    pub fn record_failure(&mut self, error: &SandboxError) -> RecoveryAction {
        let class = classify_failure(error);
        let used = self.retries_used();
        let (action, rationale) = match class {
            FailureClass::Permanent => (
                RecoveryAction::Escalate,
                "failure is not transient; retrying cannot help".to_string(),
            ),
            FailureClass::Transient if used >= self.policy.max_retries => (
                RecoveryAction::Escalate,
                format!("retry budget of {} exhausted", self.policy.max_retries),
            ),
            FailureClass::Transient => (
                RecoveryAction::Retry,
                format!("transient failure; retry {} of {}", used + 1, self.policy.max_retries),
            ),
        };

        self.decisions.push(RecoveryDecision {
            attempt: self.decisions.len() as u32 + 1,
            failure_class: class,
            action,
            error: error.to_string(),
            rationale,
        });
        self.outcome = match action {
            RecoveryAction::Escalate => RecoveryOutcome::Failed,
            RecoveryAction::Retry => RecoveryOutcome::Pending,
        };
        self.evaluated_at = Utc::now();
        action
    }

    pub fn mark_recovered(&mut self) {
        self.outcome = RecoveryOutcome::Recovered;
        self.evaluated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;

    fn timeout() -> SandboxError {
        SandboxError::Timeout {
            phase: "mount",
            limit_ms: 10,
        }
    }

    #[test]
    fn transient_failures_retry_until_budget_is_spent() {
        let mut log = RecoveryLog::new(
            "a1",
            "quiz@1.0.0",
            RecoveryPolicy {
                max_retries: 2,
                retry_delay_ms: 0,
            },
        );
        assert_eq!(log.record_failure(&timeout()), RecoveryAction::Retry);
        assert_eq!(log.record_failure(&timeout()), RecoveryAction::Retry);
        assert_eq!(log.record_failure(&timeout()), RecoveryAction::Escalate);

        assert_eq!(log.retries_used(), 2);
        assert_eq!(log.outcome, RecoveryOutcome::Failed);
        assert_eq!(log.decisions.len(), 3);
        assert_eq!(log.decisions[2].attempt, 3);
        assert!(log.decisions[2].rationale.contains("exhausted"));
    }

    #[test]
    fn permanent_failures_escalate_immediately() {
        let mut log = RecoveryLog::new("a1", "ghost@1.0.0", RecoveryPolicy::default());
        let err = SandboxError::Registry(RegistryError::NotFound("ghost@1.0.0".into()));
        assert_eq!(classify_failure(&err), FailureClass::Permanent);
        assert_eq!(log.record_failure(&err), RecoveryAction::Escalate);
        assert_eq!(log.retries_used(), 0);
    }

    #[test]
    fn recovery_is_recorded() {
        let mut log = RecoveryLog::new("a1", "quiz@1.0.0", RecoveryPolicy::default());
        log.record_failure(&timeout());
        log.mark_recovered();
        assert_eq!(log.outcome, RecoveryOutcome::Recovered);
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["decisions"][0]["action"], "retry");
        assert_eq!(json["decisions"][0]["failure_class"], "transient");
    }
}
