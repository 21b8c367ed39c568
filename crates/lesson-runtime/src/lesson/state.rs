use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::LessonConfig;
use crate::module::ActivityResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonStatus {
    #[default]
    Idle,
    Loading,
    Active,
    Paused,
    Completed,
    Error,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Idle => "idle",
            LessonStatus::Loading => "loading",
            LessonStatus::Active => "active",
            LessonStatus::Paused => "paused",
            LessonStatus::Completed => "completed",
            LessonStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress through one loaded lesson.
///
/// `results` has one slot per flow step and `current_index` never exceeds
/// `flow.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonState {
    pub config: LessonConfig,
    pub current_index: usize,
    pub results: Vec<Option<ActivityResult>>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: LessonStatus,
}

impl LessonState {
    pub fn new(config: LessonConfig) -> Self {
        let steps = config.flow.len();
        Self {
            config,
            current_index: 0,
            results: vec![None; steps],
            start_time: Utc::now(),
            end_time: None,
            status: LessonStatus::Loading,
        }
    }

    pub fn current_step(&self) -> Option<&super::ActivityStep> {
        self.config.step(self.current_index)
    }

    pub fn current_activity_id(&self) -> Option<&str> {
        self.current_step().map(|s| s.activity_id.as_str())
    }

    pub fn completed_steps(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesson::ActivityStep;
    use serde_json::json;

    #[test]
    fn new_state_allocates_one_slot_per_step() {
        let cfg = LessonConfig::new(
            "L1",
            "Lesson",
            vec![
                ActivityStep::new("a", "quiz@1.0.0", json!({})),
                ActivityStep::new("b", "quiz@1.0.0", json!({})),
            ],
        );
        let state = LessonState::new(cfg);
        assert_eq!(state.results, vec![None, None]);
        assert_eq!(state.current_activity_id(), Some("a"));
        assert_eq!(state.status, LessonStatus::Loading);
        assert_eq!(state.completed_steps(), 0);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(LessonStatus::Completed).unwrap(),
            json!("completed")
        );
    }
}
