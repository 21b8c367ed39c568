//! Lesson definitions as authored (camelCase JSON).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validation::ConfigError;

fn default_locale() -> String {
    "en".to_string()
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_pass_line() -> f64 {
    0.7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GradingMode {
    /// Pass when the weighted average reaches the pass line.
    #[default]
    WeightedSum,
    /// Pass when every required step individually reaches the pass line.
    PassFail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grading {
    #[serde(default)]
    pub mode: GradingMode,
    #[serde(default = "default_pass_line")]
    pub pass_line: f64,
}

impl Default for Grading {
    fn default() -> Self {
        Self {
            mode: GradingMode::default(),
            pass_line: default_pass_line(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRules {
    #[serde(default = "default_weight")]
    pub score_weight: f64,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_allowed: Option<bool>,
}

impl Default for StepRules {
    fn default() -> Self {
        Self {
            score_weight: default_weight(),
            required: true,
            timeout_sec: None,
            skip_allowed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStep {
    #[serde(default)]
    pub activity_id: String,
    #[serde(default)]
    pub template: String,
    /// `Null` when absent; validation rejects that.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub rules: StepRules,
}

impl ActivityStep {
    pub fn new(activity_id: &str, template: &str, params: Value) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            template: template.to_string(),
            params,
            rules: StepRules::default(),
        }
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.rules.score_weight = weight;
        self
    }

    /// Auto-advance after completion unless this is `Some(false)`.
    pub fn auto_advances(&self) -> bool {
        self.rules.skip_allowed != Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonConfig {
    #[serde(default)]
    pub lesson_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub flow: Vec<ActivityStep>,
    #[serde(default)]
    pub grading: Grading,
    #[serde(default)]
    pub metadata: Value,
}

impl LessonConfig {
    pub fn new(lesson_id: &str, title: &str, flow: Vec<ActivityStep>) -> Self {
        Self {
            lesson_id: lesson_id.to_string(),
            title: title.to_string(),
            locale: default_locale(),
            flow,
            grading: Grading::default(),
            metadata: Value::Null,
        }
    }

    pub fn with_pass_line(mut self, pass_line: f64) -> Self {
        self.grading.pass_line = pass_line;
        self
    }

    /// Parse lesson JSON. Shape errors become `ConfigError::Parse`; call
    /// [`validate`](super::validate) for semantic checks.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn step(&self, index: usize) -> Option<&ActivityStep> {
        self.flow.get(index)
    }

    pub fn position_of(&self, activity_id: &str) -> Option<usize> {
        self.flow.iter().position(|s| s.activity_id == activity_id)
    }
}
