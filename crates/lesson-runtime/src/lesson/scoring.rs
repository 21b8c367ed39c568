//! Weighted score aggregation and the lesson summary.

use serde::{Deserialize, Serialize};

use super::config::{GradingMode, LessonConfig};
use super::state::LessonState;
use crate::module::ActivityResult;

/// `Σ(wᵢ·sᵢ) / Σwᵢ` over steps that have a result; 0 when no weight remains.
pub fn total_score(config: &LessonConfig, results: &[Option<ActivityResult>]) -> f64 {
    let (weighted, weights) = config
        .flow
        .iter()
        .zip(results)
        .filter_map(|(step, result)| result.as_ref().map(|r| (step.rules.score_weight, r.score)))
        .fold((0.0, 0.0), |(ws, w), (weight, score)| {
            (ws + weight * score, w + weight)
        });
    if weights > 0.0 {
        weighted / weights
    } else {
        0.0
    }
}

pub fn is_passed(config: &LessonConfig, results: &[Option<ActivityResult>], total: f64) -> bool {
    let pass_line = config.grading.pass_line;
    match config.grading.mode {
        GradingMode::WeightedSum => total >= pass_line,
        GradingMode::PassFail => config
            .flow
            .iter()
            .zip(results)
            .filter(|(step, _)| step.rules.required)
            .all(|(_, result)| result.as_ref().is_some_and(|r| r.score >= pass_line)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBreakdown {
    pub activity_id: String,
    pub template: String,
    pub result: Option<ActivityResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonSummary {
    pub lesson_id: String,
    pub title: String,
    pub total_score: f64,
    pub passed: bool,
    pub duration_ms: u64,
    pub activities: Vec<ActivityBreakdown>,
}

impl LessonSummary {
    pub fn from_state(state: &LessonState) -> Self {
        let config = &state.config;
        let total = total_score(config, &state.results);
        Self {
            lesson_id: config.lesson_id.clone(),
            title: config.title.clone(),
            total_score: total,
            passed: is_passed(config, &state.results, total),
            duration_ms: state.duration_ms(),
            activities: config
                .flow
                .iter()
                .zip(&state.results)
                .map(|(step, result)| ActivityBreakdown {
                    activity_id: step.activity_id.clone(),
                    template: step.template.clone(),
                    result: result.clone(),
                })
                .collect(),
        }
    }
}
