//! Lesson validation. A lesson that fails here is never partially applied.

use std::collections::HashSet;

use super::config::LessonConfig;
use crate::registry::TemplateId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("lesson is not valid json: {0}")]
    Parse(String),

    #[error("lessonId must not be empty")]
    EmptyLessonId,

    #[error("flow must contain at least one activity")]
    EmptyFlow,

    #[error("step {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("duplicate activityId {0:?}")]
    DuplicateActivityId(String),

    #[error("step {activity_id:?} has negative scoreWeight {weight}")]
    NegativeWeight { activity_id: String, weight: f64 },

    #[error("passLine {0} is outside [0, 1]")]
    PassLineOutOfRange(f64),

    #[error("step {activity_id:?} template {template:?} is not name@major.minor.patch")]
    InvalidTemplate {
        activity_id: String,
        template: String,
    },
}

/// Every problem with `config`, in flow order.
pub fn validate_all(config: &LessonConfig, strict_template_ids: bool) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    if config.lesson_id.trim().is_empty() {
        errors.push(ConfigError::EmptyLessonId);
    }
    if config.flow.is_empty() {
        errors.push(ConfigError::EmptyFlow);
    }

    let mut seen = HashSet::new();
    for (index, step) in config.flow.iter().enumerate() {
        if step.activity_id.trim().is_empty() {
            errors.push(ConfigError::MissingField {
                index,
                field: "activityId",
            });
        } else if !seen.insert(step.activity_id.as_str()) {
            errors.push(ConfigError::DuplicateActivityId(step.activity_id.clone()));
        }
        if step.template.trim().is_empty() {
            errors.push(ConfigError::MissingField {
                index,
                field: "template",
            });
        } else if strict_template_ids && TemplateId::parse(&step.template).is_err() {
            errors.push(ConfigError::InvalidTemplate {
                activity_id: step.activity_id.clone(),
                template: step.template.clone(),
            });
        }
        if step.params.is_null() {
            errors.push(ConfigError::MissingField {
                index,
                field: "params",
            });
        }
        let weight = step.rules.score_weight;
        if weight.is_nan() || weight < 0.0 {
            errors.push(ConfigError::NegativeWeight {
                activity_id: step.activity_id.clone(),
                weight,
            });
        }
    }

    let pass_line = config.grading.pass_line;
    if !(0.0..=1.0).contains(&pass_line) {
        errors.push(ConfigError::PassLineOutOfRange(pass_line));
    }
    errors
}

/// First problem with `config`, if any.
pub fn validate(config: &LessonConfig, strict_template_ids: bool) -> Result<(), ConfigError> {
    match validate_all(config, strict_template_ids).into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
