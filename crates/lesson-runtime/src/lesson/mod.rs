//! Lesson definitions, validation, progress state and scoring.

mod config;
mod scoring;
mod state;
mod validation;

pub use config::{ActivityStep, Grading, GradingMode, LessonConfig, StepRules};
pub use scoring::{is_passed, total_score, ActivityBreakdown, LessonSummary};
pub use state::{LessonState, LessonStatus};
pub use validation::{validate, validate_all, ConfigError};
