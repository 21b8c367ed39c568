//! Structured lifecycle events for lessons and activities.
//!
//! - `lesson_span`: span that tags everything logged during a lesson with
//!   its `lesson_id`. Attach it to async work with `Instrument`
//! - `LessonSpan`: RAII guard entering that span for synchronous scopes
//! - `emit_*`: one `info!`/`warn!` line per lifecycle transition, with a
//!   stable `event` field for log queries

use tracing::{info, warn, Span};

pub fn lesson_span(lesson_id: &str) -> Span {
    tracing::info_span!("lesson", lesson_id = %lesson_id)
}

/// Enters a lesson-scoped span until dropped. Never hold one across an
/// `.await`; instrument the future with [`lesson_span`] instead.
///
/// ```ignore
/// let _span = LessonSpan::enter("fractions-101");
/// // every event logged here carries lesson_id = "fractions-101"
/// ```
pub struct LessonSpan {
    _span: tracing::span::EnteredSpan,
}

impl LessonSpan {
    pub fn enter(lesson_id: &str) -> Self {
        Self {
            _span: lesson_span(lesson_id).entered(),
        }
    }
}

pub fn emit_lesson_started(lesson_id: &str, steps: usize) {
    info!(event = "lesson.started", lesson_id = %lesson_id, steps = steps);
}

pub fn emit_lesson_completed(lesson_id: &str, total_score: f64, passed: bool, duration_ms: u64) {
    info!(
        event = "lesson.completed",
        lesson_id = %lesson_id,
        total_score = total_score,
        passed = passed,
        duration_ms = duration_ms,
    );
    crate::metrics::METRICS.inc_lessons_completed();
}

pub fn emit_activity_mounted(activity_id: &str, template_id: &str, elapsed_ms: u64) {
    info!(
        event = "activity.mounted",
        activity_id = %activity_id,
        template_id = %template_id,
        elapsed_ms = elapsed_ms,
    );
    crate::metrics::METRICS.inc_activities_mounted();
}

/// Mount or preload failure (warning level).
pub fn emit_activity_failed(activity_id: &str, template_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "activity.failed",
        activity_id = %activity_id,
        template_id = %template_id,
        error = %error,
    );
    crate::metrics::METRICS.inc_mount_failures();
}

pub fn emit_guardrail_violation(activity_id: &str, violation: &dyn std::fmt::Display) {
    warn!(
        event = "guardrail.violation",
        activity_id = %activity_id,
        violation = %violation,
    );
    crate::metrics::METRICS.inc_guardrail_violations();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lesson_span_enters_and_drops() {
        let _span = LessonSpan::enter("lesson-under-test");
        emit_lesson_started("lesson-under-test", 3);
    }

    #[tokio::test]
    async fn lesson_span_follows_instrumented_future() {
        use tracing::Instrument;

        let _default = tracing::subscriber::set_default(tracing_subscriber::registry());
        let span = lesson_span("lesson-under-test");
        let id = span.id();
        assert!(id.is_some());
        let seen = async { Span::current().id() }.instrument(span).await;
        assert_eq!(seen, id);
        assert!(Span::current().id().is_none());
    }
}
