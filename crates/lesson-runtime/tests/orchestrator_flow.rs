mod common;

use std::time::Duration;

use common::{harness, harness_with, orchestrator_config};
use lesson_runtime::lesson::GradingMode;
use lesson_runtime::orchestrator::RecoveryOutcome;
use lesson_runtime::{
    ActivityEvent, ActivityStep, ConfigError, EventType, LessonConfig, LessonStatus,
    LessonSummary, RuntimeError,
};
use lesson_store::{NamespacedStore, StoreLimits};
use serde_json::json;

fn step(id: &str, template: &str) -> ActivityStep {
    ActivityStep::new(id, template, json!({}))
}

fn three_step_lesson() -> LessonConfig {
    LessonConfig::new(
        "fractions-101",
        "Fractions",
        vec![
            step("intro", "perfect@1.0.0"),
            step("practice", "half@1.0.0"),
            step("check", "half@1.0.0").weighted(2.0),
        ],
    )
}

async fn complete_current(h: &mut common::Harness) {
    let id = h.orchestrator.current_step().unwrap().activity_id.clone();
    h.bus.emit(ActivityEvent::new(EventType::Complete, id));
    h.orchestrator.run_until_settled().await.unwrap();
}

#[tokio::test]
async fn full_flow_collects_one_result_per_step() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    assert_eq!(h.orchestrator.status(), LessonStatus::Active);
    assert_eq!(h.bus.history_of(EventType::LessonLoaded).len(), 1);

    for _ in 0..3 {
        complete_current(&mut h).await;
    }

    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.status, LessonStatus::Completed);
    assert_eq!(state.current_index, 3);
    assert!(state.end_time.is_some());
    assert_eq!(state.results.len(), 3);
    assert!(state.results.iter().all(Option::is_some));
    assert_eq!(h.calls.mounts(), 3);
    assert_eq!(h.calls.unmounts(), 3);
    assert!(h.orchestrator.sandbox().active_ids().is_empty());

    let summary = h.orchestrator.lesson_summary().unwrap();
    assert!((summary.total_score - 0.625).abs() < 1e-9);
    assert!(!summary.passed);
    assert_eq!(summary.activities.len(), 3);
    assert_eq!(summary.activities[2].template, "half@1.0.0");

    let completed = h.bus.history_of(EventType::LessonCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].activity_id, "fractions-101");

    let stored = h.orchestrator.stored_summary("fractions-101").await.unwrap().unwrap();
    assert_eq!(stored.total_score, summary.total_score);

    let user = NamespacedStore::for_user(h.backend.clone(), "learner-1", StoreLimits::default());
    let raw: Option<LessonSummary> = user.get("lesson-result:fractions-101").await.unwrap();
    assert!(raw.is_some());
}

#[tokio::test]
async fn total_score_does_not_depend_on_step_order() {
    async fn run(flow: Vec<ActivityStep>) -> f64 {
        let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
        let steps = flow.len();
        h.orchestrator
            .load_lesson(LessonConfig::new("L", "Order", flow))
            .await
            .unwrap();
        for _ in 0..steps {
            complete_current(&mut h).await;
        }
        h.orchestrator.lesson_summary().unwrap().total_score
    }

    let forward = run(vec![
        step("a", "perfect@1.0.0").weighted(3.0),
        step("b", "half@1.0.0"),
        step("c", "half@1.0.0").weighted(0.5),
    ])
    .await;
    let reversed = run(vec![
        step("c", "half@1.0.0").weighted(0.5),
        step("b", "half@1.0.0"),
        step("a", "perfect@1.0.0").weighted(3.0),
    ])
    .await;
    assert!((forward - reversed).abs() < 1e-12);
}

#[tokio::test]
async fn complete_for_another_activity_is_ignored() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();

    h.bus.emit(ActivityEvent::new(EventType::Complete, "practice"));
    h.bus.emit(ActivityEvent::new(EventType::Complete, "unknown"));
    assert_eq!(h.orchestrator.process_events().await.unwrap(), 2);

    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.current_index, 0);
    assert!(state.results.iter().all(Option::is_none));
    assert!(!h.orchestrator.advance_pending());
}

#[tokio::test]
async fn late_complete_from_previous_step_is_ignored() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    complete_current(&mut h).await;
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 1);

    h.bus.emit(ActivityEvent::new(EventType::Complete, "intro"));
    h.orchestrator.run_until_settled().await.unwrap();
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.current_index, 1);
    assert!(state.results[1].is_none());
}

#[tokio::test]
async fn navigation_is_bounded() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();

    assert!(!h.orchestrator.previous().await.unwrap());
    assert!(!h.orchestrator.go_to(3).await.unwrap());
    assert!(!h.orchestrator.go_to(0).await.unwrap());
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 0);

    assert!(h.orchestrator.go_to(2).await.unwrap());
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.current_index, 2);
    assert_eq!(state.results[0].as_ref().unwrap().score, 1.0);

    assert!(h.orchestrator.previous().await.unwrap());
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 1);
    assert_eq!(h.orchestrator.sandbox().active_ids(), vec!["practice".to_string()]);
}

#[tokio::test]
async fn next_collects_and_completes_at_the_end() {
    let mut h = harness(&[("perfect", 1.0)]);
    h.orchestrator
        .load_lesson(LessonConfig::new(
            "L",
            "Short",
            vec![step("only", "perfect@1.0.0")],
        ))
        .await
        .unwrap();
    assert!(h.orchestrator.next().await.unwrap());
    assert_eq!(h.orchestrator.status(), LessonStatus::Completed);
    assert!(h.orchestrator.lesson_summary().unwrap().passed);
    assert!(!h.orchestrator.next().await.unwrap());
}

#[tokio::test]
async fn invalid_lesson_changes_nothing() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    let before = h.orchestrator.lesson_state().unwrap();

    let mut broken = three_step_lesson();
    broken.flow[1].activity_id = "intro".into();
    let err = h.orchestrator.load_lesson(broken).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ConfigValidation(ConfigError::DuplicateActivityId(_))
    ));

    assert_eq!(h.orchestrator.lesson_state().unwrap(), before);
    assert_eq!(h.orchestrator.sandbox().active_ids(), vec!["intro".to_string()]);
}

#[tokio::test]
async fn skip_allowed_false_waits_for_manual_next() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    let mut lesson = three_step_lesson();
    lesson.flow[0].rules.skip_allowed = Some(false);
    h.orchestrator.load_lesson(lesson).await.unwrap();

    complete_current(&mut h).await;
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.current_index, 0);
    assert!(state.results[0].is_some());

    assert!(h.orchestrator.next().await.unwrap());
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 1);
}

#[tokio::test]
async fn pass_fail_grading_checks_every_required_step() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    let mut lesson = three_step_lesson().with_pass_line(0.5);
    lesson.grading.mode = GradingMode::PassFail;
    h.orchestrator.load_lesson(lesson).await.unwrap();
    for _ in 0..3 {
        complete_current(&mut h).await;
    }
    assert!(h.orchestrator.lesson_summary().unwrap().passed);
}

#[tokio::test]
async fn transient_mount_failures_are_retried() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.calls.fail_next_mounts(2);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();

    assert_eq!(h.orchestrator.status(), LessonStatus::Active);
    let log = h.orchestrator.last_recovery().unwrap();
    assert_eq!(log.outcome, RecoveryOutcome::Recovered);
    assert_eq!(log.retries_used(), 2);
    assert_eq!(h.calls.mounts(), 1);
}

#[tokio::test]
async fn exhausted_recovery_is_terminal_until_retried() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.calls.fail_next_mounts(10);
    let err = h.orchestrator.load_lesson(three_step_lesson()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ActivityLoad { attempts: 4, .. }));
    assert_eq!(h.orchestrator.status(), LessonStatus::Error);

    let errors = h.bus.history_of(EventType::ActivityError);
    assert_eq!(errors.len(), 1);
    let payload = errors[0].payload.as_ref().unwrap();
    assert_eq!(payload["recovery"]["outcome"], "failed");
    assert_eq!(payload["recovery"]["decisions"].as_array().unwrap().len(), 4);

    // The error card's retry button reloads the step.
    h.calls.fail_next_mounts(0);
    let retry = h.root.query_selector("button[data-action=\"retry\"]").unwrap();
    retry.click();
    h.orchestrator.process_events().await.unwrap();
    assert_eq!(h.orchestrator.status(), LessonStatus::Active);
    assert!(h.orchestrator.sandbox().is_active("intro"));
}

#[tokio::test]
async fn pause_defers_auto_advance_until_resume() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();

    assert!(h.orchestrator.pause().await.unwrap());
    assert!(!h.orchestrator.pause().await.unwrap());
    assert!(!h.orchestrator.next().await.unwrap());
    assert_eq!(h.bus.history_of(EventType::Paused).len(), 1);

    h.bus.emit(ActivityEvent::new(EventType::Complete, "intro"));
    h.orchestrator.run_until_settled().await.unwrap();
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.status, LessonStatus::Paused);
    assert_eq!(state.current_index, 0);
    assert!(state.results[0].is_some());

    assert!(h.orchestrator.resume().await.unwrap());
    assert_eq!(h.bus.history_of(EventType::Resumed).len(), 1);
    h.orchestrator.run_until_settled().await.unwrap();
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 1);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_advances_the_lesson() {
    let mut h = harness_with(&[("perfect", 1.0), ("half", 0.5)], orchestrator_config());
    let mut lesson = three_step_lesson();
    lesson.flow[0].rules.timeout_sec = Some(30);
    h.orchestrator.load_lesson(lesson).await.unwrap();

    assert!(h
        .orchestrator
        .wait_and_process(Duration::from_secs(60))
        .await
        .unwrap());
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.current_index, 1);
    assert!(state.results[0].is_some());
    let notes = h.bus.history_of(EventType::Notification);
    assert!(notes
        .iter()
        .any(|n| n.payload.as_ref().unwrap()["message"] == "time is up for this activity"));
}

#[tokio::test]
async fn runtime_error_remounts_the_activity() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    assert_eq!(h.calls.mounts(), 1);

    h.bus.emit(
        ActivityEvent::new(EventType::Error, "intro").with_payload(json!({ "message": "audio failed" })),
    );
    h.orchestrator.run_until_settled().await.unwrap();

    assert_eq!(h.orchestrator.status(), LessonStatus::Active);
    assert_eq!(h.calls.unmounts(), 1);
    assert_eq!(h.calls.mounts(), 2);
    assert!(h.orchestrator.sandbox().is_active("intro"));
    assert!(!h
        .orchestrator
        .sandbox()
        .container_of("intro")
        .unwrap()
        .overlay_visible());

    let log = h.orchestrator.last_recovery().unwrap();
    assert_eq!(log.outcome, RecoveryOutcome::Recovered);
    assert_eq!(log.retries_used(), 1);
    assert!(log.decisions[0].error.contains("audio failed"));
    assert!(h.bus.history_of(EventType::ActivityError).is_empty());

    let notes = h.bus.history_of(EventType::Notification);
    let last = notes.last().unwrap().payload.as_ref().unwrap();
    assert_eq!(last["level"], "error");
    assert_eq!(last["message"], "audio failed");
    assert_eq!(last["dismissAfterMs"], 4_000);
}

#[tokio::test]
async fn repeated_runtime_errors_exhaust_recovery() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();

    // Three remounts are allowed; the fourth error is terminal.
    for round in 1..=4 {
        h.bus.emit(
            ActivityEvent::new(EventType::Error, "intro").with_payload(json!({ "message": "uncaught" })),
        );
        h.orchestrator.process_events().await.unwrap();
        if round < 4 {
            assert_eq!(h.orchestrator.status(), LessonStatus::Active, "round {round}");
        }
    }

    assert_eq!(h.orchestrator.status(), LessonStatus::Error);
    assert_eq!(h.calls.mounts(), 4);
    assert_eq!(h.calls.unmounts(), 4);
    assert!(h.orchestrator.sandbox().active_ids().is_empty());

    let errors = h.bus.history_of(EventType::ActivityError);
    assert_eq!(errors.len(), 1);
    let payload = errors[0].payload.as_ref().unwrap();
    assert_eq!(payload["recovery"]["outcome"], "failed");
    assert_eq!(payload["recovery"]["decisions"].as_array().unwrap().len(), 4);
    assert_eq!(
        h.orchestrator.last_recovery().unwrap().outcome,
        RecoveryOutcome::Failed
    );

    // Errors from the torn-down step change nothing further.
    h.bus.emit(ActivityEvent::new(EventType::Error, "intro"));
    h.orchestrator.process_events().await.unwrap();
    assert_eq!(h.calls.mounts(), 4);

    // The error card offers a fresh load with a fresh budget.
    let retry = h.root.query_selector("button[data-action=\"retry\"]").unwrap();
    retry.click();
    h.orchestrator.process_events().await.unwrap();
    assert_eq!(h.orchestrator.status(), LessonStatus::Active);
    assert_eq!(h.calls.mounts(), 5);
}

#[tokio::test]
async fn stale_advance_does_not_skip_a_revisited_step() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    let mut lesson = three_step_lesson();
    lesson.flow[0].rules.skip_allowed = Some(true);
    h.orchestrator.load_lesson(lesson).await.unwrap();

    h.bus.emit(ActivityEvent::new(EventType::Complete, "intro"));
    h.orchestrator.process_events().await.unwrap();
    assert!(h.orchestrator.advance_pending());
    // Let the zero-delay timer queue its signal.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(h.orchestrator.next().await.unwrap());
    assert!(h.orchestrator.previous().await.unwrap());
    assert_eq!(h.orchestrator.current_step().unwrap().activity_id, "intro");

    h.orchestrator.process_events().await.unwrap();
    assert_eq!(h.orchestrator.current_step().unwrap().activity_id, "intro");
    assert!(!h.orchestrator.advance_pending());
}

#[tokio::test(start_paused = true)]
async fn stale_step_timeout_does_not_skip_a_revisited_step() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    let mut lesson = three_step_lesson();
    lesson.flow[0].rules.timeout_sec = Some(30);
    h.orchestrator.load_lesson(lesson).await.unwrap();

    // The timeout fires and queues its signal before the learner moves.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(h.orchestrator.go_to(1).await.unwrap());
    assert!(h.orchestrator.previous().await.unwrap());

    h.orchestrator.process_events().await.unwrap();
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 0);

    // The re-armed timer still works.
    assert!(h
        .orchestrator
        .wait_and_process(Duration::from_secs(60))
        .await
        .unwrap());
    assert_eq!(h.orchestrator.lesson_state().unwrap().current_index, 1);
}

#[tokio::test]
async fn unregistering_a_mounted_template_unmounts_it_once() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    let guard = h.orchestrator.sandbox().guardrails_of("intro").unwrap();
    assert!(guard.resources().is_running());

    h.orchestrator.unregister_template("perfect@1.0.0").await.unwrap();
    assert_eq!(h.calls.unmounts(), 1);
    assert!(h.orchestrator.sandbox().active_ids().is_empty());
    assert!(!guard.resources().is_running());
    assert!(!h.orchestrator.registry().contains("perfect@1.0.0"));
    let state = h.orchestrator.lesson_state().unwrap();
    assert_eq!(state.results[0].as_ref().unwrap().score, 1.0);

    assert!(h.orchestrator.next().await.unwrap());
    assert_eq!(h.orchestrator.current_step().unwrap().activity_id, "practice");
    assert_eq!(h.calls.unmounts(), 1);
    assert_eq!(h.orchestrator.sandbox().active_ids(), vec!["practice".to_string()]);
}

#[tokio::test]
async fn progress_events_are_relayed_as_lesson_progress() {
    let mut h = harness(&[("perfect", 1.0), ("half", 0.5)]);
    h.orchestrator.load_lesson(three_step_lesson()).await.unwrap();
    h.bus.emit(
        ActivityEvent::new(EventType::Progress, "intro").with_payload(json!({ "answered": 1 })),
    );
    h.orchestrator.process_events().await.unwrap();

    let progress = h.bus.history_of(EventType::LessonProgress);
    assert_eq!(progress.len(), 1);
    let payload = progress[0].payload.as_ref().unwrap();
    assert_eq!(payload["total"], 3);
    assert_eq!(payload["detail"]["answered"], 1);
}
