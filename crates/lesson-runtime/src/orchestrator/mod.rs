//! The lesson state machine.
//!
//! `idle → loading → active ⇄ paused → completed`, with `error` reachable
//! from any non-idle state. Bus handlers never touch orchestrator state
//! directly: they queue a [`LessonSignal`] that the owner drains with
//! [`LessonOrchestrator::process_events`] or
//! [`LessonOrchestrator::run_until_settled`]. Signals for any activity other
//! than the current step are dropped, which is what makes late events from
//! torn-down activities harmless. Timer signals also carry the token of the
//! timer that sent them and are dropped once that timer has been replaced
//! or cancelled.

mod recovery;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lesson_store::{KvBackend, NamespacedStore, StoreLimits};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use recovery::{
    classify_failure, FailureClass, RecoveryAction, RecoveryDecision, RecoveryLog,
    RecoveryOutcome, RecoveryPolicy,
};

use crate::dom::Element;
use crate::error::{Result, RuntimeError};
use crate::event_bus::{ActivityEvent, EventBus, EventHandler, EventType, SubscriptionId};
use crate::lesson::{
    validate, ActivityStep, LessonConfig, LessonState, LessonStatus, LessonSummary,
};
use crate::module::ActivityResult;
use crate::obs;
use crate::module::ActivityError;
use crate::registry::{TemplateInfo, TemplateRegistry};
use crate::sandbox::{render_error, BaseContext, SandboxError, SandboxManager};

/// Storage key prefix for persisted lesson summaries.
pub const LESSON_RESULT_PREFIX: &str = "lesson-result:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between an accepted `COMPLETE` and the automatic `next()`.
    pub advance_delay_ms: u64,
    pub recovery: RecoveryPolicy,
    pub user_id: String,
    pub theme: String,
    /// Reject steps whose template is not `name@major.minor.patch`.
    pub strict_template_ids: bool,
    /// How long hosts should show transient notifications.
    pub notification_dismiss_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            advance_delay_ms: 800,
            recovery: RecoveryPolicy::default(),
            user_id: "anonymous".to_string(),
            theme: "light".to_string(),
            strict_template_ids: true,
            notification_dismiss_ms: 4_000,
        }
    }
}

/// Work queued by bus handlers and timers for the orchestrator's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LessonSignal {
    Complete(String),
    Progress(String, Option<Value>),
    Error(String, Option<Value>),
    Overuse(String, Option<Value>),
    Retry(String),
    Advance(String, u64),
    StepTimeout(String, u64),
}

impl LessonSignal {
    pub fn activity_id(&self) -> &str {
        match self {
            LessonSignal::Complete(id)
            | LessonSignal::Progress(id, _)
            | LessonSignal::Error(id, _)
            | LessonSignal::Overuse(id, _)
            | LessonSignal::Retry(id)
            | LessonSignal::Advance(id, _)
            | LessonSignal::StepTimeout(id, _) => id,
        }
    }

    fn from_event(event: &ActivityEvent) -> Option<Self> {
        let id = event.activity_id.clone();
        let payload = event.payload.clone();
        match event.event_type {
            EventType::Complete => Some(LessonSignal::Complete(id)),
            EventType::Progress => Some(LessonSignal::Progress(id, payload)),
            EventType::Error => Some(LessonSignal::Error(id, payload)),
            EventType::ResourceOveruse => Some(LessonSignal::Overuse(id, payload)),
            EventType::Notification => {
                let retry = payload
                    .as_ref()
                    .and_then(|p| p.get("action"))
                    .and_then(Value::as_str)
                    == Some("retry");
                retry.then_some(LessonSignal::Retry(id))
            }
            _ => None,
        }
    }
}

fn forward(tx: &UnboundedSender<LessonSignal>) -> EventHandler {
    let tx = tx.clone();
    Arc::new(move |event: &ActivityEvent| {
        if let Some(signal) = LessonSignal::from_event(event) {
            tx.send(signal)
                .map_err(|_| anyhow::anyhow!("lesson orchestrator has shut down"))?;
        }
        Ok(())
    })
}

const SUBSCRIBED: [EventType; 5] = [
    EventType::Complete,
    EventType::Progress,
    EventType::Error,
    EventType::ResourceOveruse,
    EventType::Notification,
];

fn message_of(payload: &Option<Value>) -> String {
    payload
        .as_ref()
        .and_then(|p| p.get("message").or_else(|| p.get("error")))
        .and_then(Value::as_str)
        .unwrap_or("activity reported an error")
        .to_string()
}

pub struct LessonOrchestrator {
    config: OrchestratorConfig,
    sandbox: SandboxManager,
    bus: EventBus,
    root: Element,
    store: Arc<dyn KvBackend>,
    limits: StoreLimits,
    state: Option<LessonState>,
    signals_tx: UnboundedSender<LessonSignal>,
    signals_rx: UnboundedReceiver<LessonSignal>,
    subscriptions: Vec<(EventType, SubscriptionId)>,
    step_timer: Option<JoinHandle<()>>,
    advance_timer: Option<JoinHandle<()>>,
    /// Activity and token of the armed auto-advance timer.
    pending_advance: Option<(String, u64)>,
    /// Activity and token of the armed step timeout.
    step_deadline: Option<(String, u64)>,
    timer_tokens: u64,
    advance_on_resume: bool,
    last_recovery: Option<RecoveryLog>,
    /// Failures reported by the live activity since it was loaded.
    runtime_recovery: Option<RecoveryLog>,
}

impl fmt::Debug for LessonOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LessonOrchestrator")
            .field("lesson_id", &self.state.as_ref().map(|s| &s.config.lesson_id))
            .field("status", &self.status())
            .field("current_index", &self.state.as_ref().map(|s| s.current_index))
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl LessonOrchestrator {
    /// `root` is the host element activities are mounted under. Results and
    /// per-activity storage live in `store`.
    pub fn new(
        config: OrchestratorConfig,
        sandbox: SandboxManager,
        bus: EventBus,
        root: Element,
        store: Arc<dyn KvBackend>,
        limits: StoreLimits,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let subscriptions = SUBSCRIBED
            .iter()
            .map(|&event_type| (event_type, bus.on(event_type, forward(&signals_tx))))
            .collect();
        Self {
            config,
            sandbox,
            bus,
            root,
            store,
            limits,
            state: None,
            signals_tx,
            signals_rx,
            subscriptions,
            step_timer: None,
            advance_timer: None,
            pending_advance: None,
            step_deadline: None,
            timer_tokens: 0,
            advance_on_resume: false,
            last_recovery: None,
            runtime_recovery: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn registry(&self) -> &TemplateRegistry {
        self.sandbox.registry()
    }

    pub fn register_template(&mut self, info: TemplateInfo) -> Result<()> {
        self.sandbox.register_template(info)?;
        Ok(())
    }

    /// Remove a template, unmounting any live activity that uses it first.
    /// If that is the current step, its result is collected and its timers
    /// stop; the lesson stays where it is until the learner navigates.
    pub async fn unregister_template(&mut self, template_id: &str) -> Result<()> {
        let current_uses_it = self.current_step().is_some_and(|s| s.template == template_id)
            && self
                .current_activity_id()
                .is_some_and(|id| self.sandbox.is_active(&id));
        if current_uses_it {
            self.collect_current_result().await;
            self.cancel_timers();
        }
        self.sandbox.unregister_template(template_id).await?;
        Ok(())
    }

    /// Read-only snapshot of the current lesson, if one is loaded.
    pub fn lesson_state(&self) -> Option<LessonState> {
        self.state.clone()
    }

    pub fn status(&self) -> LessonStatus {
        self.state
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(LessonStatus::Idle)
    }

    pub fn current_step(&self) -> Option<&ActivityStep> {
        self.state.as_ref().and_then(|s| s.current_step())
    }

    pub fn lesson_summary(&self) -> Option<LessonSummary> {
        self.state.as_ref().map(LessonSummary::from_state)
    }

    /// Recovery timeline of the most recent activity load.
    pub fn last_recovery(&self) -> Option<&RecoveryLog> {
        self.last_recovery.as_ref()
    }

    /// Whether an automatic advance is scheduled but has not run yet.
    pub fn advance_pending(&self) -> bool {
        self.pending_advance.is_some()
    }

    /// Validate and start `config`. A lesson that fails validation leaves
    /// the orchestrator exactly as it was.
    #[instrument(skip(self, config), fields(lesson_id = %config.lesson_id))]
    pub async fn load_lesson(&mut self, config: LessonConfig) -> Result<()> {
        validate(&config, self.config.strict_template_ids)?;

        self.teardown().await;
        while self.signals_rx.try_recv().is_ok() {}

        let lesson_id = config.lesson_id.clone();
        let title = config.title.clone();
        let steps = config.flow.len();
        self.state = Some(LessonState::new(config));
        obs::emit_lesson_started(&lesson_id, steps);

        if let Err(e) = self.load_current_activity().await {
            self.set_status(LessonStatus::Error);
            return Err(e);
        }
        self.set_status(LessonStatus::Active);
        self.bus.emit(
            ActivityEvent::new(EventType::LessonLoaded, &lesson_id)
                .with_payload(json!({ "lessonId": lesson_id, "title": title, "steps": steps })),
        );
        Ok(())
    }

    /// Mount the current step, retrying transient failures per the
    /// recovery policy. Exhausted recovery leaves the lesson in `error` and
    /// emits `activity-error` carrying the recovery log.
    pub async fn load_current_activity(&mut self) -> Result<()> {
        let (step, index, lesson_id, locale) = {
            let state = self.state.as_ref().ok_or(RuntimeError::NoLesson)?;
            let Some(step) = state.current_step() else {
                return Ok(());
            };
            (
                step.clone(),
                state.current_index,
                state.config.lesson_id.clone(),
                state.config.locale.clone(),
            )
        };

        self.cancel_timers();
        self.unmount_all().await;
        self.runtime_recovery = None;

        let mut log = RecoveryLog::new(
            &step.activity_id,
            &step.template,
            self.config.recovery.clone(),
        );
        if let Err(error) = self
            .mount_with_recovery(&step, &lesson_id, &locale, &mut log)
            .await
        {
            let attempts = log.decisions.len() as u32;
            self.escalate(&step, log, &error);
            return Err(RuntimeError::ActivityLoad {
                activity_id: step.activity_id,
                attempts,
                source: error,
            });
        }

        if !log.decisions.is_empty() {
            log.mark_recovered();
            info!(activity_id = %step.activity_id, retries = log.retries_used(), "activity recovered");
        }
        self.last_recovery = Some(log);
        self.arm_step_timeout(&step);
        self.bus.emit(
            ActivityEvent::new(EventType::ActivityLoaded, &step.activity_id)
                .with_payload(json!({ "template": step.template, "index": index })),
        );
        Ok(())
    }

    /// Mount `step`, feeding each failure into `log` until it mounts or the
    /// policy gives up.
    async fn mount_with_recovery(
        &mut self,
        step: &ActivityStep,
        lesson_id: &str,
        locale: &str,
        log: &mut RecoveryLog,
    ) -> std::result::Result<(), SandboxError> {
        loop {
            let base = self.base_context(lesson_id, locale, &step.activity_id);
            let error = match self
                .sandbox
                .execute(&step.template, &self.root, &step.params, base)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            match log.record_failure(&error) {
                RecoveryAction::Retry => {
                    warn!(
                        activity_id = %step.activity_id,
                        retry = log.retries_used(),
                        error = %error,
                        "activity load failed, retrying"
                    );
                    self.retry_pause().await;
                }
                RecoveryAction::Escalate => return Err(error),
            }
        }
    }

    async fn retry_pause(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.recovery.retry_delay_ms)).await;
    }

    /// Recovery is exhausted: announce it with the full log and put the
    /// lesson in `error`.
    fn escalate(&mut self, step: &ActivityStep, log: RecoveryLog, error: &SandboxError) {
        self.cancel_timers();
        self.bus.emit(
            ActivityEvent::new(EventType::ActivityError, &step.activity_id).with_payload(json!({
                "template": step.template,
                "error": error.to_string(),
                "recovery": serde_json::to_value(&log).unwrap_or(Value::Null),
            })),
        );
        self.last_recovery = Some(log);
        self.runtime_recovery = None;
        self.set_status(LessonStatus::Error);
    }

    /// The live activity reported an error: unmount and remount it within
    /// the recovery budget shared by every error of this load.
    async fn recover_from_runtime_error(&mut self, activity_id: &str, message: &str) {
        let Some((step, lesson_id, locale)) = self.state.as_ref().and_then(|s| {
            s.current_step()
                .map(|step| (step.clone(), s.config.lesson_id.clone(), s.config.locale.clone()))
        }) else {
            return;
        };
        let mut log = match self.runtime_recovery.take() {
            Some(log) if log.activity_id == step.activity_id => log,
            _ => RecoveryLog::new(
                &step.activity_id,
                &step.template,
                self.config.recovery.clone(),
            ),
        };
        let error = SandboxError::runtime(activity_id, ActivityError::runtime(message));
        let action = log.record_failure(&error);

        self.cancel_timers();
        if action == RecoveryAction::Retry {
            if let Some(container) = self.sandbox.container_of(activity_id) {
                container.show_overlay(message);
            }
            warn!(
                activity_id = %activity_id,
                retry = log.retries_used(),
                message = %message,
                "activity failed at runtime, remounting"
            );
            self.retry_pause().await;
        }
        if self.sandbox.is_active(activity_id) {
            if let Err(e) = self.sandbox.unmount_activity(activity_id).await {
                warn!(activity_id = %activity_id, error = %e, "unmount after error failed");
            }
        }
        if action == RecoveryAction::Escalate {
            render_error(&self.root, activity_id, &step.template, message, &self.bus);
            self.escalate(&step, log, &error);
            return;
        }

        if let Err(error) = self
            .mount_with_recovery(&step, &lesson_id, &locale, &mut log)
            .await
        {
            self.escalate(&step, log, &error);
            return;
        }

        log.mark_recovered();
        info!(activity_id = %activity_id, retries = log.retries_used(), "activity remounted");
        self.last_recovery = Some(log.clone());
        self.runtime_recovery = Some(log);
        if self.status() == LessonStatus::Paused {
            if let Err(e) = self.sandbox.pause_activity(activity_id).await {
                warn!(activity_id = %activity_id, error = %e, "pause hook failed");
            }
        } else {
            self.arm_step_timeout(&step);
        }
        let index = self.state.as_ref().map(|s| s.current_index);
        self.bus.emit(
            ActivityEvent::new(EventType::ActivityLoaded, activity_id)
                .with_payload(json!({ "template": step.template, "index": index })),
        );
    }

    fn base_context(&self, lesson_id: &str, locale: &str, activity_id: &str) -> BaseContext {
        BaseContext {
            lesson_id: lesson_id.to_string(),
            activity_id: activity_id.to_string(),
            user_id: self.config.user_id.clone(),
            locale: locale.to_string(),
            theme: self.config.theme.clone(),
            bus: self.bus.clone(),
            storage: Arc::new(NamespacedStore::new(
                Arc::clone(&self.store),
                format!("activity:{}:{}", self.config.user_id, activity_id),
                self.limits,
            )),
        }
    }

    /// Advance one step, completing the lesson after the last one.
    /// `Ok(false)` when not active or already past the end.
    pub async fn next(&mut self) -> Result<bool> {
        let Some(state) = &self.state else {
            return Ok(false);
        };
        if state.status != LessonStatus::Active || state.current_index >= state.config.flow.len()
        {
            return Ok(false);
        }

        self.collect_current_result().await;
        self.cancel_timers();
        let (index, steps) = self.with_state(|s| {
            s.current_index += 1;
            (s.current_index, s.config.flow.len())
        })?;
        if index >= steps {
            self.complete_lesson().await?;
        } else {
            self.navigate().await?;
        }
        Ok(true)
    }

    /// Step back one activity. `Ok(false)` at the first step or when not
    /// active.
    pub async fn previous(&mut self) -> Result<bool> {
        let Some(state) = &self.state else {
            return Ok(false);
        };
        if state.status != LessonStatus::Active || state.current_index == 0 {
            return Ok(false);
        }
        self.collect_current_result().await;
        self.with_state(|s| s.current_index -= 1)?;
        self.navigate().await?;
        Ok(true)
    }

    /// Jump to `index`. `Ok(false)` when out of range, already there, or not
    /// active.
    pub async fn go_to(&mut self, index: usize) -> Result<bool> {
        let Some(state) = &self.state else {
            return Ok(false);
        };
        if state.status != LessonStatus::Active
            || index >= state.config.flow.len()
            || index == state.current_index
        {
            return Ok(false);
        }
        self.collect_current_result().await;
        self.with_state(|s| s.current_index = index)?;
        self.navigate().await?;
        Ok(true)
    }

    async fn navigate(&mut self) -> Result<()> {
        match self.load_current_activity().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_status(LessonStatus::Error);
                let activity_id = self.current_step().map(|s| s.activity_id.clone());
                self.notify(activity_id.as_deref(), "error", &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn pause(&mut self) -> Result<bool> {
        if self.status() != LessonStatus::Active {
            return Ok(false);
        }
        if let Some(activity_id) = self.current_activity_id() {
            if self.sandbox.is_active(&activity_id) {
                if let Err(e) = self.sandbox.pause_activity(&activity_id).await {
                    warn!(activity_id = %activity_id, error = %e, "pause hook failed");
                }
            }
        }
        if let Some(timer) = self.step_timer.take() {
            timer.abort();
        }
        self.step_deadline = None;
        self.set_status(LessonStatus::Paused);
        self.emit_lesson_event(EventType::Paused);
        Ok(true)
    }

    pub async fn resume(&mut self) -> Result<bool> {
        if self.status() != LessonStatus::Paused {
            return Ok(false);
        }
        if let Some(activity_id) = self.current_activity_id() {
            if self.sandbox.is_active(&activity_id) {
                if let Err(e) = self.sandbox.resume_activity(&activity_id).await {
                    warn!(activity_id = %activity_id, error = %e, "resume hook failed");
                }
            }
            if std::mem::take(&mut self.advance_on_resume) {
                self.schedule_advance(&activity_id);
            } else if let Some(step) = self.current_step().cloned() {
                self.arm_step_timeout(&step);
            }
        }
        self.set_status(LessonStatus::Active);
        self.emit_lesson_event(EventType::Resumed);
        Ok(true)
    }

    /// Finish the lesson: stamp the end time, score it, announce it and
    /// persist the summary under `lesson-result:<lessonId>` for the user.
    #[instrument(skip(self))]
    pub async fn complete_lesson(&mut self) -> Result<LessonSummary> {
        self.cancel_timers();
        self.unmount_all().await;
        let summary = self.with_state(|s| {
            s.current_index = s.config.flow.len();
            s.end_time = Some(Utc::now());
            s.status = LessonStatus::Completed;
            LessonSummary::from_state(s)
        })?;

        obs::emit_lesson_completed(
            &summary.lesson_id,
            summary.total_score,
            summary.passed,
            summary.duration_ms,
        );
        self.bus.emit(
            ActivityEvent::new(EventType::LessonCompleted, &summary.lesson_id)
                .with_payload(serde_json::to_value(&summary).unwrap_or(Value::Null)),
        );

        let key = format!("{LESSON_RESULT_PREFIX}{}", summary.lesson_id);
        if let Err(e) = self.user_store().set(&key, &summary).await {
            warn!(lesson_id = %summary.lesson_id, error = %e, "failed to persist lesson result");
            self.notify(None, "warning", "lesson result could not be saved");
        }
        Ok(summary)
    }

    fn user_store(&self) -> NamespacedStore {
        NamespacedStore::for_user(Arc::clone(&self.store), &self.config.user_id, self.limits)
    }

    /// Previously persisted summary for `lesson_id`.
    pub async fn stored_summary(&self, lesson_id: &str) -> Result<Option<LessonSummary>> {
        let key = format!("{LESSON_RESULT_PREFIX}{lesson_id}");
        Ok(self.user_store().get(&key).await?)
    }

    /// Store the current activity's result, or a zero-score error result if
    /// the module cannot produce one.
    async fn collect_current_result(&mut self) {
        let Some((index, activity_id)) = self
            .state
            .as_ref()
            .and_then(|s| s.current_step().map(|step| (s.current_index, step.activity_id.clone())))
        else {
            return;
        };
        if !self.sandbox.is_active(&activity_id) {
            return;
        }
        let result = match self.sandbox.result_of(&activity_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(activity_id = %activity_id, error = %e, "get_result failed");
                ActivityResult::failed(&e)
            }
        };
        if let Some(state) = self.state.as_mut() {
            state.results[index] = Some(result);
        }
    }

    /// Handle everything queued so far without waiting.
    pub async fn process_events(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(signal) = self.signals_rx.try_recv() {
            self.handle_signal(signal).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Process queued work, then keep waiting while an automatic advance is
    /// scheduled.
    pub async fn run_until_settled(&mut self) -> Result<()> {
        loop {
            self.process_events().await?;
            if self.pending_advance.is_none() {
                return Ok(());
            }
            match self.signals_rx.recv().await {
                Some(signal) => self.handle_signal(signal).await?,
                None => return Ok(()),
            }
        }
    }

    /// Wait up to `limit` for one signal, then drain the queue. Returns
    /// whether anything was handled.
    pub async fn wait_and_process(&mut self, limit: Duration) -> Result<bool> {
        match tokio::time::timeout(limit, self.signals_rx.recv()).await {
            Ok(Some(signal)) => {
                self.handle_signal(signal).await?;
                self.process_events().await?;
                Ok(true)
            }
            Ok(None) | Err(_) => Ok(false),
        }
    }

    fn current_activity_id(&self) -> Option<String> {
        self.current_step().map(|s| s.activity_id.clone())
    }

    fn is_current(&self, activity_id: &str) -> bool {
        matches!(self.status(), LessonStatus::Active | LessonStatus::Paused)
            && self.current_activity_id().as_deref() == Some(activity_id)
    }

    async fn handle_signal(&mut self, signal: LessonSignal) -> Result<()> {
        let activity_id = signal.activity_id().to_string();
        let retryable = matches!(signal, LessonSignal::Retry(_))
            && self.status() == LessonStatus::Error
            && self.current_activity_id().as_deref() == Some(activity_id.as_str());
        if !retryable && !self.is_current(&activity_id) {
            debug!(activity_id = %activity_id, ?signal, "ignoring signal for inactive step");
            return Ok(());
        }

        match signal {
            LessonSignal::Complete(_) => {
                self.collect_current_result().await;
                self.emit_progress(&activity_id, None);
                if self.current_step().is_some_and(ActivityStep::auto_advances) {
                    self.schedule_advance(&activity_id);
                }
            }
            LessonSignal::Progress(_, payload) => self.emit_progress(&activity_id, payload),
            LessonSignal::Error(_, payload) => {
                let message = message_of(&payload);
                warn!(activity_id = %activity_id, message = %message, "activity reported an error");
                self.notify(Some(&activity_id), "error", &message);
                self.recover_from_runtime_error(&activity_id, &message).await;
            }
            LessonSignal::Overuse(_, payload) => {
                let resource = payload
                    .as_ref()
                    .and_then(|p| p.get("resource"))
                    .and_then(Value::as_str)
                    .unwrap_or("resource")
                    .to_string();
                self.notify(
                    Some(&activity_id),
                    "warning",
                    &format!("activity is using too much {resource}"),
                );
            }
            LessonSignal::Retry(_) => {
                info!(activity_id = %activity_id, "retrying activity");
                self.load_current_activity().await?;
                self.set_status(LessonStatus::Active);
            }
            LessonSignal::Advance(_, token) => {
                if self.pending_advance != Some((activity_id.clone(), token)) {
                    debug!(activity_id = %activity_id, token, "dropping stale advance");
                    return Ok(());
                }
                self.pending_advance = None;
                self.advance_timer = None;
                if self.status() == LessonStatus::Paused {
                    self.advance_on_resume = true;
                } else {
                    self.next().await?;
                }
            }
            LessonSignal::StepTimeout(_, token) => {
                if self.step_deadline != Some((activity_id.clone(), token)) {
                    debug!(activity_id = %activity_id, token, "dropping stale step timeout");
                    return Ok(());
                }
                self.step_deadline = None;
                self.step_timer = None;
                if self.status() == LessonStatus::Active {
                    info!(activity_id = %activity_id, "step timed out, advancing");
                    self.notify(Some(&activity_id), "info", "time is up for this activity");
                    self.next().await?;
                }
            }
        }
        Ok(())
    }

    fn schedule_advance(&mut self, activity_id: &str) {
        if let Some(timer) = self.advance_timer.take() {
            timer.abort();
        }
        let tx = self.signals_tx.clone();
        let id = activity_id.to_string();
        let token = self.next_timer_token();
        let delay = Duration::from_millis(self.config.advance_delay_ms);
        self.pending_advance = Some((id.clone(), token));
        self.advance_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LessonSignal::Advance(id, token));
        }));
    }

    fn next_timer_token(&mut self) -> u64 {
        self.timer_tokens += 1;
        self.timer_tokens
    }

    fn arm_step_timeout(&mut self, step: &ActivityStep) {
        if let Some(timer) = self.step_timer.take() {
            timer.abort();
        }
        self.step_deadline = None;
        let Some(secs) = step.rules.timeout_sec else {
            return;
        };
        let tx = self.signals_tx.clone();
        let id = step.activity_id.clone();
        let token = self.next_timer_token();
        self.step_deadline = Some((id.clone(), token));
        self.step_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let _ = tx.send(LessonSignal::StepTimeout(id, token));
        }));
    }

    fn cancel_timers(&mut self) {
        for timer in [self.step_timer.take(), self.advance_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        self.pending_advance = None;
        self.step_deadline = None;
        self.advance_on_resume = false;
    }

    async fn unmount_all(&mut self) {
        for activity_id in self.sandbox.active_ids() {
            if let Err(e) = self.sandbox.unmount_activity(&activity_id).await {
                warn!(activity_id = %activity_id, error = %e, "unmount failed");
            }
        }
    }

    async fn teardown(&mut self) {
        self.cancel_timers();
        self.unmount_all().await;
    }

    /// Unmount the live activity and stop all timers. The lesson state is
    /// kept for inspection.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
    }

    fn with_state<T>(&mut self, f: impl FnOnce(&mut LessonState) -> T) -> Result<T> {
        self.state.as_mut().map(f).ok_or(RuntimeError::NoLesson)
    }

    fn set_status(&mut self, status: LessonStatus) {
        if let Some(state) = self.state.as_mut() {
            debug!(from = %state.status, to = %status, "lesson status");
            state.status = status;
        }
    }

    fn emit_lesson_event(&self, event_type: EventType) {
        if let Some(state) = &self.state {
            self.bus.emit(
                ActivityEvent::new(event_type, &state.config.lesson_id)
                    .with_payload(json!({ "index": state.current_index })),
            );
        }
    }

    fn emit_progress(&self, activity_id: &str, detail: Option<Value>) {
        let Some(state) = &self.state else {
            return;
        };
        let mut payload = json!({
            "lessonId": state.config.lesson_id,
            "index": state.current_index,
            "completed": state.completed_steps(),
            "total": state.config.flow.len(),
        });
        if let Some(detail) = detail {
            payload["detail"] = detail;
        }
        self.bus
            .emit(ActivityEvent::new(EventType::LessonProgress, activity_id).with_payload(payload));
    }

    /// Transient, auto-dismissing message for the host UI.
    fn notify(&self, activity_id: Option<&str>, level: &str, message: &str) {
        let target = activity_id
            .map(str::to_string)
            .or_else(|| self.state.as_ref().map(|s| s.config.lesson_id.clone()))
            .unwrap_or_default();
        self.bus.emit(
            ActivityEvent::new(EventType::Notification, target).with_payload(json!({
                "level": level,
                "message": message,
                "dismissAfterMs": self.config.notification_dismiss_ms,
            })),
        );
    }
}

impl Drop for LessonOrchestrator {
    fn drop(&mut self) {
        self.cancel_timers();
        for (event_type, id) in self.subscriptions.drain(..) {
            self.bus.off(event_type, id);
        }
    }
}
