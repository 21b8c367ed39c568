//! `quiz@1.0.0`: multiple-choice questions, one click per question.
//!
//! Params: `{"questions": [{"prompt": "...", "options": ["a", "b"], "answer": 1}]}`.
//! Emits `PROGRESS` after every answer and `COMPLETE` once all questions are
//! answered. Score is the fraction answered correctly.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::dom::Element;
use crate::event_bus::EventType;
use crate::module::{ActivityError, ActivityModule, ActivityResult};
use crate::registry::{
    Accessibility, ActivityManifest, Capability, Category, ParamsSchema, PropertySchema,
    PropertyType,
};
use crate::sandbox::{ActivityContext, SecureEventBus};

pub const NAME: &str = "quiz";
pub const VERSION: &str = "1.0.0";

const ATTEMPTS_KEY: &str = "attempts";
const LAST_ATTEMPT_KEY: &str = "last-attempt";

pub fn manifest() -> ActivityManifest {
    let mut manifest = ActivityManifest::minimal(NAME, VERSION, Category::Quiz);
    manifest.description = Some("Multiple-choice questions scored by correct answers".into());
    manifest.capabilities = BTreeSet::from([Capability::Pointer, Capability::Keyboard]);
    manifest.params_schema = Some(ParamsSchema {
        required: vec!["questions".into()],
        properties: [
            (
                "questions".to_string(),
                PropertySchema {
                    kind: Some(PropertyType::Array),
                    min_length: Some(1),
                    max_length: Some(100),
                    ..PropertySchema::default()
                },
            ),
            (
                "title".to_string(),
                PropertySchema {
                    kind: Some(PropertyType::String),
                    max_length: Some(200),
                    ..PropertySchema::default()
                },
            ),
        ]
        .into_iter()
        .collect(),
    });
    manifest.accessibility = Some(Accessibility {
        keyboard_navigable: true,
        screen_reader: true,
        ..Accessibility::default()
    });
    manifest
}

#[derive(Debug, Clone, Deserialize)]
struct Question {
    prompt: String,
    options: Vec<String>,
    answer: usize,
}

fn parse_questions(params: &Value) -> Result<Vec<Question>, ActivityError> {
    let questions: Vec<Question> = serde_json::from_value(params["questions"].clone())
        .map_err(|e| ActivityError::runtime(format!("invalid questions: {e}")))?;
    for (i, q) in questions.iter().enumerate() {
        if q.answer >= q.options.len() {
            return Err(ActivityError::runtime(format!(
                "question {i} answer {} is out of range",
                q.answer
            )));
        }
    }
    Ok(questions)
}

struct QuizRun {
    questions: Vec<Question>,
    answers: Vec<Option<usize>>,
    started: Instant,
    attempts: u32,
    paused: bool,
    completed: bool,
    ctx: ActivityContext,
}

impl QuizRun {
    fn correct(&self) -> usize {
        self.questions
            .iter()
            .zip(&self.answers)
            .filter(|(q, a)| **a == Some(q.answer))
            .count()
    }

    fn answered(&self) -> usize {
        self.answers.iter().filter(|a| a.is_some()).count()
    }

    fn result(&self) -> ActivityResult {
        let total = self.questions.len();
        let score = if total == 0 {
            0.0
        } else {
            self.correct() as f64 / total as f64
        };
        ActivityResult::new(
            score,
            self.started.elapsed().as_millis() as u64,
            json!({
                "correct": self.correct(),
                "answered": self.answered(),
                "total": total,
                "attempts": self.attempts,
            }),
        )
    }
}

type Shared = Arc<Mutex<Option<QuizRun>>>;

fn lock(run: &Shared) -> MutexGuard<'_, Option<QuizRun>> {
    run.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Quiz {
    manifest: ActivityManifest,
    run: Shared,
}

impl Quiz {
    pub fn new() -> Self {
        Self {
            manifest: manifest(),
            run: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for Quiz {
    fn default() -> Self {
        Self::new()
    }
}

/// Record one answer and report progress. Ignored while paused, after
/// completion, or when the question was already answered.
fn answer(run: &Shared, events: &SecureEventBus, question: usize, option: usize, button: &Element) {
    let (progress, finished) = {
        let mut guard = lock(run);
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.paused || state.completed || state.answers[question].is_some() {
            return;
        }
        state.answers[question] = Some(option);
        let total = state.questions.len();
        let answered = state.answered();
        let finished = answered == total;
        state.completed = finished;
        (
            json!({ "answered": answered, "total": total }),
            finished.then(|| state.result()),
        )
    };
    button.add_class("selected");

    if let Err(e) = events.emit(EventType::Progress, Some(progress)) {
        warn!(error = %e, "quiz progress dropped");
    }
    if let Some(result) = finished {
        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        if let Err(e) = events.emit(EventType::Complete, Some(payload)) {
            warn!(error = %e, "quiz completion dropped");
        }
    }
}

#[async_trait]
impl ActivityModule for Quiz {
    fn manifest(&self) -> &ActivityManifest {
        &self.manifest
    }

    async fn preload(&self, params: &Value) -> Result<(), ActivityError> {
        parse_questions(params).map(|_| ())
    }

    async fn mount(
        &self,
        container: &Element,
        params: &Value,
        ctx: ActivityContext,
    ) -> Result<(), ActivityError> {
        let questions = parse_questions(params)?;
        let attempts = ctx.storage.get::<u32>(ATTEMPTS_KEY).await?.unwrap_or(0) + 1;
        ctx.storage.set(ATTEMPTS_KEY, &attempts).await?;

        let root = ctx.sandbox.create_element("section")?;
        root.add_class("quiz");
        if let Some(title) = params.get("title").and_then(Value::as_str) {
            let heading = ctx.sandbox.create_element("h2")?;
            heading.set_text(title);
            root.append_child(&heading);
        }

        for (qi, question) in questions.iter().enumerate() {
            let block = ctx.sandbox.create_element("div")?;
            block.add_class("quiz-question");
            block.set_attribute("data-index", qi.to_string());
            let prompt = ctx.sandbox.create_element("p")?;
            prompt.add_class("quiz-prompt");
            prompt.set_text(&question.prompt);
            block.append_child(&prompt);

            for (oi, option) in question.options.iter().enumerate() {
                let button = ctx.sandbox.create_element("button")?;
                button.add_class("quiz-option");
                button.set_attribute("data-question", qi.to_string());
                button.set_attribute("data-option", oi.to_string());
                button.set_text(option);
                let run = Arc::clone(&self.run);
                let events = ctx.events.clone();
                ctx.sandbox.add_event_listener(&button, "click", move |event| {
                    answer(&run, &events, qi, oi, &event.target);
                })?;
                block.append_child(&button);
            }
            root.append_child(&block);
        }
        container.append_child(&root);

        let total = questions.len();
        *lock(&self.run) = Some(QuizRun {
            answers: vec![None; total],
            questions,
            started: Instant::now(),
            attempts,
            paused: false,
            completed: false,
            ctx: ctx.clone(),
        });
        ctx.emit(EventType::Start, Some(json!({ "questions": total })))?;
        Ok(())
    }

    async fn unmount(&self) -> Result<(), ActivityError> {
        let run = lock(&self.run).take();
        let Some(run) = run else {
            return Ok(());
        };
        run.ctx.storage.set(LAST_ATTEMPT_KEY, &run.result()).await?;
        Ok(())
    }

    async fn get_result(&self) -> Result<ActivityResult, ActivityError> {
        lock(&self.run)
            .as_ref()
            .map(QuizRun::result)
            .ok_or(ActivityError::NotMounted)
    }

    async fn pause(&self) -> Result<(), ActivityError> {
        if let Some(run) = lock(&self.run).as_mut() {
            run.paused = true;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), ActivityError> {
        if let Some(run) = lock(&self.run).as_mut() {
            run.paused = false;
        }
        Ok(())
    }
}
