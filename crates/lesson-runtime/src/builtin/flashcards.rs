//! `flashcards@1.0.0`: flip-to-reveal cards with optional audio.
//!
//! Params: `{"cards": [{"front": "...", "back": "...", "audio": "id"?}]}`.
//! A card with `audio` gets an `<audio>` element that plays when the card is
//! flipped to its back. The activity completes once every card has been
//! seen; score is the fraction of cards seen.

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
use crate::sandbox::{ActivityContext, AudioControl, PlaybackState, SecureEventBus};

pub const NAME: &str = "flashcards";
pub const VERSION: &str = "1.0.0";

pub fn manifest() -> ActivityManifest {
    let mut manifest = ActivityManifest::minimal(NAME, VERSION, Category::Media);
    manifest.description = Some("Flip cards to reveal the answer".into());
    manifest.capabilities = BTreeSet::from([Capability::Pointer, Capability::Touch]);
    manifest.params_schema = Some(ParamsSchema {
        required: vec!["cards".into()],
        properties: [(
            "cards".to_string(),
            PropertySchema {
                kind: Some(PropertyType::Array),
                min_length: Some(1),
                ..PropertySchema::default()
            },
        )]
        .into_iter()
        .collect(),
    });
    manifest.accessibility = Some(Accessibility {
        keyboard_navigable: true,
        captions: true,
        ..Accessibility::default()
    });
    manifest
}

#[derive(Debug, Clone, Deserialize)]
struct Card {
    front: String,
    back: String,
    #[serde(default)]
    audio: Option<String>,
}

fn audio_id(activity_id: &str, index: usize) -> String {
    format!("{activity_id}-card-audio-{index}")
}

struct DeckRun {
    cards: Vec<Card>,
    seen: Vec<bool>,
    flipped: Vec<bool>,
    flips: u32,
    started: Instant,
    paused: bool,
    completed: bool,
}

impl DeckRun {
    fn seen_count(&self) -> usize {
        self.seen.iter().filter(|s| **s).count()
    }

    fn result(&self) -> ActivityResult {
        let total = self.cards.len();
        let seen = self.seen_count();
        let score = if total == 0 {
            0.0
        } else {
            seen as f64 / total as f64
        };
        ActivityResult::new(
            score,
            self.started.elapsed().as_millis() as u64,
            json!({ "seen": seen, "total": total, "flips": self.flips }),
        )
    }
}

type Shared = Arc<Mutex<Option<DeckRun>>>;

fn lock(run: &Shared) -> MutexGuard<'_, Option<DeckRun>> {
    run.lock().unwrap_or_else(|e| e.into_inner())
}

struct FlipTarget {
    index: usize,
    face: Element,
    audio: Option<String>,
}

fn flip(run: &Shared, events: &SecureEventBus, audio: &AudioControl, target: &FlipTarget) {
    let (text, show_back, progress, finished) = {
        let mut guard = lock(run);
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.paused {
            return;
        }
        let i = target.index;
        state.flipped[i] = !state.flipped[i];
        state.flips += 1;
        let show_back = state.flipped[i];
        let newly_seen = show_back && !state.seen[i];
        if show_back {
            state.seen[i] = true;
        }
        let text = if show_back {
            state.cards[i].back.clone()
        } else {
            state.cards[i].front.clone()
        };
        let total = state.cards.len();
        let progress = newly_seen.then(|| json!({ "seen": state.seen_count(), "total": total }));
        let finished = newly_seen && !state.completed && state.seen_count() == total;
        if finished {
            state.completed = true;
        }
        (text, show_back, progress, finished.then(|| state.result()))
    };

    target.face.set_text(text);
    target
        .face
        .set_attribute("data-side", if show_back { "back" } else { "front" });
    if let Some(id) = &target.audio {
        let played = if show_back {
            audio.play(id)
        } else {
            audio.stop(id)
        };
        if let Err(e) = played {
            warn!(error = %e, "card audio unavailable");
        }
    }

    if let Some(progress) = progress {
        if let Err(e) = events.emit(EventType::Progress, Some(progress)) {
            warn!(error = %e, "flashcard progress dropped");
        }
    }
    if let Some(result) = finished {
        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        if let Err(e) = events.emit(EventType::Complete, Some(payload)) {
            warn!(error = %e, "flashcard completion dropped");
        }
    }
}

pub struct Flashcards {
    manifest: ActivityManifest,
    run: Shared,
    audio: Mutex<Option<(AudioControl, Vec<String>)>>,
}

impl Flashcards {
    pub fn new() -> Self {
        Self {
            manifest: manifest(),
            run: Arc::new(Mutex::new(None)),
            audio: Mutex::new(None),
        }
    }

    fn audio(&self) -> MutexGuard<'_, Option<(AudioControl, Vec<String>)>> {
        self.audio.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Flashcards {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivityModule for Flashcards {
    fn manifest(&self) -> &ActivityManifest {
        &self.manifest
    }

    async fn mount(
        &self,
        container: &Element,
        params: &Value,
        ctx: ActivityContext,
    ) -> Result<(), ActivityError> {
        let cards: Vec<Card> = serde_json::from_value(params["cards"].clone())
            .map_err(|e| ActivityError::runtime(format!("invalid cards: {e}")))?;

        let deck = ctx.sandbox.create_element("div")?;
        deck.add_class("flashcards");
        let mut audio_ids = Vec::new();

        for (i, card) in cards.iter().enumerate() {
            let block = ctx.sandbox.create_element("div")?;
            block.add_class("flashcard");
            block.set_attribute("data-index", i.to_string());
            let face = ctx.sandbox.create_element("p")?;
            face.add_class("flashcard-face");
            face.set_attribute("data-side", "front");
            face.set_text(&card.front);
            block.append_child(&face);

            let audio = match &card.audio {
                Some(src) => {
                    let id = audio_id(&ctx.activity_id, i);
                    let element = ctx.sandbox.create_element("audio")?;
                    element.set_attribute("id", &id);
                    element.set_attribute("src", src);
                    block.append_child(&element);
                    audio_ids.push(id.clone());
                    Some(id)
                }
                None => None,
            };

            let button = ctx.sandbox.create_element("button")?;
            button.add_class("flashcard-flip");
            button.set_text("Flip");
            let target = FlipTarget {
                index: i,
                face,
                audio,
            };
            let run = Arc::clone(&self.run);
            let events = ctx.events.clone();
            let control = ctx.audio.clone();
            ctx.sandbox.add_event_listener(&button, "click", move |_| {
                flip(&run, &events, &control, &target);
            })?;
            block.append_child(&button);
            deck.append_child(&block);
        }
        container.append_child(&deck);

        let total = cards.len();
        *lock(&self.run) = Some(DeckRun {
            seen: vec![false; total],
            flipped: vec![false; total],
            cards,
            flips: 0,
            started: Instant::now(),
            paused: false,
            completed: false,
        });
        *self.audio() = Some((ctx.audio.clone(), audio_ids));
        ctx.emit(EventType::Start, Some(json!({ "cards": total })))?;
        Ok(())
    }

    async fn unmount(&self) -> Result<(), ActivityError> {
        if let Some((control, ids)) = self.audio().take() {
            for id in ids {
                let _ = control.stop(&id);
            }
        }
        lock(&self.run).take();
        Ok(())
    }

    async fn get_result(&self) -> Result<ActivityResult, ActivityError> {
        lock(&self.run)
            .as_ref()
            .map(DeckRun::result)
            .ok_or(ActivityError::NotMounted)
    }

    async fn pause(&self) -> Result<(), ActivityError> {
        if let Some(run) = lock(&self.run).as_mut() {
            run.paused = true;
        }
        if let Some((control, ids)) = self.audio().as_ref() {
            for id in ids {
                if control.state(id) == Some(PlaybackState::Playing) {
                    control.pause(id)?;
                }
            }
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
