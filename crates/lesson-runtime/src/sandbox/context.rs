//! Contexts handed to activity code.
//!
//! The orchestrator builds a [`BaseContext`] per step; the sandbox narrows it
//! into an [`ActivityContext`] whose every capability goes through the
//! activity's guardrails.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use lesson_store::NamespacedStore;
use serde::Serialize;
use serde_json::Value;

use crate::dom::{DomEvent, Element, ListenerId};
use crate::event_bus::{ActivityEvent, EventBus, EventHandler, EventType, SubscriptionId};
use crate::guardrail::{GuardrailManager, GuardrailViolation};
use crate::module::ActivityError;

/// Step-level context assembled by the orchestrator.
#[derive(Clone)]
pub struct BaseContext {
    pub lesson_id: String,
    pub activity_id: String,
    pub user_id: String,
    pub locale: String,
    pub theme: String,
    pub bus: EventBus,
    /// Namespace `activity:<user>:<activity>`.
    pub storage: Arc<NamespacedStore>,
}

impl fmt::Debug for BaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseContext")
            .field("lesson_id", &self.lesson_id)
            .field("activity_id", &self.activity_id)
            .field("locale", &self.locale)
            .field("theme", &self.theme)
            .field("storage", &self.storage.namespace())
            .finish()
    }
}

/// Event emission on behalf of one activity, gated by its rate limit.
///
/// Emitted events always carry the owning activity id. Subscriptions made
/// here are dropped when the activity is torn down.
#[derive(Clone)]
pub struct SecureEventBus {
    activity_id: String,
    bus: EventBus,
    guard: Arc<GuardrailManager>,
    subscriptions: Arc<Mutex<Vec<(EventType, SubscriptionId)>>>,
}

impl SecureEventBus {
    pub(crate) fn new(activity_id: &str, bus: EventBus, guard: Arc<GuardrailManager>) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            bus,
            guard,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<(EventType, SubscriptionId)>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn emit(&self, event_type: EventType, payload: Option<Value>) -> Result<(), GuardrailViolation> {
        self.guard.enforce_event_limit(event_type.as_str())?;
        self.bus.emit(ActivityEvent {
            event_type,
            activity_id: self.activity_id.clone(),
            timestamp: None,
            payload,
        });
        Ok(())
    }

    pub fn on(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        let id = self.bus.on(event_type, handler);
        self.subscriptions().push((event_type, id));
        id
    }

    pub fn off(&self, event_type: EventType, id: SubscriptionId) -> bool {
        self.subscriptions()
            .retain(|(t, s)| !(*t == event_type && *s == id));
        self.bus.off(event_type, id)
    }

    /// Drop every subscription made through this handle.
    pub(crate) fn release(&self) -> usize {
        let subs: Vec<_> = self.subscriptions().drain(..).collect();
        subs.into_iter()
            .filter(|(t, id)| self.bus.off(*t, *id))
            .count()
    }
}

/// DOM and network operations bound to the activity's guardrails.
#[derive(Clone)]
pub struct SandboxCapabilities {
    guard: Arc<GuardrailManager>,
}

impl SandboxCapabilities {
    pub(crate) fn new(guard: Arc<GuardrailManager>) -> Self {
        Self { guard }
    }

    /// The element the activity renders into.
    pub fn container(&self) -> Element {
        self.guard.dom().container().clone()
    }

    pub fn create_element(&self, tag: &str) -> Result<Element, GuardrailViolation> {
        self.guard.dom().create_element(tag)
    }

    pub fn query_selector(&self, selector: &str) -> Option<Element> {
        self.guard.dom().query_selector(selector)
    }

    pub fn query_selector_all(&self, selector: &str) -> Vec<Element> {
        self.guard.dom().query_selector_all(selector)
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<Element> {
        self.guard.dom().get_element_by_id(id)
    }

    pub fn add_event_listener<F>(
        &self,
        element: &Element,
        event_type: &str,
        listener: F,
    ) -> Result<ListenerId, GuardrailViolation>
    where
        F: Fn(&DomEvent) + Send + Sync + 'static,
    {
        self.guard
            .dom()
            .add_event_listener(element, event_type, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, element: &Element, id: ListenerId) -> bool {
        self.guard.dom().remove_event_listener(element, id)
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, ActivityError> {
        self.guard.network().fetch(url).await
    }

    pub async fn fetch_json(&self, url: &str) -> Result<Value, ActivityError> {
        let bytes = self.fetch(url).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ActivityError::runtime(format!("{url} is not json: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackState {
    fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "playing" => Some(PlaybackState::Playing),
            "paused" => Some(PlaybackState::Paused),
            "stopped" => Some(PlaybackState::Stopped),
            _ => None,
        }
    }
}

const PLAYBACK_ATTR: &str = "data-playback";

/// Play, pause and stop media elements by id, inside the container only.
#[derive(Clone)]
pub struct AudioControl {
    guard: Arc<GuardrailManager>,
}

impl AudioControl {
    pub(crate) fn new(guard: Arc<GuardrailManager>) -> Self {
        Self { guard }
    }

    fn media(&self, element_id: &str) -> Result<Element, ActivityError> {
        let element = self
            .guard
            .dom()
            .get_element_by_id(element_id)
            .ok_or_else(|| ActivityError::runtime(format!("no media element #{element_id}")))?;
        match element.tag_name().as_deref() {
            Some("audio") | Some("video") => Ok(element),
            _ => Err(ActivityError::runtime(format!(
                "#{element_id} is not an audio or video element"
            ))),
        }
    }

    fn transition(&self, element_id: &str, state: PlaybackState) -> Result<(), ActivityError> {
        let media = self.media(element_id)?;
        media.set_attribute(PLAYBACK_ATTR, state.as_str());
        if state == PlaybackState::Stopped {
            media.set_attribute("data-current-time", "0");
        }
        let event = match state {
            PlaybackState::Playing => "play",
            PlaybackState::Paused | PlaybackState::Stopped => "pause",
        };
        media.dispatch(event, Value::Null);
        Ok(())
    }

    pub fn play(&self, element_id: &str) -> Result<(), ActivityError> {
        self.transition(element_id, PlaybackState::Playing)
    }

    pub fn pause(&self, element_id: &str) -> Result<(), ActivityError> {
        self.transition(element_id, PlaybackState::Paused)
    }

    pub fn stop(&self, element_id: &str) -> Result<(), ActivityError> {
        self.transition(element_id, PlaybackState::Stopped)
    }

    pub fn state(&self, element_id: &str) -> Option<PlaybackState> {
        let media = self.media(element_id).ok()?;
        match media.attribute(PLAYBACK_ATTR) {
            Some(s) => PlaybackState::parse(&s),
            None => Some(PlaybackState::Stopped),
        }
    }
}

/// Everything an activity may touch.
#[derive(Clone)]
pub struct ActivityContext {
    pub lesson_id: String,
    pub activity_id: String,
    pub locale: String,
    pub theme: String,
    pub storage: Arc<NamespacedStore>,
    pub events: SecureEventBus,
    pub sandbox: SandboxCapabilities,
    pub audio: AudioControl,
}

impl fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityContext")
            .field("lesson_id", &self.lesson_id)
            .field("activity_id", &self.activity_id)
            .field("locale", &self.locale)
            .field("theme", &self.theme)
            .finish()
    }
}

impl ActivityContext {
    pub(crate) fn secure(base: &BaseContext, guard: Arc<GuardrailManager>) -> Self {
        Self {
            lesson_id: base.lesson_id.clone(),
            activity_id: base.activity_id.clone(),
            locale: base.locale.clone(),
            theme: base.theme.clone(),
            storage: Arc::clone(&base.storage),
            events: SecureEventBus::new(&base.activity_id, base.bus.clone(), Arc::clone(&guard)),
            sandbox: SandboxCapabilities::new(Arc::clone(&guard)),
            audio: AudioControl::new(guard),
        }
    }

    /// Shorthand for `events.emit`.
    pub fn emit(&self, event_type: EventType, payload: Option<Value>) -> Result<(), GuardrailViolation> {
        self.events.emit(event_type, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::fetch::StaticFetcher;
    use crate::guardrail::{GuardrailDefaults, GuardrailPolicy, ProcStatmProbe};
    use crate::registry::{ActivityManifest, Category};
    use lesson_store::{MemoryKvBackend, StoreLimits};

    fn context(doc: &Document, bus: &EventBus, event_limit: u32) -> ActivityContext {
        let container = doc.create_element("div");
        doc.body().append_child(&container);
        let defaults = GuardrailDefaults {
            event_limit,
            ..GuardrailDefaults::default()
        };
        let manifest = ActivityManifest::minimal("t", "1.0.0", Category::Media);
        let guard = Arc::new(GuardrailManager::new(
            "a1",
            container,
            &GuardrailPolicy::from_manifest(&manifest, &defaults),
            bus.clone(),
            Arc::new(StaticFetcher::new()),
            Arc::new(ProcStatmProbe),
        ));
        let base = BaseContext {
            lesson_id: "L1".into(),
            activity_id: "a1".into(),
            user_id: "u1".into(),
            locale: "en".into(),
            theme: "light".into(),
            bus: bus.clone(),
            storage: Arc::new(NamespacedStore::new(
                Arc::new(MemoryKvBackend::new()),
                "activity:u1:a1",
                StoreLimits::default(),
            )),
        };
        ActivityContext::secure(&base, guard)
    }

    #[test]
    fn emitted_events_carry_own_id_and_respect_rate() {
        let doc = Document::new();
        let bus = EventBus::new();
        let ctx = context(&doc, &bus, 2);

        ctx.emit(EventType::Progress, None).unwrap();
        ctx.emit(EventType::Progress, None).unwrap();
        assert!(matches!(
            ctx.emit(EventType::Progress, None),
            Err(GuardrailViolation::EventRateExceeded { .. })
        ));
        let history = bus.history_of(EventType::Progress);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.activity_id == "a1"));
    }

    #[test]
    fn subscriptions_are_released() {
        let doc = Document::new();
        let bus = EventBus::new();
        let ctx = context(&doc, &bus, 10);
        ctx.events.on(EventType::Paused, Arc::new(|_| Ok(())));
        ctx.events.on(EventType::Resumed, Arc::new(|_| Ok(())));
        assert_eq!(ctx.events.release(), 2);
        assert_eq!(bus.handler_count(EventType::Paused), 0);
    }

    #[test]
    fn audio_is_scoped_to_container_media() {
        let doc = Document::new();
        let bus = EventBus::new();
        let ctx = context(&doc, &bus, 10);

        let outside = doc.create_element("audio");
        outside.set_attribute("id", "host-audio");
        doc.body().append_child(&outside);

        let clip = ctx.sandbox.create_element("audio").unwrap();
        clip.set_attribute("id", "clip");
        ctx.sandbox.container().append_child(&clip);
        let label = ctx.sandbox.create_element("p").unwrap();
        label.set_attribute("id", "label");
        ctx.sandbox.container().append_child(&label);

        assert_eq!(ctx.audio.state("clip"), Some(PlaybackState::Stopped));
        ctx.audio.play("clip").unwrap();
        assert_eq!(ctx.audio.state("clip"), Some(PlaybackState::Playing));
        ctx.audio.pause("clip").unwrap();
        assert_eq!(ctx.audio.state("clip"), Some(PlaybackState::Paused));
        ctx.audio.stop("clip").unwrap();
        assert_eq!(clip.attribute("data-current-time").as_deref(), Some("0"));

        assert!(ctx.audio.play("host-audio").is_err());
        assert!(ctx.audio.play("label").is_err());
        assert_eq!(outside.attribute(PLAYBACK_ATTR), None);
    }
}
