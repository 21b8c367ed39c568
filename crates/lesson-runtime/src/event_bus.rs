//! Typed publish/subscribe hub shared by the orchestrator, the sandbox and
//! every mounted activity.
//!
//! Handlers for a type run first, in registration order, then wildcard
//! handlers. A handler that returns `Err` or panics is logged and skipped;
//! the emitter never sees the failure. Handlers run with no lock held, so
//! they may emit or subscribe re-entrantly.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{trace, warn};

use crate::metrics::METRICS;

/// Maximum number of events retained in history.
pub const HISTORY_LIMIT: usize = 1000;

/// Every event type the runtime knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Activity lifecycle, emitted by modules.
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "PROGRESS")]
    Progress,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "ERROR")]
    Error,

    // Lesson level, emitted by the orchestrator.
    #[serde(rename = "loaded")]
    LessonLoaded,
    #[serde(rename = "activity-loaded")]
    ActivityLoaded,
    #[serde(rename = "progress")]
    LessonProgress,
    #[serde(rename = "completed")]
    LessonCompleted,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "resumed")]
    Resumed,

    // Host level.
    #[serde(rename = "resource-overuse")]
    ResourceOveruse,
    #[serde(rename = "notification")]
    Notification,
    #[serde(rename = "activity-error")]
    ActivityError,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Progress => "PROGRESS",
            EventType::Complete => "COMPLETE",
            EventType::Error => "ERROR",
            EventType::LessonLoaded => "loaded",
            EventType::ActivityLoaded => "activity-loaded",
            EventType::LessonProgress => "progress",
            EventType::LessonCompleted => "completed",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
            EventType::ResourceOveruse => "resource-overuse",
            EventType::Notification => "notification",
            EventType::ActivityError => "activity-error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ActivityEvent {
    pub fn new(event_type: EventType, activity_id: impl Into<String>) -> Self {
        Self {
            event_type,
            activity_id: activity_id.into(),
            timestamp: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub type EventHandler = Arc<dyn Fn(&ActivityEvent) -> anyhow::Result<()> + Send + Sync>;

/// Returned by `on`/`on_any`; pass back to `off`/`off_any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusState {
    handlers: HashMap<EventType, Vec<(SubscriptionId, EventHandler)>>,
    wildcard: Vec<(SubscriptionId, EventHandler)>,
    history: VecDeque<ActivityEvent>,
    next_id: u64,
}

impl BusState {
    fn next_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventBus")
            .field("types", &state.handlers.len())
            .field("wildcard", &state.wildcard.len())
            .field("history", &state.history.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe `handler` to `event_type`.
    ///
    /// Registering the same `Arc` twice for one type returns the existing
    /// subscription instead of adding a duplicate.
    pub fn on(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        let mut state = self.lock();
        if let Some(existing) = state
            .handlers
            .get(&event_type)
            .and_then(|set| set.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)))
        {
            return existing.0;
        }
        let id = state.next_id();
        state
            .handlers
            .entry(event_type)
            .or_default()
            .push((id, handler));
        id
    }

    /// Subscribe to every event type.
    pub fn on_any(&self, handler: EventHandler) -> SubscriptionId {
        let mut state = self.lock();
        if let Some(existing) = state.wildcard.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)) {
            return existing.0;
        }
        let id = state.next_id();
        state.wildcard.push((id, handler));
        id
    }

    /// Remove a typed subscription. Returns `false` when it was not present.
    pub fn off(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let Some(set) = state.handlers.get_mut(&event_type) else {
            return false;
        };
        let before = set.len();
        set.retain(|(sid, _)| *sid != id);
        let removed = set.len() != before;
        if set.is_empty() {
            state.handlers.remove(&event_type);
        }
        removed
    }

    pub fn off_any(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.wildcard.len();
        state.wildcard.retain(|(sid, _)| *sid != id);
        state.wildcard.len() != before
    }

    /// Publish an event. Never fails.
    pub fn emit(&self, mut event: ActivityEvent) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let handlers: Vec<EventHandler> = {
            let mut state = self.lock();
            if state.history.len() >= HISTORY_LIMIT {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
            state
                .handlers
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(state.wildcard.iter())
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        METRICS.inc_events_dispatched();
        trace!(
            event_type = %event.event_type,
            activity_id = %event.activity_id,
            handlers = handlers.len(),
            "dispatching event"
        );

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    event_type = %event.event_type,
                    activity_id = %event.activity_id,
                    error = %e,
                    "event handler failed"
                ),
                Err(_) => warn!(
                    event_type = %event.event_type,
                    activity_id = %event.activity_id,
                    "event handler panicked"
                ),
            }
        }
    }

    /// Copy of the retained history, oldest first.
    pub fn history(&self) -> Vec<ActivityEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Retained events of one type, oldest first.
    pub fn history_of(&self, event_type: EventType) -> Vec<ActivityEvent> {
        self.lock()
            .history
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Handlers registered for `event_type` (wildcards excluded).
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.lock()
            .handlers
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether any typed set exists for `event_type`.
    pub fn has_entry(&self, event_type: EventType) -> bool {
        self.lock().handlers.contains_key(&event_type)
    }
}
