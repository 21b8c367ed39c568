//! DOM guardrail: container-scoped queries, tag allowlist, tracked listeners.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use super::GuardrailViolation;
use crate::dom::{Document, Element, Listener, ListenerId};

/// Structural, form and media elements an activity may create.
pub const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "div", "span", "p", "section", "article", "header", "footer", "main", "nav", "aside", "h1",
    "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "strong", "em", "small", "br", "hr", "table",
    "thead", "tbody", "tr", "th", "td", "form", "fieldset", "legend", "label", "input", "textarea",
    "select", "option", "button", "progress", "img", "figure", "figcaption", "picture", "audio",
    "video", "source", "track", "canvas", "svg",
];

#[derive(Debug)]
pub struct DomGuard {
    activity_id: String,
    document: Document,
    container: Element,
    allowed_tags: BTreeSet<String>,
    listeners: Mutex<Vec<(Element, ListenerId)>>,
}

impl DomGuard {
    pub fn new(activity_id: &str, container: Element, allowed_tags: &[String]) -> Self {
        let allowed_tags = if allowed_tags.is_empty() {
            DEFAULT_ALLOWED_TAGS.iter().map(|t| t.to_string()).collect()
        } else {
            allowed_tags.iter().map(|t| t.to_ascii_lowercase()).collect()
        };
        Self {
            activity_id: activity_id.to_string(),
            document: container.document().clone(),
            container,
            allowed_tags,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<(Element, ListenerId)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn container(&self) -> &Element {
        &self.container
    }

    fn in_scope(&self, element: &Element) -> bool {
        self.container.contains(element)
    }

    fn log_blocked(&self, operation: &str, selector: &str) {
        warn!(
            activity_id = %self.activity_id,
            operation,
            selector,
            "blocked DOM access outside activity container"
        );
    }

    pub fn query_selector(&self, selector: &str) -> Option<Element> {
        self.query_selector_all(selector).into_iter().next()
    }

    /// Document-wide query with results outside the container dropped.
    pub fn query_selector_all(&self, selector: &str) -> Vec<Element> {
        let all = self.document.query_selector_all(selector);
        let total = all.len();
        let scoped: Vec<Element> = all.into_iter().filter(|e| self.in_scope(e)).collect();
        if scoped.len() < total {
            self.log_blocked("query_selector", selector);
        }
        scoped
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<Element> {
        let found = self.container.find_by_id(id);
        if found.is_none() && self.document.get_element_by_id(id).is_some() {
            self.log_blocked("get_element_by_id", id);
        }
        found
    }

    /// Create a detached element if `tag` is on the allowlist.
    pub fn create_element(&self, tag: &str) -> Result<Element, GuardrailViolation> {
        let tag = tag.to_ascii_lowercase();
        if !self.allowed_tags.contains(&tag) {
            return Err(GuardrailViolation::TagNotAllowed { tag });
        }
        Ok(self.document.create_element(&tag))
    }

    /// Attach a listener and remember it for `strip_listeners`.
    ///
    /// The element must be inside the container or not yet attached to the
    /// document (freshly created and about to be appended).
    pub fn add_event_listener(
        &self,
        element: &Element,
        event_type: &str,
        listener: Listener,
    ) -> Result<ListenerId, GuardrailViolation> {
        if !self.in_scope(element) && element.is_connected() {
            return Err(GuardrailViolation::OutsideContainer);
        }
        let id = element
            .add_event_listener(event_type, listener)
            .ok_or(GuardrailViolation::OutsideContainer)?;
        self.tracked().push((element.clone(), id));
        Ok(id)
    }

    pub fn remove_event_listener(&self, element: &Element, id: ListenerId) -> bool {
        self.tracked().retain(|(e, l)| !(e == element && *l == id));
        element.remove_event_listener(id)
    }

    pub fn tracked_listener_count(&self) -> usize {
        self.tracked().len()
    }

    /// Remove every listener added through this guard. Returns how many were
    /// still attached.
    pub fn strip_listeners(&self) -> usize {
        let drained: Vec<(Element, ListenerId)> = self.tracked().drain(..).collect();
        drained
            .into_iter()
            .filter(|(element, id)| element.remove_event_listener(*id))
            .count()
    }

    pub fn clear_container(&self) {
        self.container.clear();
    }
}
