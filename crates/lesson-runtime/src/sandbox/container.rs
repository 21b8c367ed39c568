//! Isolated sub-container markup and the in-place error state.

use std::sync::Arc;

use serde_json::json;

use crate::dom::Element;
use crate::event_bus::{ActivityEvent, EventBus, EventType};

/// Attribute tagging a sandbox root with its activity id.
pub const ACTIVITY_ID_ATTR: &str = "data-activity-id";

/// Root, content area and hidden error-boundary overlay of one activity.
#[derive(Debug, Clone)]
pub struct IsolatedContainer {
    pub root: Element,
    pub content: Element,
    pub overlay: Element,
}

impl IsolatedContainer {
    /// Replace `parent`'s contents with a fresh container for `activity_id`.
    pub fn build(parent: &Element, activity_id: &str) -> Self {
        let doc = parent.document().clone();
        parent.clear();

        let root = doc.create_element("div");
        root.set_attribute(ACTIVITY_ID_ATTR, activity_id);
        root.add_class("activity-sandbox");
        root.set_style("contain", "layout style paint");
        root.set_style("isolation", "isolate");
        root.set_style("position", "relative");

        let content = doc.create_element("div");
        content.add_class("activity-content");

        let overlay = doc.create_element("div");
        overlay.add_class("activity-error-boundary");
        overlay.set_attribute("role", "alert");
        overlay.set_style("display", "none");

        root.append_child(&content);
        root.append_child(&overlay);
        parent.append_child(&root);

        Self {
            root,
            content,
            overlay,
        }
    }

    pub fn hide_overlay(&self) {
        self.overlay.set_style("display", "none");
        self.overlay.clear();
    }

    /// Show a runtime error over the activity without tearing it down.
    pub fn show_overlay(&self, message: &str) {
        self.overlay.set_text(message);
        self.overlay.set_style("display", "flex");
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay.style("display").as_deref() != Some("none")
    }

    pub fn remove(&self) {
        self.root.remove();
    }
}

/// Replace `parent`'s contents with an error card offering a retry action.
///
/// Clicking retry emits a `notification` event with `action: "retry"` for
/// `activity_id`; whoever drives the lesson decides what a retry means.
pub fn render_error(
    parent: &Element,
    activity_id: &str,
    template_id: &str,
    message: &str,
    bus: &EventBus,
) -> Element {
    let doc = parent.document().clone();
    parent.clear();

    let card = doc.create_element("div");
    card.add_class("activity-error");
    card.set_attribute("role", "alert");
    card.set_attribute("data-template-id", template_id);
    card.set_attribute(ACTIVITY_ID_ATTR, activity_id);

    let heading = doc.create_element("h3");
    heading.set_text("This activity could not be loaded");
    let template = doc.create_element("p");
    template.add_class("activity-error-template");
    template.set_text(template_id);
    let detail = doc.create_element("p");
    detail.add_class("activity-error-message");
    detail.set_text(message);

    let retry = doc.create_element("button");
    retry.add_class("activity-error-retry");
    retry.set_attribute("data-action", "retry");
    retry.set_text("Retry");
    let bus = bus.clone();
    let activity_id = activity_id.to_string();
    retry.add_event_listener(
        "click",
        Arc::new(move |_| {
            bus.emit(
                ActivityEvent::new(EventType::Notification, activity_id.clone())
                    .with_payload(json!({ "action": "retry" })),
            );
        }),
    );

    for child in [&heading, &template, &detail, &retry] {
        card.append_child(child);
    }
    parent.append_child(&card);
    card
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    #[test]
    fn build_replaces_parent_contents() {
        let doc = Document::new();
        let parent = doc.create_element("main");
        doc.body().append_child(&parent);
        parent.append_child(&doc.create_element("p"));

        let c = IsolatedContainer::build(&parent, "a1");

        assert_eq!(parent.children(), vec![c.root.clone()]);
        assert_eq!(c.root.attribute(ACTIVITY_ID_ATTR).as_deref(), Some("a1"));
        assert_eq!(c.root.style("contain").as_deref(), Some("layout style paint"));
        assert!(!c.overlay_visible());

        c.show_overlay("boom");
        assert!(c.overlay_visible());
        c.hide_overlay();
        assert!(!c.overlay_visible());
    }

    #[test]
    fn error_card_retry_emits_notification() {
        let doc = Document::new();
        let parent = doc.create_element("main");
        doc.body().append_child(&parent);
        let bus = EventBus::new();

        render_error(&parent, "a1", "quiz@1.0.0", "mount timed out", &bus);

        let card = parent.query_selector(".activity-error").unwrap();
        assert!(card.text_content().contains("quiz@1.0.0"));
        assert!(card.text_content().contains("mount timed out"));
        let retry = parent.query_selector("button[data-action=\"retry\"]").unwrap();
        assert_eq!(retry.click(), 1);

        let notes = bus.history_of(EventType::Notification);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].activity_id, "a1");
        assert_eq!(notes[0].payload.as_ref().unwrap()["action"], "retry");
    }
}
