//! Host document: the in-process element tree activities render into.
//!
//! This stands in for the page that hosts a lesson. Nodes live in an arena
//! owned by [`Document`]; [`Element`] is a cheap handle (document + node id)
//! that can be cloned into listeners and contexts. A handle whose node has
//! been removed stays valid as a value but every mutation on it is a no-op
//! and every query returns nothing.
//!
//! Listeners are invoked with no lock held, so a listener may freely mutate
//! the tree or dispatch further events.
//!
//! Supported selectors are single compound selectors: an optional tag name
//! followed by any number of `#id`, `.class`, `[attr]` and `[attr="value"]`
//! parts (`button.option[data-index="2"]`). Combinators are not supported.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

/// Arena index of a node.
pub type NodeId = u64;

/// Handle returned by `add_event_listener`, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Callback attached to an element.
pub type Listener = Arc<dyn Fn(&DomEvent) + Send + Sync>;

/// Event delivered to element listeners.
#[derive(Clone)]
pub struct DomEvent {
    pub event_type: String,
    pub target: Element,
    pub detail: Value,
}

struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    style: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    listeners: Vec<(ListenerId, String, Listener)>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_node: NodeId,
    next_listener: u64,
    root: NodeId,
    head: NodeId,
    body: NodeId,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            next_node: 0,
            next_listener: 0,
            root: 0,
            head: 0,
            body: 0,
        };
        tree.root = tree.alloc("html");
        tree.head = tree.alloc("head");
        tree.body = tree.alloc("body");
        let (root, head, body) = (tree.root, tree.head, tree.body);
        tree.attach(root, head);
        tree.attach(root, body);
        tree
    }

    fn alloc(&mut self, tag: &str) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(id, Node::new(tag));
        id
    }

    fn detach(&mut self, child: NodeId) {
        let parent = self.nodes.get_mut(&child).and_then(|n| n.parent.take());
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != child);
        }
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        if parent == child || self.is_ancestor(child, parent) {
            return;
        }
        if !self.nodes.contains_key(&parent) || !self.nodes.contains_key(&child) {
            return;
        }
        self.detach(child);
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
    }

    /// Remove a node and its whole subtree from the arena.
    fn drop_subtree(&mut self, id: NodeId) {
        self.detach(id);
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children);
            }
        }
    }

    /// `true` when `ancestor` is `node` or one of its ancestors.
    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(&id)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }
}

/// The host document.
#[derive(Clone)]
pub struct Document {
    tree: Arc<Mutex<Tree>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.lock().nodes.len();
        f.debug_struct("Document").field("nodes", &nodes).finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, id: NodeId) -> Element {
        Element {
            doc: self.clone(),
            id,
        }
    }

    pub fn body(&self) -> Element {
        let id = self.lock().body;
        self.handle(id)
    }

    pub fn head(&self) -> Element {
        let id = self.lock().head;
        self.handle(id)
    }

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> Element {
        let id = self.lock().alloc(tag);
        self.handle(id)
    }

    /// First connected element whose `id` attribute equals `id`.
    pub fn get_element_by_id(&self, id: &str) -> Option<Element> {
        let root = self.lock().root;
        self.handle(root).find_by_id(id)
    }

    /// Document-wide lookup.
    pub fn query_selector(&self, selector: &str) -> Option<Element> {
        let root = self.lock().root;
        self.handle(root).query_selector(selector)
    }

    pub fn query_selector_all(&self, selector: &str) -> Vec<Element> {
        let root = self.lock().root;
        self.handle(root).query_selector_all(selector)
    }

    /// Number of live nodes, including detached ones.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    fn same(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree)
    }
}

/// Handle to one node of a [`Document`].
#[derive(Clone)]
pub struct Element {
    doc: Document,
    id: NodeId,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.doc.same(&other.doc)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("node", &self.id)
            .field("tag", &self.tag_name())
            .field("id", &self.attribute("id"))
            .finish()
    }
}

impl Element {
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// `false` once the node has been removed from the arena.
    pub fn exists(&self) -> bool {
        self.doc.lock().nodes.contains_key(&self.id)
    }

    /// `true` when the element is reachable from the document root.
    pub fn is_connected(&self) -> bool {
        let tree = self.doc.lock();
        tree.nodes.contains_key(&self.id) && tree.is_ancestor(tree.root, self.id)
    }

    pub fn tag_name(&self) -> Option<String> {
        self.doc.lock().nodes.get(&self.id).map(|n| n.tag.clone())
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.doc
            .lock()
            .nodes
            .get(&self.id)
            .and_then(|n| n.attributes.get(name).cloned())
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<String>) {
        if let Some(node) = self.doc.lock().nodes.get_mut(&self.id) {
            node.attributes.insert(name.to_string(), value.into());
        }
    }

    pub fn remove_attribute(&self, name: &str) {
        if let Some(node) = self.doc.lock().nodes.get_mut(&self.id) {
            node.attributes.remove(name);
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .map(|c| c.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn add_class(&self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let classes = match self.attribute("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{existing} {class}"),
            _ => class.to_string(),
        };
        self.set_attribute("class", classes);
    }

    pub fn style(&self, property: &str) -> Option<String> {
        self.doc
            .lock()
            .nodes
            .get(&self.id)
            .and_then(|n| n.style.get(property).cloned())
    }

    pub fn set_style(&self, property: &str, value: impl Into<String>) {
        if let Some(node) = self.doc.lock().nodes.get_mut(&self.id) {
            node.style.insert(property.to_string(), value.into());
        }
    }

    pub fn text(&self) -> String {
        self.doc
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.text.clone())
            .unwrap_or_default()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        if let Some(node) = self.doc.lock().nodes.get_mut(&self.id) {
            node.text = text.into();
        }
    }

    /// Text of this element and all descendants, depth first.
    pub fn text_content(&self) -> String {
        let tree = self.doc.lock();
        let mut parts = Vec::new();
        if let Some(node) = tree.nodes.get(&self.id) {
            parts.push(node.text.clone());
        }
        for id in tree.descendants(self.id) {
            if let Some(node) = tree.nodes.get(&id) {
                parts.push(node.text.clone());
            }
        }
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    /// Append `child`, moving it from any previous parent. Appending an
    /// element from another document, or an ancestor of `self`, is ignored.
    pub fn append_child(&self, child: &Element) {
        if !self.doc.same(&child.doc) {
            return;
        }
        self.doc.lock().attach(self.id, child.id);
    }

    pub fn children(&self) -> Vec<Element> {
        let ids = self
            .doc
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        ids.into_iter().map(|id| self.doc.handle(id)).collect()
    }

    pub fn parent(&self) -> Option<Element> {
        let parent = self.doc.lock().nodes.get(&self.id).and_then(|n| n.parent);
        parent.map(|id| self.doc.handle(id))
    }

    /// Remove this element and its subtree (listeners included).
    pub fn remove(&self) {
        self.doc.lock().drop_subtree(self.id);
    }

    /// Remove every child and the element's own text.
    pub fn clear(&self) {
        let mut tree = self.doc.lock();
        let children = tree
            .nodes
            .get(&self.id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in children {
            tree.drop_subtree(child);
        }
        if let Some(node) = tree.nodes.get_mut(&self.id) {
            node.text.clear();
        }
    }

    /// `true` when `other` is this element or one of its descendants.
    pub fn contains(&self, other: &Element) -> bool {
        self.doc.same(&other.doc) && self.doc.lock().is_ancestor(self.id, other.id)
    }

    pub fn add_event_listener(&self, event_type: &str, listener: Listener) -> Option<ListenerId> {
        let mut tree = self.doc.lock();
        if !tree.nodes.contains_key(&self.id) {
            return None;
        }
        let id = ListenerId(tree.next_listener);
        tree.next_listener += 1;
        tree.nodes
            .get_mut(&self.id)?
            .listeners
            .push((id, event_type.to_string(), listener));
        Some(id)
    }

    pub fn remove_event_listener(&self, listener: ListenerId) -> bool {
        let mut tree = self.doc.lock();
        let Some(node) = tree.nodes.get_mut(&self.id) else {
            return false;
        };
        let before = node.listeners.len();
        node.listeners.retain(|(id, _, _)| *id != listener);
        node.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.doc
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.listeners.len())
            .unwrap_or(0)
    }

    /// Invoke this element's listeners for `event_type`. Returns how many ran.
    pub fn dispatch(&self, event_type: &str, detail: Value) -> usize {
        let listeners: Vec<Listener> = self
            .doc
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| {
                n.listeners
                    .iter()
                    .filter(|(_, t, _)| t == event_type)
                    .map(|(_, _, l)| Arc::clone(l))
                    .collect()
            })
            .unwrap_or_default();
        let event = DomEvent {
            event_type: event_type.to_string(),
            target: self.clone(),
            detail,
        };
        for listener in &listeners {
            listener(&event);
        }
        listeners.len()
    }

    /// Convenience for `dispatch("click", Null)`.
    pub fn click(&self) -> usize {
        self.dispatch("click", Value::Null)
    }

    /// First descendant whose `id` attribute is exactly `id`. No selector
    /// parsing, so ids containing `.` or `:` are found too.
    pub fn find_by_id(&self, id: &str) -> Option<Element> {
        let tree = self.doc.lock();
        let found = tree.descendants(self.id).into_iter().find(|node| {
            tree.nodes
                .get(node)
                .and_then(|n| n.attributes.get("id"))
                .is_some_and(|value| value == id)
        });
        drop(tree);
        found.map(|node| self.doc.handle(node))
    }

    /// First descendant matching `selector`.
    pub fn query_selector(&self, selector: &str) -> Option<Element> {
        self.query_selector_all(selector).into_iter().next()
    }

    /// All descendants matching `selector`, in document order.
    pub fn query_selector_all(&self, selector: &str) -> Vec<Element> {
        let Some(parsed) = Selector::parse(selector) else {
            return Vec::new();
        };
        let tree = self.doc.lock();
        let matches: Vec<NodeId> = tree
            .descendants(self.id)
            .into_iter()
            .filter(|id| tree.nodes.get(id).is_some_and(|n| parsed.matches(n)))
            .collect();
        drop(tree);
        matches.into_iter().map(|id| self.doc.handle(id)).collect()
    }
}

#[derive(Debug, Default, PartialEq)]
struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Selector {
    fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() || input.contains(char::is_whitespace) && !input.contains('[') {
            return None;
        }
        let mut selector = Selector::default();
        let mut chars = input.chars().peekable();

        let ident = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
            let mut out = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    out.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            out
        };

        if chars.peek().is_some_and(|c| c.is_alphabetic()) {
            selector.tag = Some(ident(&mut chars).to_ascii_lowercase());
        } else if chars.peek() == Some(&'*') {
            chars.next();
        }

        while let Some(c) = chars.next() {
            match c {
                '#' => {
                    let name = ident(&mut chars);
                    if name.is_empty() {
                        return None;
                    }
                    selector.id = Some(name);
                }
                '.' => {
                    let name = ident(&mut chars);
                    if name.is_empty() {
                        return None;
                    }
                    selector.classes.push(name);
                }
                '[' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return None;
                    }
                    let (name, value) = match body.split_once('=') {
                        Some((name, value)) => {
                            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                            (name.trim().to_string(), Some(value.to_string()))
                        }
                        None => (body.trim().to_string(), None),
                    };
                    if name.is_empty() {
                        return None;
                    }
                    selector.attributes.push((name, value));
                }
                _ => return None,
            }
        }
        Some(selector)
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if &node.tag != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.attributes.get("id") != Some(id) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let classes: Vec<&str> = node
                .attributes
                .get("class")
                .map(|c| c.split_whitespace().collect())
                .unwrap_or_default();
            if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }
        self.attributes.iter().all(|(name, value)| match value {
            Some(v) => node.attributes.get(name) == Some(v),
            None => node.attributes.contains_key(name),
        })
    }
}
