//! Document access port and an in-memory document.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::DomError;

/// Opaque handle to a node owned by a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// The slice of the page DOM the lifecycle reads and mutates.
///
/// Methods take `&self`: the lifecycle runs on a single execution context and
/// implementations use interior mutability.
pub trait Document {
    fn element_by_id(&self, id: &str) -> Option<NodeId>;
    fn id_of(&self, node: NodeId) -> Option<String>;
    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;
    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError>;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn has_class(&self, node: NodeId, class: &str) -> bool;
    fn add_class(&self, node: NodeId, class: &str) -> Result<(), DomError>;
    fn remove_class(&self, node: NodeId, class: &str) -> Result<(), DomError>;
    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError>;
    fn remove_style(&self, node: NodeId, property: &str) -> Result<(), DomError>;
    /// First embedded frame (iframe) below `node`.
    fn embedded_frame(&self, node: NodeId) -> Option<NodeId>;
    /// False when the node is hidden (`hidden` attribute or `display: none`).
    fn is_displayed(&self, node: NodeId) -> bool;
    fn is_attached(&self, node: NodeId) -> bool;
    /// Detach `node` and its subtree from the document.
    fn remove(&self, node: NodeId) -> Result<(), DomError>;

    /// Nearest inclusive ancestor carrying `class`.
    fn closest(&self, node: NodeId, class: &str) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(n) = current {
            if self.has_class(n, class) {
                return Some(n);
            }
            current = self.parent(n);
        }
        None
    }
}

#[derive(Debug, Default)]
struct Element {
    tag: String,
    attributes: BTreeMap<String, String>,
    classes: BTreeSet<String>,
    styles: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A small tree-shaped document kept in memory.
#[derive(Debug)]
pub struct MemoryDocument {
    nodes: RefCell<HashMap<NodeId, Element>>,
    next_id: Cell<u64>,
    body: NodeId,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let body = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            body,
            Element {
                tag: "body".to_string(),
                ..Default::default()
            },
        );
        Self {
            nodes: RefCell::new(nodes),
            next_id: Cell::new(1),
            body,
        }
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> NodeId {
        let id = NodeId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.nodes.borrow_mut().insert(
            id,
            Element {
                tag: tag.to_ascii_lowercase(),
                ..Default::default()
            },
        );
        id
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains_key(&parent) {
            return Err(DomError::NodeNotFound(parent));
        }
        let old_parent = nodes
            .get_mut(&child)
            .ok_or(DomError::NodeNotFound(child))?
            .parent
            .replace(parent);
        if let Some(old) = old_parent.and_then(|p| nodes.get_mut(&p)) {
            old.children.retain(|c| *c != child);
        }
        if let Some(p) = nodes.get_mut(&parent) {
            p.children.push(child);
        }
        Ok(())
    }

    /// Create an element with the given tag and classes and append it to `parent`.
    pub fn append_element(
        &self,
        parent: NodeId,
        tag: &str,
        classes: &[&str],
    ) -> Result<NodeId, DomError> {
        let node = self.create_element(tag);
        for class in classes {
            self.add_class(node, class)?;
        }
        self.append_child(parent, node)?;
        Ok(node)
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        self.nodes
            .borrow()
            .get(&node)
            .and_then(|e| e.styles.get(property).cloned())
    }

    pub fn classes(&self, node: NodeId) -> Vec<String> {
        self.nodes
            .borrow()
            .get(&node)
            .map(|e| e.classes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        self.nodes.borrow().get(&node).map(|e| e.tag.clone())
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .borrow()
            .get(&node)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    fn with_element<T>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut Element) -> T,
    ) -> Result<T, DomError> {
        self.nodes
            .borrow_mut()
            .get_mut(&node)
            .map(f)
            .ok_or(DomError::NodeNotFound(node))
    }

    /// Attached nodes in document (pre-)order.
    fn attached_in_order(&self) -> Vec<NodeId> {
        let nodes = self.nodes.borrow();
        let mut out = Vec::new();
        let mut stack = vec![self.body];
        while let Some(n) = stack.pop() {
            out.push(n);
            if let Some(e) = nodes.get(&n) {
                stack.extend(e.children.iter().rev().copied());
            }
        }
        out
    }
}

impl Document for MemoryDocument {
    fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.attached_in_order()
            .into_iter()
            .find(|n| self.id_of(*n).as_deref() == Some(id))
    }

    fn id_of(&self, node: NodeId) -> Option<String> {
        self.attribute(node, "id")
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.nodes
            .borrow()
            .get(&node)
            .and_then(|e| e.attributes.get(name).cloned())
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        self.with_element(node, |e| {
            e.attributes.insert(name.to_string(), value.to_string());
        })
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.borrow().get(&node).and_then(|e| e.parent)
    }

    fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.nodes
            .borrow()
            .get(&node)
            .is_some_and(|e| e.classes.contains(class))
    }

    fn add_class(&self, node: NodeId, class: &str) -> Result<(), DomError> {
        self.with_element(node, |e| {
            e.classes.insert(class.to_string());
        })
    }

    fn remove_class(&self, node: NodeId, class: &str) -> Result<(), DomError> {
        self.with_element(node, |e| {
            e.classes.remove(class);
        })
    }

    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        self.with_element(node, |e| {
            e.styles.insert(property.to_string(), value.to_string());
        })
    }

    fn remove_style(&self, node: NodeId, property: &str) -> Result<(), DomError> {
        self.with_element(node, |e| {
            e.styles.remove(property);
        })
    }

    fn embedded_frame(&self, node: NodeId) -> Option<NodeId> {
        let nodes = self.nodes.borrow();
        let mut stack: Vec<NodeId> = nodes.get(&node)?.children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            let Some(e) = nodes.get(&n) else {
                continue;
            };
            if e.tag == "iframe" {
                return Some(n);
            }
            stack.extend(e.children.iter().rev().copied());
        }
        None
    }

    fn is_displayed(&self, node: NodeId) -> bool {
        self.nodes.borrow().get(&node).is_some_and(|e| {
            !e.attributes.contains_key("hidden")
                && e.styles.get("display").map(String::as_str) != Some("none")
        })
    }

    fn is_attached(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == self.body {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    fn remove(&self, node: NodeId) -> Result<(), DomError> {
        let mut nodes = self.nodes.borrow_mut();
        let parent = nodes
            .get_mut(&node)
            .ok_or(DomError::NodeNotFound(node))?
            .parent
            .take();
        if let Some(p) = parent.and_then(|p| nodes.get_mut(&p)) {
            p.children.retain(|c| *c != node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_lookup_ignores_detached_nodes() {
        let doc = MemoryDocument::new();
        let div = doc.append_element(doc.body(), "div", &[]).unwrap();
        doc.set_attribute(div, "id", "dfp-ad--inline1").unwrap();
        assert_eq!(doc.element_by_id("dfp-ad--inline1"), Some(div));

        doc.remove(div).unwrap();
        assert!(!doc.is_attached(div));
        assert_eq!(doc.element_by_id("dfp-ad--inline1"), None);
    }

    #[test]
    fn closest_walks_up_to_matching_ancestor() {
        let doc = MemoryDocument::new();
        let banner = doc
            .append_element(doc.body(), "div", &["top-banner-ad-container"])
            .unwrap();
        let container = doc
            .append_element(banner, "div", &["ad-slot-container"])
            .unwrap();
        let slot = doc.append_element(container, "div", &["js-ad-slot"]).unwrap();
        assert_eq!(doc.closest(slot, "ad-slot-container"), Some(container));
        assert_eq!(doc.closest(slot, "top-banner-ad-container"), Some(banner));
        assert_eq!(doc.closest(slot, "missing"), None);
    }

    #[test]
    fn embedded_frame_finds_nested_iframe_and_visibility() {
        let doc = MemoryDocument::new();
        let slot = doc.append_element(doc.body(), "div", &[]).unwrap();
        let wrapper = doc.append_element(slot, "div", &[]).unwrap();
        assert_eq!(doc.embedded_frame(slot), None);

        let frame = doc.append_element(wrapper, "IFRAME", &[]).unwrap();
        assert_eq!(doc.embedded_frame(slot), Some(frame));
        assert!(doc.is_displayed(frame));

        doc.set_style(frame, "display", "none").unwrap();
        assert!(!doc.is_displayed(frame));
    }

    #[test]
    fn mutations_on_unknown_nodes_fail() {
        let doc = MemoryDocument::new();
        assert_eq!(
            doc.add_class(NodeId(99), "x"),
            Err(DomError::NodeNotFound(NodeId(99)))
        );
        assert!(doc.remove(NodeId(99)).is_err());
    }
}
