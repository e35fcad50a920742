//! Tree and element data model.
//!
//! A [`Tree`] is a flat arena of elements keyed by [`ElementKey`] plus the
//! key of the root element. Every element sits behind an `Arc` so that a
//! new tree produced by the apply engine shares every untouched element
//! with its predecessor; `Arc::ptr_eq` is the O(1) "did this element
//! change" test for renderers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Globally unique, immutable element identifier.
pub type ElementKey = String;

/// Element arena, ordered by key for deterministic iteration and output.
pub type ElementMap = BTreeMap<ElementKey, Arc<Element>>;

/// Element type given to stubs synthesized for not-yet-arrived keys.
pub const PLACEHOLDER_TYPE: &str = "__placeholder__";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Provenance attached to every element touched by a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Set once at first materialization, never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_placeholder: bool,
}

impl ElementMeta {
    /// Meta for an element first materialized by `turn_id`.
    pub fn created(turn_id: Option<&str>) -> Self {
        let now = now_millis();
        Self {
            turn_id: turn_id.map(str::to_string),
            created_turn_id: turn_id.map(str::to_string),
            last_modified_turn_id: turn_id.map(str::to_string),
            created_at: Some(now),
            last_modified_at: Some(now),
            is_placeholder: false,
        }
    }

    /// Record a modification by `turn_id`, keeping creation provenance.
    pub fn touch(&mut self, turn_id: &str) {
        self.turn_id = Some(turn_id.to_string());
        self.last_modified_turn_id = Some(turn_id.to_string());
        self.last_modified_at = Some(now_millis());
        if self.created_turn_id.is_none() {
            self.created_turn_id = Some(turn_id.to_string());
        }
        if self.created_at.is_none() {
            self.created_at = self.last_modified_at;
        }
    }
}

/// One UI element description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(default)]
    pub key: ElementKey,
    #[serde(rename = "type", default)]
    pub element_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    /// Authoritative ownership edges.
    #[serde(default)]
    pub children: Vec<ElementKey>,
    /// Best-effort back-reference; never consulted for ownership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<ElementKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ElementMeta>,
}

impl Element {
    pub fn new(key: impl Into<ElementKey>, element_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            element_type: element_type.into(),
            props: Map::new(),
            children: Vec::new(),
            parent_key: None,
            layout: None,
            meta: None,
        }
    }

    pub fn with_prop(mut self, name: impl Into<String>, value: Value) -> Self {
        self.props.insert(name.into(), value);
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ElementKey>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_placeholder(&self) -> bool {
        self.element_type == PLACEHOLDER_TYPE
            || self.meta.as_ref().is_some_and(|m| m.is_placeholder)
    }

    pub fn created_turn_id(&self) -> Option<&str> {
        self.meta.as_ref()?.created_turn_id.as_deref()
    }

    pub fn last_modified_turn_id(&self) -> Option<&str> {
        self.meta.as_ref()?.last_modified_turn_id.as_deref()
    }
}

/// The synchronized element tree.
///
/// Cloning is O(1): the element map is reference counted. Trees are never
/// mutated in place; the apply engine returns new trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    #[serde(default)]
    pub root: ElementKey,
    #[serde(default)]
    elements: Arc<ElementMap>,
}

impl Tree {
    /// The empty tree `{ root: "", elements: {} }`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from owned elements, keyed by their `key` field.
    pub fn from_elements<I>(root: impl Into<ElementKey>, elements: I) -> Self
    where
        I: IntoIterator<Item = Element>,
    {
        let map = elements
            .into_iter()
            .map(|e| (e.key.clone(), Arc::new(e)))
            .collect();
        Self {
            root: root.into(),
            elements: Arc::new(map),
        }
    }

    pub(crate) fn from_parts(root: ElementKey, elements: ElementMap) -> Self {
        Self {
            root,
            elements: Arc::new(elements),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Element>> {
        self.elements.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.elements.contains_key(key)
    }

    pub fn elements(&self) -> &ElementMap {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.elements.is_empty()
    }

    /// Root is set and resolves to a real (non-placeholder) element.
    pub fn is_ready(&self) -> bool {
        !self.root.is_empty()
            && self
                .elements
                .get(&self.root)
                .is_some_and(|e| !e.is_placeholder())
    }

    /// Same root and the very same element map allocation.
    pub fn ptr_eq(a: &Tree, b: &Tree) -> bool {
        a.root == b.root && Arc::ptr_eq(&a.elements, &b.elements)
    }

    /// Whether `key` refers to the same element allocation in both trees.
    pub fn shares_element(a: &Tree, b: &Tree, key: &str) -> bool {
        match (a.elements.get(key), b.elements.get(key)) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Keys of every element reachable from the root, depth first.
    pub fn reachable_keys(&self) -> Vec<ElementKey> {
        let mut seen = std::collections::BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(key) = stack.pop() {
            if key.is_empty() || !seen.insert(key.clone()) {
                continue;
            }
            if let Some(element) = self.elements.get(&key) {
                stack.extend(element.children.iter().rev().cloned());
            }
            order.push(key);
        }
        order
    }
}
