//! Structural-sharing apply engine.
//!
//! `apply(tree, patch, turn)` never mutates its input. When the patch
//! changes anything, the result carries a fresh element map; every element
//! the patch did not touch is the same `Arc` as in the input. A patch that
//! changes nothing (malformed, or a no-op `ensure`) returns the input tree
//! itself, so `Tree::ptr_eq` doubles as a change test.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ApplyError, PointerError};
use crate::integrity;
use crate::patch::{Patch, PatchOp, PatchTarget};
use crate::pointer;
use crate::tree::{Element, ElementKey, ElementMap, ElementMeta, Tree, PLACEHOLDER_TYPE};

/// Copy-on-write view over a tree, shared by single applies and batches.
///
/// The element map is cloned lazily on the first write, so a run of
/// no-op patches costs nothing.
pub(crate) struct Draft<'a> {
    base: &'a Tree,
    root: Option<ElementKey>,
    elements: Option<ElementMap>,
}

impl<'a> Draft<'a> {
    pub(crate) fn new(base: &'a Tree) -> Self {
        Self {
            base,
            root: None,
            elements: None,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Arc<Element>> {
        match &self.elements {
            Some(map) => map.get(key),
            None => self.base.get(key),
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn insert(&mut self, element: Element) {
        let key = element.key.clone();
        self.elements_mut().insert(key, Arc::new(element));
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Arc<Element>> {
        if !self.contains(key) {
            return None;
        }
        self.elements_mut().remove(key)
    }

    /// First element (by key order) listing `child` among its children.
    pub(crate) fn parent_of(&self, child: &str) -> Option<ElementKey> {
        let map = self.elements.as_ref().unwrap_or_else(|| self.base.elements());
        map.iter()
            .find(|(_, e)| e.children.iter().any(|c| c == child))
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn set_root(&mut self, root: ElementKey) {
        if self.current_root() != root {
            self.root = Some(root);
        }
    }

    pub(crate) fn current_root(&self) -> &str {
        self.root.as_deref().unwrap_or(&self.base.root)
    }

    fn elements_mut(&mut self) -> &mut ElementMap {
        let base = self.base;
        self.elements
            .get_or_insert_with(|| base.elements().clone())
    }

    pub(crate) fn finish(self) -> Tree {
        if self.root.is_none() && self.elements.is_none() {
            return self.base.clone();
        }
        let root = self.root.unwrap_or_else(|| self.base.root.clone());
        let elements = match self.elements {
            Some(map) => map,
            None => self.base.elements().clone(),
        };
        Tree::from_parts(root, elements)
    }
}

/// Incoming whole-element value. Every field is optional so that omitted
/// fields can inherit from the element already at the key.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementDraft {
    #[serde(rename = "type")]
    element_type: Option<String>,
    props: Option<Map<String, Value>>,
    children: Option<Vec<ElementKey>>,
    parent_key: Option<ElementKey>,
    layout: Option<Value>,
    #[serde(rename = "_meta")]
    meta: Option<ElementMeta>,
}

/// Apply one patch, logging and ignoring anything malformed.
pub fn apply(tree: &Tree, patch: &Patch, turn_id: Option<&str>) -> Tree {
    let mut draft = Draft::new(tree);
    if let Err(e) = apply_to_draft(&mut draft, patch, turn_id) {
        log::warn!("Skipping patch {} {}: {e}", patch.op.as_str(), truncate(&patch.path));
        return tree.clone();
    }
    draft.finish()
}

/// Apply one patch, reporting why a patch could not be applied.
pub fn try_apply(tree: &Tree, patch: &Patch, turn_id: Option<&str>) -> Result<Tree, ApplyError> {
    let mut draft = Draft::new(tree);
    apply_to_draft(&mut draft, patch, turn_id)?;
    Ok(draft.finish())
}

pub(crate) fn apply_to_draft(
    draft: &mut Draft<'_>,
    patch: &Patch,
    turn_id: Option<&str>,
) -> Result<(), ApplyError> {
    match patch.parse_target()? {
        PatchTarget::Root => apply_root(draft, patch),
        PatchTarget::Element(key) => apply_element(draft, patch, key, turn_id),
        PatchTarget::Property { key, path } => apply_property(draft, patch, key, &path, turn_id),
        PatchTarget::Other => Err(ApplyError::UnknownTarget(patch.path.clone())),
    }
}

fn required_value<'p>(patch: &'p Patch) -> Result<&'p Value, ApplyError> {
    patch.value.as_ref().ok_or_else(|| ApplyError::MissingValue {
        op: patch.op.as_str(),
        path: patch.path.clone(),
    })
}

fn apply_root(draft: &mut Draft<'_>, patch: &Patch) -> Result<(), ApplyError> {
    match patch.op {
        PatchOp::Remove => draft.set_root(String::new()),
        PatchOp::Ensure if !draft.current_root().is_empty() => {}
        _ => {
            let root = match required_value(patch)? {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => {
                    return Err(ApplyError::InvalidElement {
                        key: "root".into(),
                        reason: format!("root must be a string, got {other}"),
                    })
                }
            };
            draft.set_root(root);
        }
    }
    Ok(())
}

fn apply_element(
    draft: &mut Draft<'_>,
    patch: &Patch,
    key: ElementKey,
    turn_id: Option<&str>,
) -> Result<(), ApplyError> {
    if patch.op == PatchOp::Remove {
        // Descendants stay; pruning is integrity::prune_subtree's job.
        let Some(removed) = draft.remove(&key) else {
            return Ok(());
        };
        // A parent still listing the key gets a stub back in its place.
        if let Some(parent) = draft.parent_of(&key) {
            log::debug!("Removed {key} is still a child of {parent}; leaving a placeholder");
            let mut stub = integrity::placeholder(&key, Some(parent.as_str()), turn_id);
            if let Some(mut meta) = removed.meta.clone() {
                meta.is_placeholder = true;
                if let Some(turn) = turn_id {
                    meta.touch(turn);
                }
                stub.meta = Some(meta);
            }
            draft.insert(stub);
        }
        return Ok(());
    }
    if patch.op == PatchOp::Ensure && draft.contains(&key) {
        return Ok(());
    }

    let incoming: ElementDraft =
        ElementDraft::deserialize(required_value(patch)?).map_err(|e| {
            ApplyError::InvalidElement {
                key: key.clone(),
                reason: e.to_string(),
            }
        })?;
    let existing = draft.get(&key).cloned();
    let element = merge_element(existing.as_deref(), key, incoming, turn_id);

    integrity::backfill_children(draft, &element.key, &element.children, turn_id);
    draft.insert(element);
    Ok(())
}

/// Combine an incoming whole-element value with what is already at the key.
///
/// Children follow the merge law: a non-empty incoming list is appended
/// to non-empty existing children with duplicates dropped; an empty
/// incoming list leaves existing children untouched.
fn merge_element(
    existing: Option<&Element>,
    key: ElementKey,
    incoming: ElementDraft,
    turn_id: Option<&str>,
) -> Element {
    let existing_children = existing.map(|e| e.children.as_slice()).unwrap_or(&[]);
    let incoming_children = incoming.children.unwrap_or_default();
    let children = merge_children(existing_children, incoming_children);

    let element_type = incoming
        .element_type
        .filter(|t| !t.is_empty())
        .or_else(|| existing.map(|e| e.element_type.clone()))
        .unwrap_or_else(|| PLACEHOLDER_TYPE.to_string());

    // Incoming `_meta` is only trusted when no turn stamps the element.
    let mut meta = match (existing.and_then(|e| e.meta.clone()), incoming.meta) {
        (Some(meta), _) => meta,
        (None, Some(meta)) if turn_id.is_none() => meta,
        (None, _) => ElementMeta::created(turn_id),
    };
    if let Some(turn) = turn_id {
        meta.touch(turn);
    }
    meta.is_placeholder = element_type == PLACEHOLDER_TYPE;

    Element {
        key,
        element_type,
        props: incoming.props.unwrap_or_default(),
        children,
        parent_key: incoming
            .parent_key
            .or_else(|| existing.and_then(|e| e.parent_key.clone())),
        layout: incoming.layout.or_else(|| existing.and_then(|e| e.layout.clone())),
        meta: Some(meta),
    }
}

pub(crate) fn merge_children(existing: &[ElementKey], incoming: Vec<ElementKey>) -> Vec<ElementKey> {
    let mut out = existing.to_vec();
    for key in incoming {
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

fn apply_property(
    draft: &mut Draft<'_>,
    patch: &Patch,
    key: ElementKey,
    path: &[String],
    turn_id: Option<&str>,
) -> Result<(), ApplyError> {
    let Some((field, rest)) = path.split_first() else {
        return Err(ApplyError::MalformedPath(patch.path.clone()));
    };
    let field = ElementField::parse(field, &patch.path)?;

    let existing = draft.get(&key).cloned();
    if patch.op == PatchOp::Ensure && existing.is_some() {
        return Ok(());
    }
    let mut element = match existing {
        Some(element) => (*element).clone(),
        None if patch.op == PatchOp::Remove => return Err(ApplyError::MissingElement(key)),
        None => integrity::stub_for_property(&key, path, turn_id),
    };

    let value = match patch.op {
        PatchOp::Remove => None,
        _ => Some(required_value(patch)?.clone()),
    };
    let insert = patch.op == PatchOp::Add;
    match field {
        ElementField::Props => write_props(&mut element.props, rest, value, insert)?,
        ElementField::Children => write_children(&mut element, rest, value, insert)?,
        ElementField::Type => {
            element.element_type = scalar_string(&key, "type", rest, value)?
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ApplyError::InvalidElement {
                    key: key.clone(),
                    reason: "type must be a non-empty string".into(),
                })?;
        }
        ElementField::ParentKey => element.parent_key = scalar_string(&key, "parentKey", rest, value)?,
        ElementField::Layout => write_layout(&mut element.layout, rest, value, insert)?,
    }

    let mut meta = element.meta.take().unwrap_or_else(|| ElementMeta::created(turn_id));
    if let Some(turn) = turn_id {
        meta.touch(turn);
    }
    if field == ElementField::Type {
        meta.is_placeholder = element.element_type == PLACEHOLDER_TYPE;
    }
    element.meta = Some(meta);

    if field == ElementField::Children {
        integrity::backfill_children(draft, &element.key, &element.children, turn_id);
    }

    draft.insert(element);
    Ok(())
}

/// Element members a property patch may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementField {
    Props,
    Children,
    Type,
    ParentKey,
    Layout,
}

impl ElementField {
    fn parse(segment: &str, path: &str) -> Result<Self, ApplyError> {
        match segment {
            "props" => Ok(Self::Props),
            "children" => Ok(Self::Children),
            "type" => Ok(Self::Type),
            "parentKey" => Ok(Self::ParentKey),
            "layout" => Ok(Self::Layout),
            "key" => Err(ApplyError::ImmutableKey(path.to_string())),
            "_meta" => Err(ApplyError::ProtectedField(path.to_string())),
            _ => Err(ApplyError::UnknownField(path.to_string())),
        }
    }
}

/// Write into `props` at `rest`, editing the map in place.
fn write_props(
    props: &mut Map<String, Value>,
    rest: &[String],
    value: Option<Value>,
    insert: bool,
) -> Result<(), ApplyError> {
    if rest.is_empty() {
        *props = match value {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(ApplyError::InvalidValue(format!("props must be an object, got {other}"))),
        };
        return Ok(());
    }
    let mut doc = Value::Object(std::mem::take(props));
    let result = match value {
        None => pointer::remove(&mut doc, rest).map(drop),
        Some(value) => pointer::set(&mut doc, rest, value, insert),
    };
    if let Value::Object(map) = doc {
        *props = map;
    }
    result.map_err(Into::into)
}

/// Write into the child list at `rest`; every entry must stay a key.
fn write_children(
    element: &mut Element,
    rest: &[String],
    value: Option<Value>,
    insert: bool,
) -> Result<(), ApplyError> {
    let mut doc = Value::Array(element.children.iter().cloned().map(Value::String).collect());
    match value {
        None if rest.is_empty() => doc = Value::Array(Vec::new()),
        None => {
            pointer::remove(&mut doc, rest)?;
        }
        Some(value) => pointer::set(&mut doc, rest, value, insert)?,
    }
    let Value::Array(items) = doc else {
        return Err(ApplyError::InvalidValue("children must be an array".into()));
    };
    element.children = items
        .into_iter()
        .map(|item| match item {
            Value::String(child) if !child.is_empty() => Ok(child),
            other => Err(ApplyError::InvalidValue(format!("child key must be a non-empty string, got {other}"))),
        })
        .collect::<Result<_, _>>()?;
    Ok(())
}

fn write_layout(
    layout: &mut Option<Value>,
    rest: &[String],
    value: Option<Value>,
    insert: bool,
) -> Result<(), ApplyError> {
    if rest.is_empty() {
        *layout = value;
        return Ok(());
    }
    match value {
        None => {
            let doc = layout.as_mut().ok_or_else(|| PointerError::NotFound(rest[0].clone()))?;
            pointer::remove(doc, rest)?;
        }
        Some(value) => {
            let doc = layout.get_or_insert_with(|| Value::Object(Map::new()));
            pointer::set(doc, rest, value, insert)?;
        }
    }
    Ok(())
}

/// A string-valued member (`type`, `parentKey`); `None` clears it.
fn scalar_string(
    key: &str,
    name: &str,
    rest: &[String],
    value: Option<Value>,
) -> Result<Option<String>, ApplyError> {
    if let Some(segment) = rest.first() {
        return Err(PointerError::NotAContainer(segment.clone()).into());
    }
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ApplyError::InvalidElement {
            key: key.to_string(),
            reason: format!("{name} must be a string, got {other}"),
        }),
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(120) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
