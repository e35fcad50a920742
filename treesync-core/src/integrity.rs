//! Placeholder and graph-integrity layer.
//!
//! Guarantees that every key listed in any element's `children` resolves
//! to an entry in the arena. Keys that have not streamed in yet get a
//! placeholder stub which the apply engine later upgrades in place.

use std::collections::{BTreeMap, BTreeSet};

use crate::apply::Draft;
use crate::tree::{Element, ElementKey, ElementMeta, Tree, PLACEHOLDER_TYPE};

/// A stub for `key`, optionally hinted to belong to `parent`.
pub fn placeholder(key: &str, parent: Option<&str>, turn_id: Option<&str>) -> Element {
    let mut meta = ElementMeta::created(turn_id);
    meta.is_placeholder = true;
    Element {
        key: key.to_string(),
        element_type: PLACEHOLDER_TYPE.to_string(),
        props: Default::default(),
        children: Vec::new(),
        parent_key: parent.map(str::to_string),
        layout: None,
        meta: Some(meta),
    }
}

/// Element synthesized when a property patch targets a missing key.
///
/// Writes under `children` get an empty container stub that the pointer
/// write can append into; everything else gets a plain placeholder. Both
/// stay flagged as placeholders until a real `type` arrives.
pub(crate) fn stub_for_property(key: &str, path: &[String], turn_id: Option<&str>) -> Element {
    let stub = placeholder(key, None, turn_id);
    if path.first().map(String::as_str) == Some("children") {
        log::debug!("Synthesizing container stub for {key}");
    }
    stub
}

/// Insert placeholders for any of `children` missing from the draft.
pub(crate) fn backfill_children(
    draft: &mut Draft<'_>,
    parent: &str,
    children: &[ElementKey],
    turn_id: Option<&str>,
) {
    for child in children {
        if child.is_empty() || child == parent || draft.contains(child) {
            continue;
        }
        draft.insert(placeholder(child, Some(parent), turn_id));
    }
}

/// Backfill placeholders for any of `children` that `tree` lacks.
///
/// Returns the input unchanged when every child already exists.
pub fn ensure_children(
    tree: &Tree,
    parent: &str,
    children: &[ElementKey],
    turn_id: Option<&str>,
) -> Tree {
    if children.iter().all(|c| c.is_empty() || c == parent || tree.contains(c)) {
        return tree.clone();
    }
    let mut draft = Draft::new(tree);
    backfill_children(&mut draft, parent, children, turn_id);
    draft.finish()
}

/// `(parent, child)` pairs whose child key has no entry.
pub fn dangling_children(tree: &Tree) -> Vec<(ElementKey, ElementKey)> {
    let mut dangling = Vec::new();
    for (key, element) in tree.elements() {
        for child in &element.children {
            if !tree.contains(child) {
                dangling.push((key.clone(), child.clone()));
            }
        }
    }
    dangling
}

/// Backfill every dangling child reference with a placeholder.
///
/// Returns the input unchanged when nothing dangles.
pub fn repair(tree: &Tree, turn_id: Option<&str>) -> Tree {
    let dangling = dangling_children(tree);
    if dangling.is_empty() {
        return tree.clone();
    }
    log::warn!("Repairing {} dangling child references", dangling.len());
    let mut draft = Draft::new(tree);
    for (parent, child) in dangling {
        if !draft.contains(&child) {
            draft.insert(placeholder(&child, Some(parent.as_str()), turn_id));
        }
    }
    draft.finish()
}

/// Remove `key`, everything reachable only through it, and every edge
/// pointing at a removed key.
///
/// This is the user-facing "delete element" action. Streaming `remove`
/// patches never prune.
pub fn prune_subtree(tree: &Tree, key: &str) -> Tree {
    if !tree.contains(key) {
        return tree.clone();
    }

    // Parents per child, to spot descendants that are shared with a
    // surviving part of the tree.
    let mut parents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (parent, element) in tree.elements() {
        for child in &element.children {
            parents.entry(child.as_str()).or_default().insert(parent.as_str());
        }
    }

    let mut doomed: BTreeSet<ElementKey> = BTreeSet::new();
    doomed.insert(key.to_string());
    loop {
        let newly: Vec<ElementKey> = parents
            .iter()
            .filter(|(child, ps)| {
                !doomed.contains(**child) && ps.iter().all(|p| doomed.contains(*p))
            })
            .map(|(child, _)| child.to_string())
            .collect();
        if newly.is_empty() {
            break;
        }
        doomed.extend(newly);
    }

    let mut draft = Draft::new(tree);
    for gone in &doomed {
        draft.remove(gone);
    }
    let survivors: Vec<ElementKey> = tree
        .elements()
        .iter()
        .filter(|(k, e)| !doomed.contains(*k) && e.children.iter().any(|c| doomed.contains(c)))
        .map(|(k, _)| k.clone())
        .collect();
    for parent in survivors {
        if let Some(element) = draft.get(&parent) {
            let mut updated = (**element).clone();
            updated.children.retain(|c| !doomed.contains(c));
            draft.insert(updated);
        }
    }
    if doomed.contains(draft.current_root()) {
        draft.set_root(String::new());
    }
    log::debug!("Pruned {} elements under {key}", doomed.len());
    draft.finish()
}

/// Refresh every `parentKey` hint from the authoritative `children` edges.
///
/// When a key is listed by several parents the first parent in key order
/// wins. Elements whose hint is already correct keep their identity.
pub fn recompute_parent_hints(tree: &Tree) -> Tree {
    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for (parent, element) in tree.elements() {
        for child in &element.children {
            owner.entry(child.as_str()).or_insert(parent.as_str());
        }
    }

    let mut draft = Draft::new(tree);
    for (key, element) in tree.elements() {
        let expected = owner.get(key.as_str()).map(|p| p.to_string());
        if element.parent_key != expected {
            let mut updated = (**element).clone();
            updated.parent_key = expected;
            draft.insert(updated);
        }
    }
    draft.finish()
}
