//! Behavioural properties of the apply engine and batch orderer,
//! checked over hand-built streams and every permutation of small batches.

use serde_json::json;
use treesync_core::{
    apply, apply_batch, dangling_children, repair, Element, ElementMeta, Patch, Tree,
};

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

/// Strip timestamps so trees built at different instants compare equal.
fn normalized(tree: &Tree) -> serde_json::Value {
    let mut value = serde_json::to_value(tree).unwrap();
    if let Some(elements) = value["elements"].as_object_mut() {
        for element in elements.values_mut() {
            if let Some(meta) = element.get_mut("_meta").and_then(|m| m.as_object_mut()) {
                meta.remove("createdAt");
                meta.remove("lastModifiedAt");
            }
        }
    }
    value
}

#[test]
fn test_ordering_independence_for_create_and_update() {
    let batch = vec![
        Patch::add("/elements/card", json!({"type": "Card", "props": {"title": "Draft"}})),
        Patch::set("/elements/card/props/title", json!("Final")),
        Patch::add("/elements/card/children/-", json!("body")),
        Patch::set("/root", json!("card")),
    ];

    let expected = normalized(&apply_batch(&Tree::new(), &batch, Some("turn-1")));
    for order in permutations(&batch) {
        let got = normalized(&apply_batch(&Tree::new(), &order, Some("turn-1")));
        assert_eq!(got, expected, "order {:?}", order.iter().map(|p| &p.path).collect::<Vec<_>>());
    }

    let tree = apply_batch(&Tree::new(), &batch, Some("turn-1"));
    let card = tree.get("card").unwrap();
    assert_eq!(card.props["title"], "Final");
    assert_eq!(card.children, vec!["body"]);
    assert!(tree.get("body").unwrap().is_placeholder());
}

#[test]
fn test_no_dangling_references_while_streaming() {
    let stream = vec![
        Patch::set("/root", json!("page")),
        Patch::add("/elements/page", json!({"type": "Page", "children": ["hero", "grid"]})),
        Patch::add("/elements/grid/children/-", json!("tile-1")),
        Patch::add("/elements/grid/children/-", json!("tile-2")),
        Patch::add("/elements/hero", json!({"type": "Hero", "children": ["cta"]})),
        Patch::replace("/elements/grid/children", json!(["tile-2", "tile-3"])),
        Patch::add("/elements/tile-1", json!({"type": "Tile"})),
        Patch::remove("/elements/hero"),
        Patch::add("/elements/page", json!({"type": "Page", "children": ["footer"]})),
    ];

    let mut tree = Tree::new();
    for patch in &stream {
        tree = apply(&tree, patch, Some("turn-1"));
        let dangling = dangling_children(&tree);
        assert!(dangling.is_empty(), "after {patch:?}: {dangling:?}");
    }
    assert_eq!(tree.get("page").unwrap().children, vec!["hero", "grid", "footer"]);
    assert!(tree.get("hero").unwrap().is_placeholder());
    assert!(tree.contains("cta"));
    assert!(tree.is_ready());
}

#[test]
fn test_repair_closes_hand_built_dangling_edges() {
    let broken = Tree::from_elements(
        "page",
        [
            Element::new("page", "Page").with_children(["hero", "grid"]),
            Element::new("grid", "Grid").with_children(["tile"]),
        ],
    );
    assert_eq!(dangling_children(&broken).len(), 2);

    let fixed = repair(&broken, Some("turn-1"));
    assert!(dangling_children(&fixed).is_empty());
    assert!(fixed.get("hero").unwrap().is_placeholder());
    assert_eq!(fixed.get("tile").unwrap().parent_key.as_deref(), Some("grid"));

    let streamed = apply(&fixed, &Patch::remove("/elements/grid"), Some("turn-2"));
    assert!(dangling_children(&streamed).is_empty());
    assert!(streamed.get("grid").unwrap().is_placeholder());
    assert!(streamed.contains("tile"));
    assert!(Tree::ptr_eq(&streamed, &repair(&streamed, None)));
}

#[test]
fn test_provenance_created_turn_is_stable() {
    let mut tree = apply(
        &Tree::new(),
        &Patch::add("/elements/x", json!({"type": "Text"})),
        Some("turn-1"),
    );
    let turns = ["turn-2", "turn-3", "turn-4", "turn-5"];
    for turn in turns {
        tree = apply(&tree, &Patch::set("/elements/x/props/v", json!(turn)), Some(turn));
        let x = tree.get("x").unwrap();
        assert_eq!(x.created_turn_id(), Some("turn-1"));
        assert_eq!(x.last_modified_turn_id(), Some(turn));
        assert_eq!(x.meta.as_ref().unwrap().turn_id.as_deref(), Some(turn));
    }
}

#[test]
fn test_scenario_property_update_on_existing_turn() {
    let mut main = Element::new("main-stack", "Stack");
    main.meta = Some(ElementMeta::created(Some("turn-1")));
    let tree = Tree::from_elements("main-stack", [main]);

    let next = apply(
        &tree,
        &Patch::set("/elements/main-stack/props/title", json!("Updated")),
        Some("turn-2"),
    );
    let main = next.get("main-stack").unwrap();
    assert_eq!(main.created_turn_id(), Some("turn-1"));
    assert_eq!(main.last_modified_turn_id(), Some("turn-2"));
    assert_eq!(main.props["title"], "Updated");
}

#[test]
fn test_scenario_children_merge_law() {
    let tree = Tree::from_elements("p", [Element::new("p", "Stack").with_children(["A"])]);

    let appended = apply(&tree, &Patch::add("/elements/p", json!({"children": ["B"]})), None);
    assert_eq!(appended.get("p").unwrap().children, vec!["A", "B"]);
    assert_eq!(appended.get("p").unwrap().element_type, "Stack");

    let kept = apply(&tree, &Patch::add("/elements/p", json!({"children": []})), None);
    assert_eq!(kept.get("p").unwrap().children, vec!["A"]);
}

#[test]
fn test_structural_sharing_for_unrelated_keys() {
    let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
    let tree = Tree::from_elements(
        "k0",
        keys.iter().map(|k| Element::new(k.as_str(), "Text")),
    );
    for target in &keys {
        let patches = [
            Patch::set(format!("/elements/{target}/props/x"), json!(1)),
            Patch::replace(format!("/elements/{target}"), json!({"type": "Card"})),
            Patch::remove(format!("/elements/{target}")),
        ];
        for patch in &patches {
            let next = apply(&tree, patch, Some("turn-1"));
            for other in keys.iter().filter(|k| *k != target) {
                assert!(Tree::shares_element(&tree, &next, other));
            }
        }
    }
}
