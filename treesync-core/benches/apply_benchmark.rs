use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use treesync_core::{apply, apply_batch, Element, Patch, Tree};

fn wide_tree(n: usize) -> Tree {
    let children: Vec<String> = (0..n).map(|i| format!("item-{i}")).collect();
    let mut elements = vec![Element::new("root", "List").with_children(children.clone())];
    elements.extend(
        children
            .iter()
            .map(|k| Element::new(k.as_str(), "Text").with_prop("text", json!(k))),
    );
    Tree::from_elements("root", elements)
}

fn bench_single_prop_apply(c: &mut Criterion) {
    let tree = wide_tree(1_000);
    let patch = Patch::set("/elements/item-500/props/text", json!("changed"));

    c.bench_function("apply_prop_1k_elements", |b| {
        b.iter(|| black_box(apply(black_box(&tree), black_box(&patch), Some("turn-1"))))
    });
}

fn bench_streamed_batch(c: &mut Criterion) {
    let tree = wide_tree(1_000);
    let patches: Vec<Patch> = (0..100)
        .flat_map(|i| {
            [
                Patch::add(
                    format!("/elements/new-{i}"),
                    json!({"type": "Card", "children": [format!("new-{i}-body")]}),
                ),
                Patch::set(format!("/elements/new-{i}/props/title"), json!(i)),
                Patch::add("/elements/root/children/-", json!(format!("new-{i}"))),
            ]
        })
        .collect();

    c.bench_function("apply_batch_300_patches", |b| {
        b.iter(|| black_box(apply_batch(black_box(&tree), black_box(&patches), Some("turn-1"))))
    });
}

fn bench_noop_batch(c: &mut Criterion) {
    let tree = wide_tree(1_000);
    c.bench_function("apply_batch_empty", |b| {
        b.iter(|| black_box(apply_batch(black_box(&tree), &[], None)))
    });
}

criterion_group!(benches, bench_single_prop_apply, bench_streamed_batch, bench_noop_batch);
criterion_main!(benches);
