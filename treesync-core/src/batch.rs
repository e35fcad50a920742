//! Dependency-ordered batch application.
//!
//! Patches are bucketed by what they address and applied strictly in the
//! order root → element → prop → other, each bucket sorted by path. Whole
//! element patches therefore always land before property patches that
//! assume the element exists, whatever order the network delivered them
//! in. The sort is stable, so patches on the same path keep arrival order.

use crate::apply::{apply_to_draft, Draft};
use crate::patch::{Bucket, Patch};
use crate::tree::Tree;

/// Patches split into application buckets.
#[derive(Debug, Default)]
pub struct OrderedBatch<'p> {
    pub root: Vec<&'p Patch>,
    pub element: Vec<&'p Patch>,
    pub prop: Vec<&'p Patch>,
    pub other: Vec<&'p Patch>,
}

impl<'p> OrderedBatch<'p> {
    pub fn new(patches: &'p [Patch]) -> Self {
        let mut batch = Self::default();
        for patch in patches {
            match patch.bucket() {
                Bucket::Root => batch.root.push(patch),
                Bucket::Element => batch.element.push(patch),
                Bucket::Prop => batch.prop.push(patch),
                Bucket::Other => batch.other.push(patch),
            }
        }
        for bucket in [
            &mut batch.root,
            &mut batch.element,
            &mut batch.prop,
            &mut batch.other,
        ] {
            bucket.sort_by(|a, b| a.path.cmp(&b.path));
        }
        batch
    }

    /// All patches in application order.
    pub fn iter(&self) -> impl Iterator<Item = &'p Patch> + '_ {
        self.root
            .iter()
            .chain(&self.element)
            .chain(&self.prop)
            .chain(&self.other)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.root.len() + self.element.len() + self.prop.len() + self.other.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply a batch of patches in dependency order.
///
/// An empty batch, or one where every patch is a no-op, returns the input
/// tree itself. Malformed patches are logged and skipped; they never abort
/// the rest of the batch.
pub fn apply_batch(tree: &Tree, patches: &[Patch], turn_id: Option<&str>) -> Tree {
    if patches.is_empty() {
        return tree.clone();
    }
    let ordered = OrderedBatch::new(patches);
    let mut draft = Draft::new(tree);
    let mut skipped = 0usize;
    for patch in ordered.iter() {
        if let Err(e) = apply_to_draft(&mut draft, patch, turn_id) {
            skipped += 1;
            log::warn!("Skipping patch {} {}: {e}", patch.op.as_str(), patch.path);
        }
    }
    if skipped > 0 {
        log::debug!("Applied batch of {} with {skipped} skipped", patches.len());
    }
    draft.finish()
}
