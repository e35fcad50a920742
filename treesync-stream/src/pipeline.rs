//! Frame-coalesced patch pipeline.
//!
//! Incoming patch groups are queued and applied at most once per frame:
//!
//! ```text
//!  push(group) ──► queue ──► on_frame / flush ──► TreeStore::apply_patches
//!                    │              │
//!                    │              ├── non-atomic runs coalesce into one batch
//!                    │              └── atomic groups apply alone
//!                    └── ≥ max_queued_patches ──► flush now (backpressure)
//! ```
//!
//! The pipeline never holds a tree of its own. Every flush reads the
//! store's current tree, so there is no stale captured copy to go wrong.
//! A group whose application fails is logged, counted, and dropped; it is
//! never retried.

use std::any::Any;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use treesync_core::{apply_batch, try_apply, ApplyError, OrderedBatch, Patch, Tree};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("patch rejected: {0}")]
    Apply(#[from] ApplyError),
    /// Raised by host-provided [`TreeStore`] implementations.
    #[error("tree store rejected batch: {0}")]
    Store(String),
}

/// Holder of the authoritative tree.
pub trait TreeStore: Send {
    fn tree(&self) -> Tree;

    fn set_tree(&mut self, tree: Tree);

    /// Apply one batch in dependency order.
    fn apply_patches(&mut self, patches: &[Patch], turn_id: Option<&str>) -> Result<(), PipelineError> {
        let next = apply_batch(&self.tree(), patches, turn_id);
        self.set_tree(next);
        Ok(())
    }
}

/// In-memory tree store.
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    tree: Tree,
    revision: u64,
    strict: bool,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(tree: Tree) -> Self {
        Self {
            tree,
            ..Self::default()
        }
    }

    /// Reject a whole batch if any patch in it is malformed, instead of
    /// skipping the bad patches.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Bumped on every change of tree identity.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl TreeStore for MemoryTreeStore {
    fn tree(&self) -> Tree {
        self.tree.clone()
    }

    fn set_tree(&mut self, tree: Tree) {
        if !Tree::ptr_eq(&self.tree, &tree) {
            self.revision += 1;
        }
        self.tree = tree;
    }

    fn apply_patches(&mut self, patches: &[Patch], turn_id: Option<&str>) -> Result<(), PipelineError> {
        if !self.strict {
            let next = apply_batch(&self.tree, patches, turn_id);
            self.set_tree(next);
            return Ok(());
        }
        let mut next = self.tree.clone();
        for patch in OrderedBatch::new(patches).iter() {
            next = try_apply(&next, patch, turn_id)?;
        }
        self.set_tree(next);
        Ok(())
    }
}

/// Opaque token produced by [`SelectionHost::save_selection`].
pub type SavedSelection = Box<dyn Any + Send>;

/// Host-side text selection that must survive a re-render.
pub trait SelectionHost: Send {
    fn save_selection(&mut self) -> Option<SavedSelection>;

    fn restore_selection(&mut self, saved: SavedSelection);
}

/// Host without a selection to preserve.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSelection;

impl SelectionHost for NoSelection {
    fn save_selection(&mut self) -> Option<SavedSelection> {
        None
    }

    fn restore_selection(&mut self, _saved: SavedSelection) {}
}

/// Paint-callback scheduling supplied by the host.
///
/// The pipeline calls `request_frame` when work is queued and expects the
/// host to call [`PatchPipeline::on_frame`] on its next paint.
pub trait FrameScheduler: Send {
    fn request_frame(&mut self);

    fn cancel_frame(&mut self);

    /// Flush synchronously on push instead of waiting for a frame.
    fn is_immediate(&self) -> bool {
        false
    }
}

/// Scheduler for hosts that poll [`PatchPipeline::frame_pending`] on a
/// fixed tick, like the session loop does.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickScheduler;

impl FrameScheduler for TickScheduler {
    fn request_frame(&mut self) {}

    fn cancel_frame(&mut self) {}
}

/// Scheduler for headless hosts with no paint loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl FrameScheduler for ImmediateScheduler {
    fn request_frame(&mut self) {}

    fn cancel_frame(&mut self) {}

    fn is_immediate(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Queue depth that forces a synchronous flush.
    pub max_queued_patches: usize,
    pub restore_selection: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queued_patches: 500,
            restore_selection: true,
        }
    }
}

/// Counters for monitoring pipeline health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub pushed_patches: u64,
    pub flushed_batches: u64,
    pub flushed_patches: u64,
    pub backpressure_flushes: u64,
    pub failed_groups: u64,
}

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Ignored,
    Queued,
    Flushed(FlushReport),
    Backpressure(FlushReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub patches: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn applied_any(&self) -> bool {
        self.batches > self.failed
    }
}

#[derive(Debug)]
struct Group {
    patches: Vec<Patch>,
    atomic: bool,
    turn_id: Option<String>,
}

pub struct PatchPipeline {
    config: PipelineConfig,
    groups: VecDeque<Group>,
    queued: usize,
    turn_id: Option<String>,
    frame_pending: bool,
    restore_pending: Option<SavedSelection>,
    scheduler: Box<dyn FrameScheduler>,
    selection: Box<dyn SelectionHost>,
    stats: PipelineStats,
}

impl PatchPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            groups: VecDeque::new(),
            queued: 0,
            turn_id: None,
            frame_pending: false,
            restore_pending: None,
            scheduler: Box::new(TickScheduler),
            selection: Box::new(NoSelection),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn FrameScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_selection(mut self, selection: Box<dyn SelectionHost>) -> Self {
        self.selection = selection;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Turn that provenance is stamped with for subsequently pushed groups.
    pub fn set_turn(&mut self, turn_id: Option<String>) {
        self.turn_id = turn_id;
    }

    pub fn queued_patches(&self) -> usize {
        self.queued
    }

    pub fn queued_groups(&self) -> usize {
        self.groups.len()
    }

    /// Whether a frame was requested and not yet served.
    pub fn frame_pending(&self) -> bool {
        self.frame_pending
    }

    /// Queue a patch group.
    pub fn push(&mut self, store: &mut dyn TreeStore, patches: Vec<Patch>, atomic: bool) -> PushOutcome {
        if patches.is_empty() {
            return PushOutcome::Ignored;
        }
        self.stats.pushed_patches += patches.len() as u64;
        self.queued += patches.len();
        self.groups.push_back(Group {
            patches,
            atomic,
            turn_id: self.turn_id.clone(),
        });

        if self.scheduler.is_immediate() {
            return PushOutcome::Flushed(self.flush(store));
        }
        if self.queued >= self.config.max_queued_patches {
            log::debug!(
                "Backpressure: {} patches queued, flushing without waiting for a frame",
                self.queued
            );
            if self.frame_pending {
                self.scheduler.cancel_frame();
                self.frame_pending = false;
            }
            self.stats.backpressure_flushes += 1;
            return PushOutcome::Backpressure(self.flush(store));
        }
        self.request_frame();
        PushOutcome::Queued
    }

    /// Host paint callback.
    ///
    /// Restores the selection saved by the previous flush (whose result has
    /// been painted by now), then flushes whatever is queued.
    pub fn on_frame(&mut self, store: &mut dyn TreeStore) -> FlushReport {
        self.frame_pending = false;
        if let Some(saved) = self.restore_pending.take() {
            self.selection.restore_selection(saved);
        }
        if self.groups.is_empty() {
            return FlushReport::default();
        }
        self.flush(store)
    }

    /// Apply everything queued now.
    pub fn flush(&mut self, store: &mut dyn TreeStore) -> FlushReport {
        let mut report = FlushReport::default();
        if self.groups.is_empty() {
            return report;
        }
        let saved = if self.config.restore_selection {
            self.selection.save_selection()
        } else {
            None
        };

        let groups = std::mem::take(&mut self.groups);
        self.queued = 0;
        let mut run: Option<Group> = None;
        for group in groups {
            if group.atomic {
                if let Some(pending) = run.take() {
                    self.apply_group(store, pending, &mut report);
                }
                self.apply_group(store, group, &mut report);
                continue;
            }
            match run.as_mut() {
                Some(pending) if pending.turn_id == group.turn_id => {
                    pending.patches.extend(group.patches);
                }
                _ => {
                    if let Some(pending) = run.replace(group) {
                        self.apply_group(store, pending, &mut report);
                    }
                }
            }
        }
        if let Some(pending) = run {
            self.apply_group(store, pending, &mut report);
        }

        if let Some(saved) = saved {
            if self.scheduler.is_immediate() {
                self.selection.restore_selection(saved);
            } else {
                self.restore_pending = Some(saved);
                self.request_frame();
            }
        }
        report
    }

    /// Whether a saved selection is waiting for the next frame.
    pub fn restore_pending(&self) -> bool {
        self.restore_pending.is_some()
    }

    /// Drop everything queued and any scheduled frame.
    ///
    /// A selection saved by an earlier flush is handed back to the host
    /// rather than discarded.
    pub fn reset(&mut self) {
        if !self.groups.is_empty() {
            log::debug!("Discarding {} queued patches", self.queued);
        }
        self.groups.clear();
        self.queued = 0;
        if let Some(saved) = self.restore_pending.take() {
            self.selection.restore_selection(saved);
        }
        if self.frame_pending {
            self.scheduler.cancel_frame();
            self.frame_pending = false;
        }
    }

    fn request_frame(&mut self) {
        if !self.frame_pending {
            self.frame_pending = true;
            self.scheduler.request_frame();
        }
    }

    fn apply_group(&mut self, store: &mut dyn TreeStore, group: Group, report: &mut FlushReport) {
        report.batches += 1;
        report.patches += group.patches.len();
        self.stats.flushed_batches += 1;
        self.stats.flushed_patches += group.patches.len() as u64;
        if let Err(e) = store.apply_patches(&group.patches, group.turn_id.as_deref()) {
            report.failed += 1;
            self.stats.failed_groups += 1;
            log::error!(
                "Dropping {} group of {} patches: {e}",
                if group.atomic { "atomic" } else { "coalesced" },
                group.patches.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Scheduler that counts calls.
    #[derive(Clone, Default)]
    struct CountingScheduler {
        calls: Arc<Mutex<(u32, u32)>>,
    }

    impl FrameScheduler for CountingScheduler {
        fn request_frame(&mut self) {
            self.calls.lock().unwrap().0 += 1;
        }

        fn cancel_frame(&mut self) {
            self.calls.lock().unwrap().1 += 1;
        }
    }

    /// Selection that logs save/restore order.
    #[derive(Clone, Default)]
    struct RecordingSelection {
        log: Arc<Mutex<Vec<String>>>,
        next: Arc<Mutex<u32>>,
    }

    impl SelectionHost for RecordingSelection {
        fn save_selection(&mut self) -> Option<SavedSelection> {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            self.log.lock().unwrap().push(format!("save {next}"));
            Some(Box::new(*next))
        }

        fn restore_selection(&mut self, saved: SavedSelection) {
            let id = saved.downcast::<u32>().map(|b| *b).unwrap_or(0);
            self.log.lock().unwrap().push(format!("restore {id}"));
        }
    }

    fn prop(key: &str, value: i64) -> Patch {
        Patch::set(format!("/elements/{key}/props/v"), json!(value))
    }

    #[test]
    fn test_push_defers_until_frame() {
        let scheduler = CountingScheduler::default();
        let mut pipeline =
            PatchPipeline::new(PipelineConfig::default()).with_scheduler(Box::new(scheduler.clone()));
        let mut store = MemoryTreeStore::new();

        assert_eq!(pipeline.push(&mut store, vec![prop("a", 1)], false), PushOutcome::Queued);
        assert_eq!(pipeline.push(&mut store, vec![prop("b", 2)], false), PushOutcome::Queued);
        assert_eq!(pipeline.push(&mut store, Vec::new(), false), PushOutcome::Ignored);
        assert!(store.tree().is_empty());
        assert_eq!(scheduler.calls.lock().unwrap().0, 1);

        let report = pipeline.on_frame(&mut store);
        assert_eq!(report, FlushReport { batches: 1, patches: 2, failed: 0 });
        assert_eq!(store.tree().len(), 2);
        assert!(!pipeline.frame_pending());
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_atomic_groups_are_not_coalesced() {
        let mut pipeline = PatchPipeline::new(PipelineConfig::default());
        let mut store = MemoryTreeStore::new();
        pipeline.push(&mut store, vec![prop("a", 1)], false);
        pipeline.push(&mut store, vec![prop("b", 1)], false);
        pipeline.push(&mut store, vec![prop("c", 1), prop("d", 1)], true);
        pipeline.push(&mut store, vec![prop("e", 1)], false);
        pipeline.push(&mut store, vec![prop("f", 1)], true);

        let report = pipeline.flush(&mut store);
        assert_eq!(report.batches, 4);
        assert_eq!(report.patches, 6);
        assert_eq!(pipeline.stats().flushed_batches, 4);
    }

    #[test]
    fn test_failed_group_is_dropped_not_retried() {
        let mut pipeline = PatchPipeline::new(PipelineConfig::default());
        let mut store = MemoryTreeStore::new().strict();
        pipeline.push(&mut store, vec![prop("ok", 1)], false);
        pipeline.push(
            &mut store,
            vec![
                Patch::add("/elements/x", json!({"type": "Card"})),
                Patch::remove("/elements/missing/props/v"),
            ],
            true,
        );
        let report = pipeline.flush(&mut store);
        assert_eq!(report.failed, 1);
        assert!(report.applied_any());
        let tree = store.tree();
        assert!(tree.contains("ok"));
        assert!(!tree.contains("x"));

        let again = pipeline.flush(&mut store);
        assert_eq!(again, FlushReport::default());
        assert_eq!(pipeline.stats().failed_groups, 1);
    }

    #[test]
    fn test_backpressure_flushes_immediately() {
        let scheduler = CountingScheduler::default();
        let config = PipelineConfig {
            max_queued_patches: 4,
            ..PipelineConfig::default()
        };
        let mut pipeline = PatchPipeline::new(config).with_scheduler(Box::new(scheduler.clone()));
        let mut store = MemoryTreeStore::new();

        pipeline.push(&mut store, vec![prop("a", 1), prop("b", 1)], false);
        assert!(pipeline.frame_pending());
        let outcome = pipeline.push(&mut store, vec![prop("c", 1), prop("d", 1)], false);
        assert!(matches!(outcome, PushOutcome::Backpressure(r) if r.patches == 4));
        assert_eq!(store.tree().len(), 4);
        assert_eq!(pipeline.queued_patches(), 0);
        assert_eq!(pipeline.stats().backpressure_flushes, 1);
        assert_eq!(*scheduler.calls.lock().unwrap(), (1, 1));
    }

    #[test]
    fn test_selection_restored_on_following_frame() {
        let selection = RecordingSelection::default();
        let mut pipeline =
            PatchPipeline::new(PipelineConfig::default()).with_selection(Box::new(selection.clone()));
        let mut store = MemoryTreeStore::new();

        pipeline.push(&mut store, vec![prop("a", 1)], false);
        pipeline.on_frame(&mut store);
        assert_eq!(*selection.log.lock().unwrap(), vec!["save 1"]);
        assert!(pipeline.frame_pending());

        pipeline.push(&mut store, vec![prop("b", 1)], false);
        pipeline.on_frame(&mut store);
        assert_eq!(
            *selection.log.lock().unwrap(),
            vec!["save 1", "restore 1", "save 2"]
        );
        pipeline.on_frame(&mut store);
        assert_eq!(selection.log.lock().unwrap().last().unwrap(), "restore 2");
    }

    #[test]
    fn test_reset_restores_saved_selection() {
        let selection = RecordingSelection::default();
        let mut pipeline =
            PatchPipeline::new(PipelineConfig::default()).with_selection(Box::new(selection.clone()));
        let mut store = MemoryTreeStore::new();

        pipeline.push(&mut store, vec![prop("a", 1)], false);
        pipeline.flush(&mut store);
        assert!(pipeline.restore_pending());
        pipeline.reset();
        assert!(!pipeline.restore_pending());
        assert_eq!(*selection.log.lock().unwrap(), vec!["save 1", "restore 1"]);
    }

    #[test]
    fn test_immediate_scheduler_applies_on_push() {
        let mut pipeline =
            PatchPipeline::new(PipelineConfig::default()).with_scheduler(Box::new(ImmediateScheduler));
        let mut store = MemoryTreeStore::new();
        let outcome = pipeline.push(&mut store, vec![prop("a", 1)], false);
        assert!(matches!(outcome, PushOutcome::Flushed(r) if r.batches == 1));
        assert!(store.tree().contains("a"));
        assert!(!pipeline.frame_pending());
    }

    #[test]
    fn test_reset_discards_queue() {
        let scheduler = CountingScheduler::default();
        let mut pipeline =
            PatchPipeline::new(PipelineConfig::default()).with_scheduler(Box::new(scheduler.clone()));
        let mut store = MemoryTreeStore::new();
        pipeline.push(&mut store, vec![prop("a", 1)], false);
        pipeline.reset();
        assert_eq!(pipeline.queued_patches(), 0);
        assert!(!pipeline.frame_pending());
        assert_eq!(pipeline.on_frame(&mut store), FlushReport::default());
        assert!(store.tree().is_empty());
        assert_eq!(scheduler.calls.lock().unwrap().1, 1);
    }

    #[test]
    fn test_provenance_uses_turn_at_push_time() {
        let mut pipeline = PatchPipeline::new(PipelineConfig::default());
        let mut store = MemoryTreeStore::new();
        pipeline.set_turn(Some("turn-1".into()));
        pipeline.push(&mut store, vec![Patch::add("/elements/a", json!({"type": "Text"}))], false);
        pipeline.set_turn(Some("turn-2".into()));
        pipeline.push(&mut store, vec![prop("a", 2)], false);
        let report = pipeline.flush(&mut store);
        assert_eq!(report.batches, 2);
        let tree = store.tree();
        let a = tree.get("a").unwrap();
        assert_eq!(a.created_turn_id(), Some("turn-1"));
        assert_eq!(a.last_modified_turn_id(), Some("turn-2"));
    }
}
