//! # treesync-core — keyed UI tree and its patch engine
//!
//! Pure, synchronous data layer of the streaming tree synchronizer. A
//! backend streams JSON-Pointer addressed patches; this crate folds them
//! into an immutable, structurally shared element tree.
//!
//! ## Architecture
//!
//! ```text
//!  patches ──► OrderedBatch ──► Draft (copy-on-write) ──► Tree
//!              root → element      │
//!              → prop → other      ├── apply     (one patch)
//!                                  └── integrity (placeholders,
//!                                                 pruning, repair)
//! ```
//!
//! ## Modules
//!
//! - [`tree`] — `Tree`, `Element`, provenance `ElementMeta`
//! - [`patch`] — patch vocabulary and path classification
//! - [`pointer`] — RFC 6901 JSON Pointer helpers
//! - [`apply`] — structural-sharing apply engine
//! - [`integrity`] — placeholder stubs and graph-integrity operations
//! - [`batch`] — dependency-ordered batch application

pub mod apply;
pub mod batch;
pub mod error;
pub mod integrity;
pub mod patch;
pub mod pointer;
pub mod tree;

pub use apply::{apply, try_apply};
pub use batch::{apply_batch, OrderedBatch};
pub use error::{ApplyError, PointerError};
pub use integrity::{
    dangling_children, ensure_children, placeholder, prune_subtree, recompute_parent_hints, repair,
};
pub use patch::{Bucket, Patch, PatchOp, PatchTarget};
pub use tree::{Element, ElementKey, ElementMap, ElementMeta, Tree, PLACEHOLDER_TYPE};
