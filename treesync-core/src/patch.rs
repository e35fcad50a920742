//! Patch vocabulary and path classification.
//!
//! Paths address the tree as if it were the JSON document
//! `{ "root": ..., "elements": { key: element } }`:
//!
//! ```text
//! /root                      → PatchTarget::Root
//! /elements/{key}            → PatchTarget::Element
//! /elements/{key}/props/x/…  → PatchTarget::Property
//! anything else              → PatchTarget::Other
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApplyError;
use crate::pointer;
use crate::tree::ElementKey;

/// Edit operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Set,
    Replace,
    Remove,
    /// Create only if nothing exists at the target key.
    Ensure,
}

impl PatchOp {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Set => "set",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
            PatchOp::Ensure => "ensure",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "add" => PatchOp::Add,
            "set" => PatchOp::Set,
            "replace" => PatchOp::Replace,
            "remove" => PatchOp::Remove,
            "ensure" => PatchOp::Ensure,
            _ => return None,
        })
    }

    /// Whether the op carries a value to write.
    pub fn writes(self) -> bool {
        !matches!(self, PatchOp::Remove)
    }
}

/// A single edit against the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// What a patch path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    Root,
    Element(ElementKey),
    Property { key: ElementKey, path: Vec<String> },
    Other,
}

/// Batch ordering bucket, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Root,
    Element,
    Prop,
    Other,
}

impl Patch {
    pub fn new(op: PatchOp, path: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            op,
            path: path.into(),
            value,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Add, path, Some(value))
    }

    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Set, path, Some(value))
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Replace, path, Some(value))
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(PatchOp::Remove, path, None)
    }

    pub fn ensure(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Ensure, path, Some(value))
    }

    /// Parse the path into a target, rejecting malformed pointers and
    /// empty element keys.
    pub fn parse_target(&self) -> Result<PatchTarget, ApplyError> {
        let tokens = pointer::parse(&self.path)?;
        let mut iter = tokens.into_iter();
        match iter.next().as_deref() {
            Some("root") if iter.len() == 0 => Ok(PatchTarget::Root),
            Some("elements") => {
                let key = iter
                    .next()
                    .ok_or_else(|| ApplyError::MalformedPath(self.path.clone()))?;
                if key.is_empty() {
                    return Err(ApplyError::MalformedPath(self.path.clone()));
                }
                let rest: Vec<String> = iter.collect();
                if rest.is_empty() {
                    Ok(PatchTarget::Element(key))
                } else {
                    Ok(PatchTarget::Property { key, path: rest })
                }
            }
            _ => Ok(PatchTarget::Other),
        }
    }

    /// Lenient classification: malformed paths land in [`PatchTarget::Other`].
    pub fn target(&self) -> PatchTarget {
        self.parse_target().unwrap_or(PatchTarget::Other)
    }

    pub fn bucket(&self) -> Bucket {
        match self.target() {
            PatchTarget::Root => Bucket::Root,
            PatchTarget::Element(_) => Bucket::Element,
            PatchTarget::Property { .. } => Bucket::Prop,
            PatchTarget::Other => Bucket::Other,
        }
    }

    /// The element key this patch touches, if any.
    pub fn element_key(&self) -> Option<ElementKey> {
        match self.target() {
            PatchTarget::Element(key) | PatchTarget::Property { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Pointer to a whole element.
pub fn element_path(key: &str) -> String {
    format!("/elements/{}", pointer::escape(key))
}

/// Pointer to a property of an element.
pub fn property_path<S: AsRef<str>>(key: &str, path: &[S]) -> String {
    format!("{}{}", element_path(key), pointer::join(path))
}
