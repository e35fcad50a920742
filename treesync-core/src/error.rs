use thiserror::Error;

/// Errors raised while resolving or editing a JSON Pointer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PointerError {
    #[error("pointer must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("invalid escape sequence in pointer segment {0:?}")]
    InvalidEscape(String),
    #[error("path not found at segment {0:?}")]
    NotFound(String),
    #[error("array index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("segment {0:?} is not a valid array index")]
    InvalidIndex(String),
    #[error("cannot descend into a scalar at segment {0:?}")]
    NotAContainer(String),
    #[error("empty pointer cannot be removed")]
    RemoveWholeDocument,
}

/// Errors raised by [`crate::apply::try_apply`].
///
/// The streaming entry point [`crate::apply::apply`] never surfaces these;
/// it logs them and returns the input tree unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("malformed patch path {0:?}")]
    MalformedPath(String),
    #[error("patch path {0:?} does not address the tree")]
    UnknownTarget(String),
    #[error("{op} patch on {path:?} requires a value")]
    MissingValue { op: &'static str, path: String },
    #[error("invalid pointer: {0}")]
    Pointer(#[from] PointerError),
    #[error("value for element {key:?} is not a valid element: {reason}")]
    InvalidElement { key: String, reason: String },
    #[error("element {0:?} does not exist")]
    MissingElement(String),
    #[error("element key is immutable (patch on {0:?})")]
    ImmutableKey(String),
    #[error("provenance is maintained by the engine (patch on {0:?})")]
    ProtectedField(String),
    #[error("patch path {0:?} does not name an element field")]
    UnknownField(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
