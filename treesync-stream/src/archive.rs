//! Compressed conversation archive.
//!
//! Layout:
//! ```text
//! ┌───────┬──────────────────────────────────────────┐
//! │ TSA1  │ LZ4 block (size-prefixed) of JSON:        │
//! │ magic │ { savedAt, turns: [...], tree: {...} }    │
//! └───────┴──────────────────────────────────────────┘
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use treesync_core::tree::now_millis;
use treesync_core::Tree;

use crate::turns::TurnHistory;

pub const ARCHIVE_MAGIC: &[u8; 4] = b"TSA1";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("archive decompression failed: {0}")]
    Decompression(String),
    #[error("not a turn archive")]
    BadMagic,
}

/// Turn history plus the live tree, as saved on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnArchive {
    pub saved_at: u64,
    pub turns: TurnHistory,
    pub tree: Tree,
}

impl TurnArchive {
    pub fn new(turns: TurnHistory, tree: Tree) -> Self {
        Self {
            saved_at: now_millis(),
            turns,
            tree,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ArchiveError> {
        let json = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(ARCHIVE_MAGIC.len() + json.len() / 4);
        out.extend_from_slice(ARCHIVE_MAGIC);
        out.extend(lz4_flex::compress_prepend_size(&json));
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let body = bytes
            .strip_prefix(ARCHIVE_MAGIC.as_slice())
            .ok_or(ArchiveError::BadMagic)?;
        let json = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| ArchiveError::Decompression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let bytes = self.encode()?;
        std::fs::write(path.as_ref(), &bytes)?;
        log::debug!(
            "Wrote archive with {} turns ({} bytes) to {}",
            self.turns.len(),
            bytes.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }
}
