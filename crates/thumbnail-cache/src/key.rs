//! Content-derived cache keys
//!
//! A key is a digest of a file's absolute path, byte length and modification
//! time. Editing a file changes its size or mtime and therefore its key, so
//! stale thumbnails are simply never looked up again.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Hex-encoded digest naming a source file's cached thumbnail
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a source file.
    ///
    /// Returns `None` when the file does not exist or cannot be stat'd;
    /// callers treat that as "do not cache".
    pub fn derive(file_path: &Path) -> Option<Self> {
        match Self::try_derive(file_path) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!("No cache key for {}: {}", file_path.display(), e);
                None
            }
        }
    }

    fn try_derive(file_path: &Path) -> Result<Self> {
        let metadata = fs::metadata(file_path)?;
        let absolute_path = file_path.canonicalize()?;
        let file_size = metadata.len();
        let modified_time = metadata.modified()?.duration_since(UNIX_EPOCH)?.as_nanos();

        let mut hasher = Sha256::new();
        hasher.update(absolute_path.to_string_lossy().as_bytes());
        hasher.update(file_size.to_le_bytes());
        hasher.update(modified_time.to_le_bytes());

        let result = hasher.finalize();
        // First 16 bytes (32 hex chars) keep file names short
        Ok(Self(hex::encode(&result[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the disk entry for this key
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.0, extension)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
