//! Bounded concurrent thumbnail generation and caching
//!
//! This crate turns large, unordered sets of image paths into displayable
//! thumbnails for a photo browser. Thumbnails are cached in memory (LRU,
//! bounded by entry count) and on disk (one JPEG per content-derived key),
//! and generated on a fixed-size worker pool at most once per source path.
//!
//! # Features
//!
//! - **Content-derived keys**: path + size + mtime, so edited files miss naturally
//! - **Dual caching**: in-memory LRU plus a persistent disk cache that heals corrupt entries
//! - **Bounded worker pool**: priority queue, concurrency cap, panic isolation
//! - **Directory loading**: batched requests with progress and per-load cancellation
//! - **Pluggable rendering**: any [`Renderer`] can stand in for the `image` crate decoder

pub mod cache;
pub mod events;
pub mod generate;
pub mod key;
pub mod loader;
pub mod lru;
pub mod pool;

#[cfg(test)]
mod testutil;

pub use cache::{CacheStats, ThumbnailCache};
pub use events::{CacheEvent, EventBus, ImageDescriptor, LoadEvent};
pub use generate::{ImageRenderer, RenderError, Renderer, ThumbnailSize};
pub use key::CacheKey;
pub use loader::{scan_directory, DirectoryLoader, LoadHandle};
pub use lru::MemoryCache;
pub use pool::{PoolConfig, WorkerPool};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A decoded thumbnail, shared read-only between the cache and its consumers
pub type Thumbnail = Arc<image::DynamicImage>;

/// Configuration for the thumbnail cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Root directory; thumbnails live in its `thumbnails/` subdirectory
    pub cache_dir: PathBuf,
    pub thumbnail_size: ThumbnailSize,
    /// Maximum number of decoded thumbnails kept in memory
    pub memory_capacity: usize,
    /// Generation worker threads
    pub workers: usize,
    pub jpeg_quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            thumbnail_size: ThumbnailSize::default(),
            memory_capacity: 200,
            workers: 4,
            jpeg_quality: 85,
        }
    }
}

/// Configuration for directory loads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub recursive: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            recursive: false,
        }
    }
}

/// Platform cache directory for thumbnails, e.g. `~/.cache/thumbnail-cache`
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("thumbnail-cache")
}
