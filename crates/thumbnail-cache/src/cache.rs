//! Main cache manager that coordinates memory, disk and generation
//!
//! Lookups go memory first, then disk (promoting hits into memory).
//! Misses are turned into generation tasks on the worker pool, with at
//! most one task in flight per source path. Results are announced through
//! [`CacheEvent`]s rather than returned, so callers never block on a render.

use crate::events::{CacheEvent, EventBus};
use crate::generate::{encode_jpeg, load_thumbnail, resize_to_fit, ImageRenderer, Renderer, ThumbnailSize};
use crate::key::CacheKey;
use crate::lru::MemoryCache;
use crate::pool::{PoolConfig, WorkerPool};
use crate::{Thumbnail, ThumbnailConfig};
use anyhow::{Context, Result};
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Subdirectory of the cache root holding one JPEG per key
const THUMBNAIL_DIR: &str = "thumbnails";
const THUMBNAIL_EXT: &str = "jpg";
const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoryKey {
    key: CacheKey,
    size: ThumbnailSize,
}

/// Main thumbnail cache manager
pub struct ThumbnailCache {
    inner: Arc<CacheInner>,
    pool: WorkerPool,
}

struct CacheInner {
    config: ThumbnailConfig,
    thumbnail_dir: PathBuf,
    renderer: Arc<dyn Renderer>,
    memory: MemoryCache<MemoryKey, Thumbnail>,
    pending: Mutex<HashSet<PathBuf>>,
    events: EventBus<CacheEvent>,
    closed: AtomicBool,
}

/// Membership in the pending set, released when dropped
struct PendingGuard {
    inner: Arc<CacheInner>,
    path: PathBuf,
}

impl PendingGuard {
    fn acquire(inner: &Arc<CacheInner>, path: &Path) -> Option<Self> {
        if !inner.pending.lock().insert(path.to_path_buf()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.path);
    }
}

impl ThumbnailCache {
    /// Create a cache using the default `image`-crate renderer
    pub fn new(config: ThumbnailConfig) -> Result<Self> {
        Self::with_renderer(config, Arc::new(ImageRenderer))
    }

    /// Create a cache with a custom render primitive
    pub fn with_renderer(config: ThumbnailConfig, renderer: Arc<dyn Renderer>) -> Result<Self> {
        let thumbnail_dir = config.cache_dir.join(THUMBNAIL_DIR);
        fs::create_dir_all(&thumbnail_dir).with_context(|| {
            format!("Failed to create cache directory: {}", thumbnail_dir.display())
        })?;

        let pool = WorkerPool::new(PoolConfig::new("thumbnail", config.workers))?;

        tracing::debug!(
            "Thumbnail cache at {} ({} entries in memory, {} workers, size {})",
            thumbnail_dir.display(),
            config.memory_capacity,
            config.workers,
            config.thumbnail_size
        );

        let inner = Arc::new(CacheInner {
            memory: MemoryCache::new(config.memory_capacity),
            pending: Mutex::new(HashSet::new()),
            events: EventBus::new(),
            closed: AtomicBool::new(false),
            thumbnail_dir,
            renderer,
            config,
        });

        Ok(Self { inner, pool })
    }

    /// Register a sink for ready/error events
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.inner.config
    }

    pub fn thumbnail_dir(&self) -> &Path {
        &self.inner.thumbnail_dir
    }

    /// Disk location of the thumbnail for a key
    pub fn disk_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.disk_path(key)
    }

    /// Look a thumbnail up in memory, then on disk. Never generates.
    ///
    /// `size` defaults to the configured thumbnail size; other sizes are
    /// scaled from the persisted thumbnail.
    pub fn get(&self, path: &Path, size: Option<ThumbnailSize>) -> Option<Thumbnail> {
        let size = size.unwrap_or(self.inner.config.thumbnail_size);
        let key = CacheKey::derive(path)?;
        self.inner.lookup(&key, size)
    }

    /// Memory-only lookup; never touches disk
    pub fn cached(&self, path: &Path, size: Option<ThumbnailSize>) -> Option<Thumbnail> {
        let size = size.unwrap_or(self.inner.config.thumbnail_size);
        let key = CacheKey::derive(path)?;
        self.inner.memory.get(&MemoryKey { key, size })
    }

    /// Whether a thumbnail is resident in memory
    pub fn contains(&self, path: &Path, size: Option<ThumbnailSize>) -> bool {
        let size = size.unwrap_or(self.inner.config.thumbnail_size);
        CacheKey::derive(path)
            .map(|key| self.inner.memory.contains(&MemoryKey { key, size }))
            .unwrap_or(false)
    }

    /// Whether a generation task is queued or running for this path
    pub fn is_pending(&self, path: &Path) -> bool {
        self.inner.pending.lock().contains(path)
    }

    /// Ask for a thumbnail to be generated in the background.
    ///
    /// No-op when it is already in memory or already being generated. The
    /// outcome arrives later as a [`CacheEvent`].
    pub fn request(&self, path: &Path, size: Option<ThumbnailSize>, priority: bool) {
        let size = size.unwrap_or(self.inner.config.thumbnail_size);

        if let Some(key) = CacheKey::derive(path) {
            if self.inner.memory.contains(&MemoryKey { key, size }) {
                return;
            }
        }

        let Some(guard) = PendingGuard::acquire(&self.inner, path) else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let accepted = self.pool.submit(move || inner.generate(guard, size), priority);
        if !accepted {
            // The rejected closure has been dropped, releasing the pending entry
            tracing::warn!("Thumbnail request rejected, cache is shut down: {}", path.display());
            self.inner.events.emit(CacheEvent::ThumbnailError {
                path: path.to_path_buf(),
                message: "thumbnail cache is shut down".to_string(),
            });
        }
    }

    /// Stop generating, drop memory and pending state and delete every
    /// thumbnail on disk. The cache accepts no further requests.
    pub fn clear(&self) {
        tracing::debug!("Clearing thumbnail cache at {}", self.inner.thumbnail_dir.display());
        self.shutdown();

        let removed = self.inner.remove_disk_entries(|_, _| true);
        tracing::debug!("Removed {} cached thumbnails", removed.len());
    }

    /// Stop the worker pool and release memory without touching disk
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.pool.shutdown();
        self.inner.memory.clear();
        self.inner.pending.lock().clear();
    }

    /// Delete disk entries last written more than `max_age` ago.
    ///
    /// Returns how many entries were removed.
    pub fn prune(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        fs::read_dir(&self.inner.thumbnail_dir).with_context(|| {
            format!("Failed to read cache directory: {}", self.inner.thumbnail_dir.display())
        })?;

        let removed = self.inner.remove_disk_entries(|path, metadata| {
            if !is_thumbnail_file(path) {
                return false;
            }
            metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > max_age)
                .unwrap_or(false)
        });

        if !removed.is_empty() {
            let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();
            for memory_key in self.inner.memory.keys() {
                if removed.contains(memory_key.key.as_str()) {
                    self.inner.memory.remove(&memory_key);
                }
            }
        }

        tracing::debug!("Pruned {} thumbnails older than {:?}", removed.len(), max_age);
        Ok(removed.len())
    }

    /// Hold the pending set, stalling every `request` until released
    #[cfg(test)]
    pub(crate) fn hold_pending(&self) -> parking_lot::MutexGuard<'_, HashSet<PathBuf>> {
        self.inner.pending.lock()
    }

    /// Get cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        let (disk_entries, disk_bytes) = self.inner.disk_usage();
        CacheStats {
            memory_entries: self.inner.memory.len(),
            memory_capacity: self.inner.memory.capacity(),
            pending: self.inner.pending.lock().len(),
            queued: self.pool.queued(),
            disk_entries,
            disk_bytes,
        }
    }
}

impl Drop for ThumbnailCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheInner {
    fn disk_path(&self, key: &CacheKey) -> PathBuf {
        self.thumbnail_dir.join(key.file_name(THUMBNAIL_EXT))
    }

    fn lookup(&self, key: &CacheKey, size: ThumbnailSize) -> Option<Thumbnail> {
        let memory_key = MemoryKey { key: key.clone(), size };
        if let Some(thumbnail) = self.memory.get(&memory_key) {
            return Some(thumbnail);
        }

        let disk_path = self.disk_path(key);
        if !self.valid_disk_entry(&disk_path) {
            return None;
        }
        match load_thumbnail(&disk_path) {
            Ok(img) => Some(self.promote(key, size, img)),
            Err(e) => {
                tracing::warn!("Invalid thumbnail for key {}, removing: {:#}", key, e);
                remove_quietly(&disk_path);
                None
            }
        }
    }

    /// A usable disk entry exists and is non-empty. Empty files are deleted.
    fn valid_disk_entry(&self, disk_path: &Path) -> bool {
        match fs::metadata(disk_path) {
            Ok(metadata) if metadata.len() > 0 => true,
            Ok(_) => {
                tracing::warn!("Removing empty cache entry {}", disk_path.display());
                remove_quietly(disk_path);
                false
            }
            Err(_) => false,
        }
    }

    /// Put a decoded thumbnail in memory, scaled to the requested size
    fn promote(&self, key: &CacheKey, size: ThumbnailSize, img: DynamicImage) -> Thumbnail {
        let img = if size == self.config.thumbnail_size {
            img
        } else {
            resize_to_fit(img, size)
        };
        let thumbnail: Thumbnail = Arc::new(img);

        if !self.closed.load(Ordering::Acquire) {
            self.memory.insert(
                MemoryKey {
                    key: key.clone(),
                    size,
                },
                Arc::clone(&thumbnail),
            );
        }
        thumbnail
    }

    /// Body of a generation task
    fn generate(&self, guard: PendingGuard, size: ThumbnailSize) {
        let path = guard.path.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.produce(&path, size)));
        drop(guard);

        let event = match outcome {
            Ok(Ok(thumbnail)) => CacheEvent::ThumbnailReady { path, thumbnail },
            Ok(Err(e)) => {
                tracing::warn!("Failed to generate thumbnail for {}: {:#}", path.display(), e);
                CacheEvent::ThumbnailError {
                    path,
                    message: format!("{:#}", e),
                }
            }
            Err(_) => {
                tracing::error!("Thumbnail generation panicked for {}", path.display());
                CacheEvent::ThumbnailError {
                    path,
                    message: "thumbnail generation panicked".to_string(),
                }
            }
        };
        self.events.emit(event);
    }

    fn produce(&self, path: &Path, size: ThumbnailSize) -> Result<Thumbnail> {
        let key = CacheKey::derive(path)
            .with_context(|| format!("Source not found or unreadable: {}", path.display()))?;
        let disk_path = self.disk_path(&key);

        if self.valid_disk_entry(&disk_path) {
            match load_thumbnail(&disk_path) {
                Ok(img) => return Ok(self.promote(&key, size, img)),
                Err(e) => {
                    tracing::warn!("Regenerating unreadable cache entry {}: {:#}", disk_path.display(), e);
                    remove_quietly(&disk_path);
                }
            }
        }

        self.render_to_disk(path, &disk_path)?;

        let img = load_thumbnail(&disk_path).map_err(|e| {
            remove_quietly(&disk_path);
            e
        })?;
        Ok(self.promote(&key, size, img))
    }

    /// Render, downsample and atomically persist the thumbnail for `source`
    fn render_to_disk(&self, source: &Path, disk_path: &Path) -> Result<()> {
        let target = self.config.thumbnail_size;
        let draft = self
            .renderer
            .render(source, target.draft())
            .with_context(|| format!("Failed to render {}", source.display()))?;
        let thumbnail = resize_to_fit(draft, target);

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{}", THUMBNAIL_EXT))
            .tempfile_in(&self.thumbnail_dir)
            .with_context(|| {
                format!("Failed to create temp file in {}", self.thumbnail_dir.display())
            })?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            encode_jpeg(&thumbnail, self.config.jpeg_quality, &mut writer)?;
            writer.flush().context("Failed to flush thumbnail")?;
        }
        temp.persist(disk_path)
            .with_context(|| format!("Failed to write cache file: {}", disk_path.display()))?;
        Ok(())
    }

    /// Remove thumbnail files matching `predicate`, returning their keys
    fn remove_disk_entries(&self, predicate: impl Fn(&Path, &fs::Metadata) -> bool) -> Vec<String> {
        let entries = match fs::read_dir(&self.thumbnail_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to read cache directory {}: {}", self.thumbnail_dir.display(), e);
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() || !predicate(&path, &metadata) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        removed.push(stem.to_string());
                    }
                }
                Err(e) => tracing::error!("Error deleting cache file {}: {}", path.display(), e),
            }
        }
        removed
    }

    fn disk_usage(&self) -> (usize, u64) {
        let Ok(entries) = fs::read_dir(&self.thumbnail_dir) else {
            return (0, 0);
        };
        entries
            .flatten()
            .filter(|entry| is_thumbnail_file(&entry.path()))
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .fold((0, 0), |(count, bytes), metadata| (count + 1, bytes + metadata.len()))
    }
}

fn is_thumbnail_file(path: &Path) -> bool {
    let is_temp = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(TEMP_PREFIX))
        .unwrap_or(true);
    !is_temp && path.extension().and_then(|e| e.to_str()) == Some(THUMBNAIL_EXT)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!("Error deleting cache file {}: {}", path.display(), e);
        }
    }
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub pending: usize,
    pub queued: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

impl CacheStats {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_capacity == 0 {
            0.0
        } else {
            (self.memory_entries as f64 / self.memory_capacity as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::RenderError;
    use crate::testutil::{next_event, no_event_within, test_config, write_image, CountingRenderer};
    use image::GenericImageView;
    use std::thread;
    use tempfile::tempdir;

    fn counting_cache(root: &Path, delay: Duration) -> (ThumbnailCache, Arc<CountingRenderer>) {
        let renderer = Arc::new(CountingRenderer::new(delay));
        let cache = ThumbnailCache::with_renderer(test_config(root), renderer.clone()).unwrap();
        (cache, renderer)
    }

    #[test]
    fn test_cache_creation() -> Result<()> {
        let temp_dir = tempdir()?;
        let cache = ThumbnailCache::new(test_config(temp_dir.path()))?;

        assert!(cache.thumbnail_dir().exists());
        assert!(cache.thumbnail_dir().ends_with("thumbnails"));

        let stats = cache.cache_stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 0);
        assert_eq!(stats.memory_usage_percent(), 0.0);
        Ok(())
    }

    #[test]
    fn test_request_generates_and_persists() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 800, 600);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);

        match next_event(&events) {
            CacheEvent::ThumbnailReady { path, thumbnail } => {
                assert_eq!(path, source);
                assert_eq!(thumbnail.dimensions(), (200, 150));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(renderer.calls(), 1);

        let key = CacheKey::derive(&source).unwrap();
        let disk_path = cache.disk_path(&key);
        assert!(fs::metadata(&disk_path)?.len() > 0);
        assert_eq!(disk_path.extension().unwrap(), "jpg");

        let stats = cache.cache_stats();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.disk_entries, 1);
        assert!(stats.disk_bytes > 0);
        assert!(!cache.is_pending(&source));
        Ok(())
    }

    #[test]
    fn test_at_most_one_generation_in_flight() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::from_millis(150));
        let cache = Arc::new(cache);
        let events = cache.subscribe();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let source = source.clone();
                thread::spawn(move || cache.request(&source, None, i % 3 == 0))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(next_event(&events).is_ready());
        assert!(no_event_within(&events, Duration::from_millis(300)));
        assert_eq!(renderer.calls(), 1);
        assert!(!cache.is_pending(&source));
        Ok(())
    }

    #[test]
    fn test_cached_thumbnail_needs_no_new_work() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 300, 300);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());

        for _ in 0..5 {
            assert!(cache.get(&source, None).is_some());
            cache.request(&source, None, true);
        }

        assert!(no_event_within(&events, Duration::from_millis(200)));
        assert_eq!(renderer.calls(), 1);
        assert_eq!(cache.cache_stats().queued, 0);
        Ok(())
    }

    #[test]
    fn test_get_never_generates() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);

        assert!(cache.get(&source, None).is_none());
        assert!(cache.get(&temp_dir.path().join("missing.png"), None).is_none());
        assert!(!cache.is_pending(&source));
        assert_eq!(renderer.calls(), 0);
        Ok(())
    }

    #[test]
    fn test_cached_lookup_skips_disk() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);

        {
            let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
            let events = cache.subscribe();
            cache.request(&source, None, false);
            assert!(next_event(&events).is_ready());
            assert!(cache.cached(&source, None).is_some());
        }

        let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
        assert!(cache.cached(&source, None).is_none());
        assert_eq!(cache.cache_stats().memory_entries, 0);
        assert_eq!(cache.cache_stats().disk_entries, 1);
        Ok(())
    }

    #[test]
    fn test_get_promotes_from_disk() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 400, 200);

        {
            let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
            let events = cache.subscribe();
            cache.request(&source, None, false);
            assert!(next_event(&events).is_ready());
        }

        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        assert!(!cache.contains(&source, None));

        let thumbnail = cache.get(&source, None).expect("disk hit");
        assert_eq!(thumbnail.dimensions(), (200, 100));
        assert!(cache.contains(&source, None));
        assert_eq!(renderer.calls(), 0);

        let small = cache.get(&source, Some(ThumbnailSize::new(50, 50))).expect("scaled hit");
        assert_eq!(small.dimensions(), (50, 25));
        assert_eq!(cache.cache_stats().memory_entries, 2);
        Ok(())
    }

    #[test]
    fn test_existing_disk_entry_skips_render() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 120, 120);

        {
            let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
            let events = cache.subscribe();
            cache.request(&source, None, false);
            assert!(next_event(&events).is_ready());
        }

        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();
        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());
        assert_eq!(renderer.calls(), 0);
        Ok(())
    }

    #[test]
    fn test_corrupt_entry_self_heals() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 100, 100);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        let disk_path = cache.disk_path(&CacheKey::derive(&source).unwrap());
        fs::write(&disk_path, b"")?;

        assert!(cache.get(&source, None).is_none());
        assert!(!disk_path.exists());

        fs::write(&disk_path, b"")?;
        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());
        assert!(fs::metadata(&disk_path)?.len() > 0);
        assert_eq!(renderer.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_undecodable_entry_is_regenerated() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 100, 100);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        let disk_path = cache.disk_path(&CacheKey::derive(&source).unwrap());
        fs::write(&disk_path, b"not a jpeg at all")?;

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());
        assert_eq!(renderer.calls(), 1);
        assert!(load_thumbnail(&disk_path).is_ok());
        Ok(())
    }

    #[test]
    fn test_bad_source_reports_error_and_retries() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = temp_dir.path().join("broken.jpg");
        fs::write(&source, b"garbage bytes")?;
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        match next_event(&events) {
            CacheEvent::ThumbnailError { path, message } => {
                assert_eq!(path, source);
                assert!(message.contains("broken.jpg"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!cache.is_pending(&source));
        assert_eq!(cache.cache_stats().disk_entries, 0);

        // Failures are not remembered; the next request tries again
        cache.request(&source, None, false);
        assert!(!next_event(&events).is_ready());
        assert_eq!(renderer.calls(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_source_reports_error() -> Result<()> {
        let temp_dir = tempdir()?;
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();
        let missing = temp_dir.path().join("gone.png");

        cache.request(&missing, None, false);
        let event = next_event(&events);
        assert_eq!(event.path(), &missing);
        assert!(!event.is_ready());
        assert_eq!(renderer.calls(), 0);
        Ok(())
    }

    #[test]
    fn test_panicking_renderer_reports_error() -> Result<()> {
        struct PanickingRenderer;
        impl Renderer for PanickingRenderer {
            fn render(&self, _: &Path, _: ThumbnailSize) -> Result<DynamicImage, RenderError> {
                panic!("decoder bug");
            }
        }

        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 32, 32);
        let cache = ThumbnailCache::with_renderer(test_config(temp_dir.path()), Arc::new(PanickingRenderer))?;
        let events = cache.subscribe();

        cache.request(&source, None, false);
        match next_event(&events) {
            CacheEvent::ThumbnailError { message, .. } => assert!(message.contains("panicked")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!cache.is_pending(&source));
        Ok(())
    }

    #[test]
    fn test_memory_bound_keeps_most_recent() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut config = test_config(temp_dir.path());
        config.memory_capacity = 3;
        let cache = ThumbnailCache::new(config)?;
        let events = cache.subscribe();

        let sources: Vec<_> = (0..5)
            .map(|i| write_image(temp_dir.path(), &format!("img{}.png", i), 40, 40))
            .collect();
        for source in &sources {
            cache.request(source, None, false);
            assert!(next_event(&events).is_ready());
        }

        let stats = cache.cache_stats();
        assert_eq!(stats.memory_entries, 3);
        assert_eq!(stats.disk_entries, 5);
        assert!(!cache.contains(&sources[0], None));
        assert!(!cache.contains(&sources[1], None));
        for source in &sources[2..] {
            assert!(cache.contains(source, None));
        }
        Ok(())
    }

    #[test]
    fn test_modified_source_gets_new_entry() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());

        thread::sleep(Duration::from_millis(10));
        write_image(temp_dir.path(), "photo.png", 128, 96);
        assert!(cache.get(&source, None).is_none());

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());
        assert_eq!(renderer.calls(), 2);
        assert_eq!(cache.cache_stats().disk_entries, 2);
        Ok(())
    }

    #[test]
    fn test_clear_removes_everything_and_stops() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, renderer) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());

        cache.clear();
        let stats = cache.cache_stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 0);
        assert_eq!(stats.pending, 0);
        assert!(cache.get(&source, None).is_none());

        cache.request(&source, None, false);
        assert!(!next_event(&events).is_ready());
        assert!(!cache.is_pending(&source));
        assert_eq!(renderer.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_prune_by_age() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());

        assert_eq!(cache.prune(Duration::from_secs(3600))?, 0);
        assert!(cache.contains(&source, None));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.prune(Duration::ZERO)?, 1);
        assert!(!cache.contains(&source, None));
        assert_eq!(cache.cache_stats().disk_entries, 0);
        Ok(())
    }

    #[test]
    fn test_prune_leaves_in_progress_writes() -> Result<()> {
        let temp_dir = tempdir()?;
        let source = write_image(temp_dir.path(), "photo.png", 64, 64);
        let (cache, _) = counting_cache(temp_dir.path(), Duration::ZERO);
        let events = cache.subscribe();

        cache.request(&source, None, false);
        assert!(next_event(&events).is_ready());
        let partial = cache.thumbnail_dir().join(format!("{}partial.{}", TEMP_PREFIX, THUMBNAIL_EXT));
        fs::write(&partial, b"half written")?;

        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.prune(Duration::ZERO)?, 1);
        assert!(partial.exists());
        Ok(())
    }
}
