//! Directory loading with batched thumbnail requests
//!
//! A load scans a directory on a dedicated single-worker pool, slices the
//! listing into batches and feeds each batch to the cache, announcing
//! batches and progress as it goes. Starting a new load cancels the one
//! before it, so switching directories stops queueing work for the
//! abandoned one almost immediately.

use crate::cache::ThumbnailCache;
use crate::events::{EventBus, ImageDescriptor, LoadEvent};
use crate::pool::{PoolConfig, WorkerPool};
use crate::LoaderConfig;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use walkdir::WalkDir;

/// Supported image file extensions
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Cancellation handle for one directory load
#[derive(Debug, Clone)]
pub struct LoadHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl LoadHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop queueing further requests for this load
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Turns "show this directory" into batched cache requests
pub struct DirectoryLoader {
    inner: Arc<LoaderInner>,
    scanner: WorkerPool,
    next_id: AtomicU64,
}

struct LoaderInner {
    cache: Arc<ThumbnailCache>,
    events: EventBus<LoadEvent>,
    current: Mutex<Option<LoadHandle>>,
}

impl DirectoryLoader {
    pub fn new(cache: Arc<ThumbnailCache>) -> Result<Self> {
        let scanner = WorkerPool::new(PoolConfig::new("directory-loader", 1))?;
        Ok(Self {
            inner: Arc::new(LoaderInner {
                cache,
                events: EventBus::new(),
                current: Mutex::new(None),
            }),
            scanner,
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a sink for batch, progress and error events
    pub fn subscribe(&self) -> Receiver<LoadEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<ThumbnailCache> {
        &self.inner.cache
    }

    /// Start loading a directory in the background, cancelling any load
    /// still in progress.
    pub fn load(&self, directory: impl AsRef<Path>, batch_size: usize, recursive: bool) -> LoadHandle {
        let directory = directory.as_ref().to_path_buf();
        let handle = LoadHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Some(previous) = self.inner.current.lock().replace(handle.clone()) {
            tracing::debug!("Load {} superseded by load {}", previous.id, handle.id);
            previous.cancel();
        }

        tracing::debug!(
            "Load {}: {} (batch size {}, recursive: {})",
            handle.id,
            directory.display(),
            batch_size,
            recursive
        );

        let inner = Arc::clone(&self.inner);
        let token = handle.clone();
        let accepted = self.scanner.submit(
            move || inner.run(&directory, batch_size.max(1), recursive, &token),
            false,
        );
        if !accepted {
            handle.cancel();
            self.inner.finish(&handle);
            self.inner
                .events
                .emit(LoadEvent::Error("directory loader is shut down".to_string()));
        }

        handle
    }

    pub fn load_with(&self, directory: impl AsRef<Path>, config: &LoaderConfig) -> LoadHandle {
        self.load(directory, config.batch_size, config.recursive)
    }

    /// Cancel the load in progress, if any
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.current.lock().take() {
            handle.cancel();
        }
    }

    /// Whether a load has been started and not yet finished or cancelled
    pub fn is_loading(&self) -> bool {
        self.inner
            .current
            .lock()
            .as_ref()
            .map(|h| !h.is_cancelled())
            .unwrap_or(false)
    }

    /// Queue a single image ahead of everything else, e.g. the one on screen
    pub fn request_priority(&self, path: &Path) {
        self.inner.cache.request(path, None, true);
    }

    /// Cancel the current load and stop the scanner
    pub fn shutdown(&self) {
        self.cancel();
        self.scanner.shutdown();
    }
}

impl Drop for DirectoryLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LoaderInner {
    fn run(&self, directory: &Path, batch_size: usize, recursive: bool, handle: &LoadHandle) {
        self.load_directory(directory, batch_size, recursive, handle);
        self.finish(handle);
    }

    /// Forget `handle` if it is still the current load
    fn finish(&self, handle: &LoadHandle) {
        let mut current = self.current.lock();
        if current.as_ref().map(|h| h.id) == Some(handle.id) {
            *current = None;
        }
    }

    fn load_directory(&self, directory: &Path, batch_size: usize, recursive: bool, handle: &LoadHandle) {
        if handle.is_cancelled() {
            self.events.emit(LoadEvent::Cancelled { loaded: 0, total: 0 });
            return;
        }

        let images = match scan_directory(directory, recursive) {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!("Error loading directory {}: {:#}", directory.display(), e);
                self.events.emit(LoadEvent::Error(format!("{:#}", e)));
                return;
            }
        };
        if images.is_empty() {
            self.events.emit(LoadEvent::Error(format!(
                "No images found in directory: {}",
                directory.display()
            )));
            return;
        }

        let total = images.len();
        let size = self.cache.config().thumbnail_size;
        let mut loaded = 0;

        for chunk in images.chunks(batch_size) {
            if handle.is_cancelled() {
                self.cancelled(handle, loaded, total);
                return;
            }

            let batch: Vec<ImageDescriptor> = chunk
                .iter()
                .map(|path| ImageDescriptor::new(path.clone(), size))
                .collect();
            self.events.emit(LoadEvent::BatchReady(batch.clone()));

            for descriptor in batch {
                if handle.is_cancelled() {
                    self.cancelled(handle, loaded, total);
                    return;
                }
                match self.cache.cached(&descriptor.path, Some(descriptor.size)) {
                    Some(thumbnail) => self.events.emit(LoadEvent::ThumbnailCached {
                        path: descriptor.path,
                        thumbnail,
                    }),
                    None => self
                        .cache
                        .request(&descriptor.path, Some(descriptor.size), descriptor.priority),
                }
                loaded += 1;
            }

            self.events.emit(LoadEvent::Progress { loaded, total });
        }

        tracing::debug!("Load {}: queued {} images from {}", handle.id, total, directory.display());
    }

    fn cancelled(&self, handle: &LoadHandle, loaded: usize, total: usize) {
        tracing::debug!("Load {} cancelled after {}/{} images", handle.id, loaded, total);
        self.events.emit(LoadEvent::Cancelled { loaded, total });
    }
}

/// List supported images under `directory`, sorted by path
pub fn scan_directory(directory: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        bail!("Directory does not exist: {}", directory.display());
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut paths = Vec::new();

    for entry in WalkDir::new(directory).min_depth(1).max_depth(max_depth) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {}: {}", directory.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            paths.push(entry.into_path());
        }
    }

    paths.sort();
    Ok(paths)
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
