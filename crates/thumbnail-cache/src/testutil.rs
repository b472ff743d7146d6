//! Shared fixtures for unit tests

use crate::generate::{ImageRenderer, RenderError, Renderer, ThumbnailSize};
use crate::ThumbnailConfig;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

pub(crate) fn test_config(root: &Path) -> ThumbnailConfig {
    ThumbnailConfig {
        cache_dir: root.join("cache"),
        ..ThumbnailConfig::default()
    }
}

/// Write a small gradient PNG and return its path
pub(crate) fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
        .save(&path)
        .expect("write test image");
    path
}

pub(crate) fn next_event<E>(rx: &Receiver<E>) -> E {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("no event within 10s")
}

pub(crate) fn no_event_within<E>(rx: &Receiver<E>, wait: Duration) -> bool {
    rx.recv_timeout(wait).is_err()
}

/// Delegates to [`ImageRenderer`], counting calls and optionally stalling
pub(crate) struct CountingRenderer {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingRenderer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for CountingRenderer {
    fn render(&self, path: &Path, target: ThumbnailSize) -> Result<DynamicImage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        ImageRenderer.render(path, target)
    }
}
