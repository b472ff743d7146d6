//! Event fan-out to UI sinks
//!
//! Each subscriber gets its own unbounded channel so a slow consumer never
//! blocks a generation worker. Subscribers that hang up are pruned on the
//! next emit.

use crate::generate::ThumbnailSize;
use crate::Thumbnail;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};

/// Outcome of a thumbnail generation task
#[derive(Debug, Clone)]
pub enum CacheEvent {
    ThumbnailReady { path: PathBuf, thumbnail: Thumbnail },
    ThumbnailError { path: PathBuf, message: String },
}

impl CacheEvent {
    /// Source path the event refers to
    pub fn path(&self) -> &PathBuf {
        match self {
            CacheEvent::ThumbnailReady { path, .. } | CacheEvent::ThumbnailError { path, .. } => {
                path
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CacheEvent::ThumbnailReady { .. })
    }
}

/// An image discovered while loading a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub size: ThumbnailSize,
    pub priority: bool,
}

impl ImageDescriptor {
    pub fn new(path: impl Into<PathBuf>, size: ThumbnailSize) -> Self {
        Self {
            path: path.into(),
            size,
            priority: false,
        }
    }
}

/// Directory load lifecycle
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// A slice of the listing, emitted before its thumbnails are requested
    BatchReady(Vec<ImageDescriptor>),
    /// Items handed to the cache so far, out of the directory total
    Progress { loaded: usize, total: usize },
    /// Item already resident in memory; no generation was queued for it
    ThumbnailCached { path: PathBuf, thumbnail: Thumbnail },
    /// The load was superseded or cancelled before queueing everything
    Cancelled { loaded: usize, total: usize },
    Error(String),
}

/// Multi-subscriber broadcast over `std::sync::mpsc`
pub struct EventBus<E> {
    subscribers: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
