//! Thumbnail rendering pipeline
//!
//! Decoding is behind the [`Renderer`] trait so the cache can be driven by
//! other decoders (or by test doubles). The default [`ImageRenderer`] uses
//! the `image` crate and performs a cheap draft reduction; the cache then
//! applies the final high-quality resize and JPEG encode defined here.

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Factor applied to the target size when asking the renderer for a draft
pub const DRAFT_SCALE: u32 = 2;

/// Floor for draft dimensions so tiny targets still get a decent source
const MIN_DRAFT_WIDTH: u32 = 400;
const MIN_DRAFT_HEIGHT: u32 = 300;

/// Bounding box for a thumbnail; images are scaled to fit inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size to request from the renderer before the final downsample
    pub fn draft(&self) -> Self {
        Self {
            width: self.width.saturating_mul(DRAFT_SCALE).max(MIN_DRAFT_WIDTH),
            height: self.height.saturating_mul(DRAFT_SCALE).max(MIN_DRAFT_HEIGHT),
        }
    }

    /// Whether an image of the given dimensions already fits
    pub fn contains(&self, width: u32, height: u32) -> bool {
        width <= self.width && height <= self.height
    }
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self::new(200, 200)
    }
}

impl std::fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for ThumbnailSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (width, height) = match s.to_lowercase().split_once('x') {
            Some((w, h)) => (w.trim().parse::<u32>(), h.trim().parse::<u32>()),
            None => {
                let side = s.trim().parse::<u32>();
                (side.clone(), side)
            }
        };
        match (width, height) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok(Self::new(w, h)),
            _ => bail!("Invalid thumbnail size: {}. Expected WIDTHxHEIGHT, e.g. 200x200", s),
        }
    }
}

/// Why a source image could not be rendered
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("source not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to decode {}: {reason}", .path.display())]
    DecodeFailed { path: PathBuf, reason: String },
    #[error("unsupported image format: {}", .0.display())]
    Unsupported(PathBuf),
}

/// Turns a source file into pixels at roughly the requested size
///
/// Implementations may return an image larger than `target`; the cache
/// performs the final resize. They must not return one smaller than the
/// source would allow, since that costs quality.
pub trait Renderer: Send + Sync {
    fn render(&self, path: &Path, target: ThumbnailSize) -> Result<DynamicImage, RenderError>;
}

/// Default renderer backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageRenderer;

impl Renderer for ImageRenderer {
    fn render(&self, path: &Path, target: ThumbnailSize) -> Result<DynamicImage, RenderError> {
        let reader = ImageReader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RenderError::NotFound(path.to_path_buf()),
                _ => RenderError::DecodeFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                },
            })?;

        if reader.format().is_none() {
            return Err(RenderError::Unsupported(path.to_path_buf()));
        }

        let img = reader.decode().map_err(|e| match e {
            ImageError::Unsupported(_) => RenderError::Unsupported(path.to_path_buf()),
            other => RenderError::DecodeFailed {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        Ok(draft_reduce(img, target))
    }
}

/// Fast, lower-quality reduction used for the draft stage
fn draft_reduce(img: DynamicImage, target: ThumbnailSize) -> DynamicImage {
    let (width, height) = img.dimensions();
    if target.contains(width, height) {
        return img;
    }
    img.thumbnail(target.width, target.height)
}

/// Resize to fit within `size` preserving aspect ratio; never upscales
pub fn resize_to_fit(img: DynamicImage, size: ThumbnailSize) -> DynamicImage {
    let (width, height) = img.dimensions();
    if size.contains(width, height) {
        return img;
    }
    img.resize(size.width, size.height, FilterType::Lanczos3)
}

/// Encode as baseline RGB JPEG at the given quality
pub fn encode_jpeg<W: Write>(img: &DynamicImage, quality: u8, writer: W) -> Result<()> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .context("Failed to encode JPEG")?;
    Ok(())
}

/// Decode a cached thumbnail from disk
pub fn load_thumbnail(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .with_context(|| format!("Failed to open thumbnail {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("Failed to decode thumbnail {}", path.display()))
}
