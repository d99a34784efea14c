//! Thumbnail derivatives.
//!
//! A [`ThumbnailSet`] is the fixed list of derivative images expected for one
//! media asset. Every derivative has a deterministic storage path derived
//! from the asset's storage identifier and the size name, so presence can be
//! checked without any other bookkeeping. Rendering scales one extracted
//! frame into every size with the `image` crate and writes JPEG scratch files
//! that are removed when dropped.

use std::io::{BufWriter, Write};
use std::path::Path;

use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use crate::error::StillframeError;
use crate::storage::Storage;

/// Prefix of every derivative storage path.
pub const THUMBNAIL_PREFIX: &str = "thumbnails";

/// How a frame is fitted into a derivative's box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Scale down to fit inside the box, preserving aspect ratio. Never
    /// upscales.
    #[default]
    Fit,
    /// Scale and centre-crop to fill the box exactly.
    Crop,
}

/// One expected derivative size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeSize {
    /// Name used in the storage path (`large`, `medium`, ...).
    pub name: String,
    /// Box width in pixels.
    pub width: u32,
    /// Box height in pixels.
    pub height: u32,
    /// Fitting strategy.
    #[serde(default)]
    pub mode: ResizeMode,
}

impl DerivativeSize {
    /// Create a derivative size.
    pub fn new<S: Into<String>>(name: S, width: u32, height: u32, mode: ResizeMode) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mode,
        }
    }

    /// The default set: `large` (480 box), `medium` (220 box) and `square`
    /// (100×100 crop).
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("large", 480, 480, ResizeMode::Fit),
            Self::new("medium", 220, 220, ResizeMode::Fit),
            Self::new("square", 100, 100, ResizeMode::Crop),
        ]
    }

    /// Scale `image` into this size's box.
    pub fn render(&self, image: &DynamicImage) -> DynamicImage {
        match self.mode {
            ResizeMode::Fit => {
                let (width, height) =
                    fit_dimensions(image.width(), image.height(), self.width, self.height);
                if (width, height) == (image.width(), image.height()) {
                    image.clone()
                } else {
                    image.resize_exact(width, height, FilterType::Triangle)
                }
            }
            ResizeMode::Crop => image.resize_to_fill(self.width, self.height, FilterType::Triangle),
        }
    }
}

/// Compute dimensions that fit within the box preserving aspect ratio,
/// without upscaling.
fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (max_width.max(1), max_height.max(1));
    }
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let new_width = ((width as f64) * scale).round() as u32;
    let new_height = ((height as f64) * scale).round() as u32;
    (new_width.clamp(1, max_width), new_height.clamp(1, max_height))
}

/// Encode a storage identifier as a single safe path segment.
///
/// Bytes outside `[A-Za-z0-9._~-]` are percent-encoded, so distinct ids
/// never share a segment. A leading dot is encoded as `%2E` so the segment
/// can never be `.` or `..`; the empty id becomes `%`.
pub fn storage_key(storage_id: &str) -> String {
    if storage_id.is_empty() {
        return "%".to_string();
    }
    let encoded = urlencoding::encode(storage_id);
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded.into_owned(),
    }
}

/// Deterministic storage path of one derivative.
///
/// # Example
///
/// ```
/// use stillframe::derivative_path;
///
/// assert_eq!(derivative_path("clip-42", "large"), "thumbnails/clip-42/large.jpg");
/// assert_eq!(
///     derivative_path("public://a b.mp4", "square"),
///     "thumbnails/public%3A%2F%2Fa%20b.mp4/square.jpg"
/// );
/// ```
pub fn derivative_path(storage_id: &str, size_name: &str) -> String {
    format!(
        "{THUMBNAIL_PREFIX}/{}/{}.jpg",
        storage_key(storage_id),
        storage_key(size_name)
    )
}

/// One expected derivative and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivative {
    /// The size this derivative is rendered at.
    pub size: DerivativeSize,
    /// Deterministic storage path.
    pub storage_path: String,
}

/// Outcome of checking a [`ThumbnailSet`] against storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetValidation {
    /// Size names whose derivative exists and is non-empty.
    pub present: Vec<String>,
    /// Size names whose derivative is missing or empty.
    pub missing: Vec<String>,
}

impl SetValidation {
    /// All-or-nothing: `true` only when no size is missing.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && !self.present.is_empty()
    }
}

/// A derivative rendered to a scratch file, not yet stored.
///
/// The scratch file is removed when this value is dropped.
#[derive(Debug)]
pub struct RenderedDerivative {
    /// Destination storage path.
    pub storage_path: String,
    file: TempPath,
}

impl RenderedDerivative {
    /// Local path of the scratch JPEG.
    pub fn path(&self) -> &Path {
        &self.file
    }
}

/// The expected derivatives of one media asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailSet {
    storage_id: String,
    derivatives: Vec<Derivative>,
}

impl ThumbnailSet {
    /// Build the set for `storage_id` with the given sizes.
    pub fn new(storage_id: &str, sizes: &[DerivativeSize]) -> Self {
        let derivatives = sizes
            .iter()
            .map(|size| Derivative {
                size: size.clone(),
                storage_path: derivative_path(storage_id, &size.name),
            })
            .collect();
        Self {
            storage_id: storage_id.to_string(),
            derivatives,
        }
    }

    /// The asset's storage identifier.
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    /// Every expected derivative, in configuration order.
    pub fn derivatives(&self) -> &[Derivative] {
        &self.derivatives
    }

    /// Check every derivative for existence and non-zero size.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; a missing file is not an error.
    pub fn validate(&self, storage: &dyn Storage) -> Result<SetValidation, StillframeError> {
        let mut validation = SetValidation::default();
        for derivative in &self.derivatives {
            let size = storage.file_size(&derivative.storage_path)?;
            if size.is_some_and(|bytes| bytes > 0) {
                validation.present.push(derivative.size.name.clone());
            } else {
                validation.missing.push(derivative.size.name.clone());
            }
        }
        Ok(validation)
    }

    /// Render every derivative of the frame at `frame_path` into scratch
    /// JPEGs inside `scratch_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::Image`] if the frame cannot be decoded or a
    /// derivative cannot be encoded, or [`StillframeError::Io`] for scratch
    /// file failures. Scratch files already written are removed.
    pub fn render(
        &self,
        frame_path: &Path,
        scratch_dir: &Path,
        quality: u8,
    ) -> Result<Vec<RenderedDerivative>, StillframeError> {
        let frame = image::open(frame_path)?;
        let mut rendered = Vec::with_capacity(self.derivatives.len());

        for derivative in &self.derivatives {
            let scaled = derivative.size.render(&frame);
            let file = tempfile::Builder::new()
                .prefix("stillframe-derivative-")
                .suffix(".jpg")
                .tempfile_in(scratch_dir)?;
            {
                let mut writer = BufWriter::new(file.as_file());
                let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
                encoder.encode_image(&scaled.to_rgb8())?;
                writer.flush()?;
            }
            rendered.push(RenderedDerivative {
                storage_path: derivative.storage_path.clone(),
                file: file.into_temp_path(),
            });
        }

        Ok(rendered)
    }
}
