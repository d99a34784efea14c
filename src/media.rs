//! Media records.

use serde::{Deserialize, Serialize};

/// A stored video.
///
/// Everything except [`duration`](MediaAsset::duration) is fixed for the
/// asset's lifetime; the duration is filled in by the first successful probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Identifier the derivative storage paths are derived from.
    pub storage_id: String,
    /// Storage path of the source video, resolved to a local path through
    /// [`Storage::local_path`](crate::Storage::local_path) at extraction time.
    pub source: String,
    /// MIME type, e.g. `video/mp4`.
    pub mime_type: String,
    /// Cached duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl MediaAsset {
    /// Create an asset with no cached duration.
    pub fn new<S, P, M>(storage_id: S, source: P, mime_type: M) -> Self
    where
        S: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self {
            storage_id: storage_id.into(),
            source: source.into(),
            mime_type: mime_type.into(),
            duration: None,
        }
    }

    /// Returns `true` for `video/*` MIME types.
    pub fn is_video(&self) -> bool {
        self.mime_type
            .split('/')
            .next()
            .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("video"))
    }

    /// The cached duration, if a positive one has been recorded.
    pub fn known_duration(&self) -> Option<f64> {
        self.duration.filter(|seconds| seconds.is_finite() && *seconds > 0.0)
    }
}

/// What persistence stores per media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// The asset.
    pub asset: MediaAsset,
    /// Consistency flag: "every expected derivative exists".
    #[serde(default)]
    pub has_thumbnails: bool,
}

impl MediaRecord {
    /// A fresh record; the flag starts out `false`.
    pub fn new(asset: MediaAsset) -> Self {
        Self {
            asset,
            has_thumbnails: false,
        }
    }
}
