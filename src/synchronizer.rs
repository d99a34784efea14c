//! Keeping the persisted `has_thumbnails` flag honest.
//!
//! [`ThumbnailSynchronizer`] is the only writer of the consistency flag.
//! [`synchronize`](ThumbnailSynchronizer::synchronize) derives the flag from
//! what storage actually holds; [`regenerate`](ThumbnailSynchronizer::regenerate)
//! extracts a fresh frame, renders and stores every derivative, and then
//! synchronizes. A regeneration that fails part-way never touches the flag.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillframe::{
//!     Configuration, FilesystemStorage, FrameSampler, JsonStore, MediaAsset,
//!     ThumbnailSynchronizer, default_logger,
//! };
//!
//! let logger = default_logger();
//! let sampler = FrameSampler::from_configuration(Arc::new(Configuration::new()), logger.clone());
//! let synchronizer = ThumbnailSynchronizer::new(
//!     Arc::new(FilesystemStorage::new("/srv/media")),
//!     Arc::new(JsonStore::open("state.json")?),
//!     sampler,
//!     logger,
//! );
//!
//! synchronizer.register("42", MediaAsset::new("clip-42", "videos/clip-42.mp4", "video/mp4"))?;
//! if synchronizer.ingest("42") {
//!     assert!(synchronizer.synchronize("42")?);
//! }
//! # Ok::<(), stillframe::StillframeError>(())
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use log::Level;

use crate::configuration::ExtractOptions;
use crate::error::StillframeError;
use crate::logging::Logger;
use crate::media::{MediaAsset, MediaRecord};
use crate::persistence::Persistence;
use crate::sampler::{ExtractedFrame, FrameSampler};
use crate::storage::Storage;
use crate::thumbnail::ThumbnailSet;

/// Where in a video to take the thumbnail frame from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePosition {
    /// Percentage (0-100) of the duration.
    Percent(f64),
    /// Absolute timestamp in seconds, e.g. a candidate picked by a user.
    Seconds(f64),
}

/// Reconciles the consistency flag with storage and regenerates thumbnails.
#[derive(Clone)]
pub struct ThumbnailSynchronizer {
    storage: Arc<dyn Storage>,
    persistence: Arc<dyn Persistence>,
    sampler: FrameSampler,
    logger: Arc<dyn Logger>,
}

impl ThumbnailSynchronizer {
    /// Wire the synchronizer to its collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        persistence: Arc<dyn Persistence>,
        sampler: FrameSampler,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            storage,
            persistence,
            sampler,
            logger,
        }
    }

    /// The sampler used for extraction.
    pub fn sampler(&self) -> &FrameSampler {
        &self.sampler
    }

    /// The persistence layer holding media records.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// The storage derivatives are written to.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Record a media item and synchronize its flag against storage.
    ///
    /// Re-registering replaces the asset (including any cached duration).
    ///
    /// # Errors
    ///
    /// Persistence or storage failures.
    pub fn register(&self, media_id: &str, asset: MediaAsset) -> Result<bool, StillframeError> {
        self.persistence
            .save_media(media_id, &MediaRecord::new(asset))?;
        self.persistence.flush()?;
        self.logger
            .log(Level::Debug, "registered media", &[("media", media_id.to_string())]);
        self.synchronize(media_id)
    }

    /// The expected derivatives of a media item.
    ///
    /// # Errors
    ///
    /// [`StillframeError::UnknownMedia`] or persistence failures.
    pub fn thumbnail_set(&self, media_id: &str) -> Result<ThumbnailSet, StillframeError> {
        let record = self.record(media_id)?;
        Ok(self.set_for(&record.asset))
    }

    /// Set the flag to whether every expected derivative exists and is
    /// non-empty, and return it.
    ///
    /// The flag is written (and flushed) only when it changes, so repeated
    /// calls without storage changes perform no writes.
    ///
    /// # Errors
    ///
    /// [`StillframeError::UnknownMedia`], storage or persistence failures.
    pub fn synchronize(&self, media_id: &str) -> Result<bool, StillframeError> {
        let record = self.record(media_id)?;
        let validation = self.set_for(&record.asset).validate(self.storage.as_ref())?;
        let complete = validation.is_complete();

        if record.has_thumbnails == complete {
            self.logger.log(
                Level::Debug,
                "thumbnail flag already consistent",
                &[
                    ("media", media_id.to_string()),
                    ("has_thumbnails", complete.to_string()),
                ],
            );
            return Ok(complete);
        }

        self.persistence.set_has_thumbnails(media_id, complete)?;
        self.persistence.flush()?;
        self.logger.log(
            Level::Info,
            "thumbnail flag updated",
            &[
                ("media", media_id.to_string()),
                ("has_thumbnails", complete.to_string()),
                ("missing", validation.missing.join(",")),
            ],
        );
        Ok(complete)
    }

    /// Regenerate at `percent` of the duration. Returns `true` only if the
    /// thumbnails were stored and the subsequent synchronization found every
    /// derivative.
    pub fn regenerate(&self, media_id: &str, percent: f64) -> bool {
        self.regenerate_at(media_id, FramePosition::Percent(percent))
    }

    /// Regenerate at an arbitrary [`FramePosition`]; see
    /// [`regenerate`](ThumbnailSynchronizer::regenerate).
    pub fn regenerate_at(&self, media_id: &str, position: FramePosition) -> bool {
        match self.try_regenerate(media_id, position) {
            Ok(complete) => complete,
            Err(error) => {
                self.logger.log(
                    Level::Warn,
                    "thumbnail regeneration failed",
                    &[
                        ("media", media_id.to_string()),
                        ("error", error.to_string()),
                    ],
                );
                false
            }
        }
    }

    /// Regenerate at the configured default position.
    pub fn ingest(&self, media_id: &str) -> bool {
        self.regenerate(
            media_id,
            self.sampler.configuration().default_position_percent,
        )
    }

    /// Regenerate, reporting why it failed.
    ///
    /// Returns the result of the final [`synchronize`](ThumbnailSynchronizer::synchronize).
    ///
    /// # Errors
    ///
    /// - [`StillframeError::UnknownMedia`] / [`StillframeError::UnsupportedMedia`].
    /// - [`StillframeError::Spawn`] if the decoder cannot be launched.
    /// - [`StillframeError::NoFrame`] if the whole fallback ladder failed.
    /// - [`StillframeError::Image`] if the frame cannot be rendered.
    /// - Storage and persistence failures.
    ///
    /// On every error the flag is left as it was and scratch files are gone.
    pub fn try_regenerate(
        &self,
        media_id: &str,
        position: FramePosition,
    ) -> Result<bool, StillframeError> {
        let (record, source) = self.video_source(media_id)?;
        let probe = self.sampler.probe();

        let probed = match record.asset.known_duration() {
            Some(seconds) => seconds,
            None => {
                let seconds = probe.probe(&source);
                if seconds > 0.0 {
                    self.cache_duration(media_id, seconds)?;
                }
                seconds
            }
        };
        let estimate = probe.estimate_from(&source, probed);
        let timestamp = match position {
            FramePosition::Percent(percent) => estimate.timestamp_at_percent(percent),
            FramePosition::Seconds(seconds) => seconds,
        };

        let frame = self
            .sampler
            .extract_with_fallback(&source, timestamp, estimate.seconds)?
            .ok_or_else(|| StillframeError::NoFrame {
                path: source.clone(),
            })?;

        let configuration = self.sampler.configuration();
        let scratch = configuration.scratch_directory();
        std::fs::create_dir_all(&scratch)?;
        let rendered = self.set_for(&record.asset).render(
            frame.path(),
            &scratch,
            configuration.jpeg_quality,
        )?;
        for derivative in &rendered {
            self.storage.put(derivative.path(), &derivative.storage_path)?;
        }
        self.logger.log(
            Level::Info,
            "stored thumbnails",
            &[
                ("media", media_id.to_string()),
                ("timestamp", format!("{:.3}", frame.timestamp)),
                ("derivatives", rendered.len().to_string()),
            ],
        );
        drop(rendered);
        drop(frame);

        self.synchronize(media_id)
    }

    /// Extract `selection_frame_count` evenly spaced candidate frames for
    /// interactive selection.
    ///
    /// # Errors
    ///
    /// Same lookup failures as [`try_regenerate`](ThumbnailSynchronizer::try_regenerate),
    /// plus [`StillframeError::Spawn`].
    pub fn candidates(&self, media_id: &str) -> Result<Vec<ExtractedFrame>, StillframeError> {
        self.candidates_with_options(media_id, &ExtractOptions::default())
    }

    /// Like [`candidates`](ThumbnailSynchronizer::candidates) with progress
    /// and cancellation.
    ///
    /// # Errors
    ///
    /// Additionally [`StillframeError::Cancelled`].
    pub fn candidates_with_options(
        &self,
        media_id: &str,
        options: &ExtractOptions,
    ) -> Result<Vec<ExtractedFrame>, StillframeError> {
        let (_, source) = self.video_source(media_id)?;
        self.sampler.extract_frames_with_options(
            &source,
            self.sampler.configuration().selection_frame_count,
            options,
        )
    }

    fn record(&self, media_id: &str) -> Result<MediaRecord, StillframeError> {
        self.persistence
            .media(media_id)?
            .ok_or_else(|| StillframeError::UnknownMedia(media_id.to_string()))
    }

    fn set_for(&self, asset: &MediaAsset) -> ThumbnailSet {
        ThumbnailSet::new(
            &asset.storage_id,
            &self.sampler.configuration().derivative_sizes,
        )
    }

    fn video_source(&self, media_id: &str) -> Result<(MediaRecord, PathBuf), StillframeError> {
        let record = self.record(media_id)?;
        if !record.asset.is_video() {
            return Err(StillframeError::UnsupportedMedia {
                media_id: media_id.to_string(),
                mime_type: record.asset.mime_type,
            });
        }
        let source = self.storage.local_path(&record.asset.source)?;
        Ok((record, source))
    }

    fn cache_duration(&self, media_id: &str, seconds: f64) -> Result<(), StillframeError> {
        // Re-read so a concurrent flag update is not overwritten.
        let mut record = self.record(media_id)?;
        record.asset.duration = Some(seconds);
        self.persistence.save_media(media_id, &record)?;
        self.persistence.flush()
    }
}
