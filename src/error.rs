//! Error types for the `stillframe` crate.
//!
//! This module defines [`StillframeError`], the unified error type returned by
//! all fallible operations in the crate. Expected "no result" outcomes (a
//! decoder that produced no frame, a probe that found no duration) are not
//! errors; they surface as `Option` or `0.0` values instead. The variants here
//! are reserved for conditions the caller has to act on.

use std::{io::Error as IoError, path::PathBuf, time::Duration};

use image::ImageError;
use serde_json::Error as JsonError;
use thiserror::Error;

/// The unified error type for all `stillframe` operations.
///
/// Variants carry enough context to diagnose the problem without needing
/// additional logging at the call site.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StillframeError {
    /// The external program could not be launched (missing binary,
    /// permission denied).
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        /// Program that was passed to the process runner.
        program: String,
        /// Underlying launch failure.
        #[source]
        source: IoError,
    },

    /// The external program exceeded its wall-clock bound and was terminated.
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program that was passed to the process runner.
        program: String,
        /// The effective (clamped) timeout.
        timeout: Duration,
    },

    /// An I/O error occurred while reading or writing local files.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// An error from the `image` crate while rendering derivatives.
    #[error("Image processing error: {0}")]
    Image(#[from] ImageError),

    /// Persisted state or a configuration file could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    /// The storage abstraction rejected a read or write.
    #[error("Storage error at {path}: {reason}")]
    Storage {
        /// Storage path involved in the failed operation.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// The persistence layer is unavailable or rejected a write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No media record exists for the identifier.
    #[error("Unknown media item: {0}")]
    UnknownMedia(String),

    /// The media item is not a video the decoder can sample.
    #[error("Media item {media_id} has unsupported type {mime_type}")]
    UnsupportedMedia {
        /// Media identifier.
        media_id: String,
        /// The MIME type recorded on the asset.
        mime_type: String,
    },

    /// No job record exists for the identifier.
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Every position of the fallback ladder failed to produce a frame.
    #[error("No usable frame could be extracted from {path}")]
    NoFrame {
        /// Local path of the source video.
        path: PathBuf,
    },

    /// A job with this identifier already exists.
    #[error("Job {0} already exists")]
    JobExists(String),

    /// The job is still in progress and cannot be discarded.
    #[error("Job {job_id} is still {status}")]
    JobActive {
        /// Job identifier.
        job_id: String,
        /// Human-readable current status.
        status: String,
    },

    /// A dispatched job failed on every permitted attempt.
    #[error("Job {job_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Job identifier.
        job_id: String,
        /// Final value of the retry counter.
        attempts: u32,
        /// Message of the last send failure.
        last_error: String,
    },

    /// The job is already in a terminal state and cannot be sent again.
    #[error("Job {job_id} is already {status}")]
    JobTerminal {
        /// Job identifier.
        job_id: String,
        /// Human-readable terminal status.
        status: String,
    },

    /// The operation was cancelled via a [`CancellationToken`](crate::CancellationToken)
    /// or a persisted stop request.
    #[error("Operation cancelled")]
    Cancelled,

    /// A configuration value is out of its permitted range.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl StillframeError {
    /// Returns `true` for failures of shared infrastructure (storage,
    /// persistence, local I/O) as opposed to failures of a single media item.
    ///
    /// A batch aborts on structural failures so that the dispatch strategy can
    /// retry it; every other error counts as one failed item.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StillframeError::Storage { .. }
                | StillframeError::Persistence(_)
                | StillframeError::Json(_)
                | StillframeError::Io(_)
        )
    }
}
