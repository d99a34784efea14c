//! Configuration.
//!
//! [`Configuration`] holds the deployment-level settings the core consumes as
//! plain values: where the decoder lives, how long each kind of decoder call
//! may run, retry and backoff bounds, and the derivative sizes to render.
//! [`ExtractOptions`] threads per-call progress callbacks and cancellation
//! tokens through long-running operations without polluting every function
//! signature.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use stillframe::Configuration;
//!
//! let configuration = Configuration::new()
//!     .with_decoder_path("/usr/local/bin/ffmpeg")
//!     .with_frame_timeout(Duration::from_secs(5))
//!     .with_max_retries(5);
//!
//! // Or from a deployment file; missing keys keep their defaults.
//! let configuration = Configuration::from_json_file("stillframe.json")?;
//! # Ok::<(), stillframe::StillframeError>(())
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StillframeError;
use crate::process::TimeoutBounds;
use crate::progress::{CancellationToken, NoOpProgress, ProgressCallback};
use crate::thumbnail::DerivativeSize;

/// Serde helper writing a [`Duration`] as fractional seconds.
pub(crate) mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() || value < 0.0 {
            return Err(D::Error::custom(format!(
                "expected a non-negative number of seconds, got {value}"
            )));
        }
        Ok(Duration::from_secs_f64(value))
    }
}

/// Deployment-level settings for every component.
///
/// All fields have defaults; a default-constructed configuration shells out
/// to `ffmpeg` on the `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Decoder executable. Defaults to `ffmpeg`.
    pub decoder_path: PathBuf,
    /// Position used by ingestion, as a percentage of the duration.
    pub default_position_percent: f64,
    /// Number of candidate frames offered to interactive selection.
    pub selection_frame_count: u32,
    /// Timeout for generic decoder operations such as the `-version` check.
    #[serde(with = "seconds")]
    pub operation_timeout: Duration,
    /// Tightened timeout for single-frame extraction.
    #[serde(with = "seconds")]
    pub frame_timeout: Duration,
    /// Fixed timeout for duration probes.
    #[serde(with = "seconds")]
    pub probe_timeout: Duration,
    /// Range every timeout is clamped into before use.
    pub timeout_bounds: TimeoutBounds,
    /// Maximum number of failed sends before a job is marked failed.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    #[serde(with = "seconds")]
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    #[serde(with = "seconds")]
    pub max_backoff: Duration,
    /// How many times an expired job without partial progress is restarted.
    pub max_recovery_attempts: u32,
    /// Duration assumed when the probe finds none.
    #[serde(with = "seconds")]
    pub fallback_duration: Duration,
    /// Files smaller than this with a round probed duration are treated as
    /// low-confidence.
    pub low_confidence_file_size: u64,
    /// Pause between back-to-back extractions of a multi-frame call.
    #[serde(with = "seconds")]
    pub extraction_pause: Duration,
    /// Directory for scratch frames and derivatives. `None` uses the system
    /// temporary directory.
    pub scratch_dir: Option<PathBuf>,
    /// Derivative sizes rendered for every thumbnail.
    pub derivative_sizes: Vec<DerivativeSize>,
    /// JPEG quality for rendered derivatives (1-100).
    pub jpeg_quality: u8,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            decoder_path: PathBuf::from("ffmpeg"),
            default_position_percent: 10.0,
            selection_frame_count: 5,
            operation_timeout: Duration::from_secs(30),
            frame_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            timeout_bounds: TimeoutBounds::default(),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_recovery_attempts: 3,
            fallback_duration: Duration::from_secs(10),
            low_confidence_file_size: 512 * 1024,
            extraction_pause: Duration::from_millis(100),
            scratch_dir: None,
            derivative_sizes: DerivativeSize::defaults(),
            jpeg_quality: 85,
        }
    }
}

impl Configuration {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::Io`] if the file cannot be read,
    /// [`StillframeError::Json`] if it is malformed, or
    /// [`StillframeError::InvalidConfiguration`] if a value is out of range.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, StillframeError> {
        let text = fs::read_to_string(path.as_ref())?;
        let configuration: Configuration = serde_json::from_str(&text)?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::InvalidConfiguration`] describing the first
    /// offending value.
    pub fn validate(&self) -> Result<(), StillframeError> {
        if self.decoder_path.as_os_str().is_empty() {
            return Err(StillframeError::InvalidConfiguration(
                "decoder_path must not be empty".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.default_position_percent) {
            return Err(StillframeError::InvalidConfiguration(format!(
                "default_position_percent must be within 0-100, got {}",
                self.default_position_percent
            )));
        }
        if self.timeout_bounds.min.is_zero() || self.timeout_bounds.min > self.timeout_bounds.max {
            return Err(StillframeError::InvalidConfiguration(format!(
                "timeout bounds must satisfy 0 < min <= max, got {:?}..{:?}",
                self.timeout_bounds.min, self.timeout_bounds.max
            )));
        }
        if self.derivative_sizes.is_empty() {
            return Err(StillframeError::InvalidConfiguration(
                "at least one derivative size is required".to_string(),
            ));
        }
        if let Some(size) = self
            .derivative_sizes
            .iter()
            .find(|size| size.width == 0 || size.height == 0 || size.name.is_empty())
        {
            return Err(StillframeError::InvalidConfiguration(format!(
                "derivative size {:?} needs a name and non-zero dimensions",
                size.name
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(StillframeError::InvalidConfiguration(format!(
                "jpeg_quality must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    /// Directory that scratch files are created in.
    pub fn scratch_directory(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Set the decoder executable.
    #[must_use]
    pub fn with_decoder_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.decoder_path = path.into();
        self
    }

    /// Set the ingestion position, clamped to 0-100.
    #[must_use]
    pub fn with_default_position_percent(mut self, percent: f64) -> Self {
        self.default_position_percent = percent.clamp(0.0, 100.0);
        self
    }

    /// Set the number of candidates offered for interactive selection.
    #[must_use]
    pub fn with_selection_frame_count(mut self, count: u32) -> Self {
        self.selection_frame_count = count;
        self
    }

    /// Set the timeout for generic decoder operations.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the single-frame extraction timeout.
    #[must_use]
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Set the duration probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the maximum number of failed sends per job.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff base and cap.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    /// Set the restart bound for expired jobs.
    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Set the duration assumed when probing fails.
    #[must_use]
    pub fn with_fallback_duration(mut self, duration: Duration) -> Self {
        self.fallback_duration = duration;
        self
    }

    /// Set the pause between consecutive extractions.
    #[must_use]
    pub fn with_extraction_pause(mut self, pause: Duration) -> Self {
        self.extraction_pause = pause;
        self
    }

    /// Set the scratch directory.
    #[must_use]
    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.scratch_dir = Some(directory.into());
        self
    }

    /// Replace the derivative sizes.
    #[must_use]
    pub fn with_derivative_sizes(mut self, sizes: Vec<DerivativeSize>) -> Self {
        self.derivative_sizes = sizes;
        self
    }
}

/// Per-call settings for long-running operations.
///
/// Carries an optional progress callback and cancellation token. Pass a
/// reference to the `*_with_options` methods on
/// [`FrameSampler`](crate::FrameSampler) or to
/// [`BatchWorker::with_options`](crate::BatchWorker::with_options).
///
/// A default-constructed value behaves identically to the plain methods.
#[derive(Clone)]
pub struct ExtractOptions {
    /// Progress callback. Defaults to a no-op.
    pub(crate) progress: Arc<dyn ProgressCallback>,
    /// Cancellation token. `None` means never cancelled.
    pub(crate) cancellation: Option<CancellationToken>,
    /// How often to fire the progress callback (every N items).
    pub(crate) batch_size: u64,
}

impl Debug for ExtractOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ExtractOptions")
            .field("has_progress", &true)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractOptions {
    /// Create options with no progress callback, no cancellation and batch
    /// size 1.
    pub fn new() -> Self {
        Self {
            progress: Arc::new(NoOpProgress),
            cancellation: None,
            batch_size: 1,
        }
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Attach a cancellation token.
    ///
    /// The token is checked between items, never in the middle of a decoder
    /// call.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set how often the progress callback fires. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Returns `true` if cancellation has been requested.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}
