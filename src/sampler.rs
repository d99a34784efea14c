//! Frame sampling through the external decoder.
//!
//! [`FrameSampler`] turns a video path and a timestamp into a JPEG still. The
//! single-frame primitive never treats "no frame" as an error: corrupt input,
//! unseekable codecs and timestamps past the readable range are routine, so
//! they surface as `Ok(None)`. Only a decoder that cannot be launched at all
//! is an `Err`.
//!
//! On top of the primitive sit the fallback ladder (requested position, then
//! a quarter of the duration, then one second in) and multi-frame sampling at
//! evenly spaced positions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillframe::{Configuration, FrameSampler, default_logger};
//!
//! let sampler = FrameSampler::from_configuration(Arc::new(Configuration::new()), default_logger());
//!
//! if let Some(frame) = sampler.extract_frame("input.mp4", 12.5, None)? {
//!     let kept = frame.keep()?;
//!     println!("frame at {}", kept.display());
//! }
//!
//! // Five candidates; the scratch files are removed when `frames` is dropped.
//! let frames = sampler.extract_frames("input.mp4", 5)?;
//! for frame in &frames {
//!     println!("{:.2}s -> {}", frame.timestamp, frame.path().display());
//! }
//! # Ok::<(), stillframe::StillframeError>(())
//! ```

use std::ffi::OsString;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::Level;
use tempfile::TempPath;

use crate::configuration::{Configuration, ExtractOptions};
use crate::error::StillframeError;
use crate::logging::Logger;
use crate::probe::DurationProbe;
use crate::process::ProcessRunner;
use crate::progress::{OperationType, ProgressTracker};

/// Smallest number of positions a multi-frame call samples.
pub const MIN_FRAME_COUNT: u32 = 1;

/// Largest number of positions a multi-frame call samples.
pub const MAX_FRAME_COUNT: u32 = 20;

/// Second rung of the fallback ladder, as a fraction of the duration.
pub const FALLBACK_FRACTION: f64 = 0.25;

/// Last rung of the fallback ladder, in seconds from the start.
pub const NEAR_START_OFFSET: f64 = 1.0;

/// Targets are kept at least this far before the end of a known duration.
const END_MARGIN: f64 = 0.1;

/// Rungs closer than this are considered the same position.
const SAME_POSITION: f64 = 1e-3;

/// Clamp a requested count into [`MIN_FRAME_COUNT`]..=[`MAX_FRAME_COUNT`].
pub fn clamp_frame_count(count: u32) -> u32 {
    count.clamp(MIN_FRAME_COUNT, MAX_FRAME_COUNT)
}

/// Clamp `timestamp` to be non-negative and, when `duration` is known,
/// strictly before its end.
pub fn clamp_timestamp(timestamp: f64, duration: f64) -> f64 {
    let timestamp = if timestamp.is_finite() {
        timestamp.max(0.0)
    } else {
        0.0
    };
    if duration.is_finite() && duration > 0.0 {
        timestamp.min((duration - END_MARGIN).max(0.0))
    } else {
        timestamp
    }
}

/// Evenly spaced positions strictly inside `(0, duration)`.
///
/// Position `i` (1-based) sits at `duration / (count + 1) * i`, so neither
/// the very first nor the very last instant is ever sampled. `count` is
/// clamped first; an unknown (non-positive) duration yields no positions.
///
/// # Example
///
/// ```
/// use stillframe::frame_timestamps;
///
/// assert_eq!(frame_timestamps(60.0, 5), vec![10.0, 20.0, 30.0, 40.0, 50.0]);
/// assert!(frame_timestamps(0.0, 5).is_empty());
/// ```
pub fn frame_timestamps(duration: f64, count: u32) -> Vec<f64> {
    if !(duration.is_finite() && duration > 0.0) {
        return Vec::new();
    }
    let count = clamp_frame_count(count);
    let step = duration / f64::from(count + 1);
    (1..=count).map(|index| step * f64::from(index)).collect()
}

/// Positions tried, in order, when looking for a usable frame.
///
/// The requested timestamp first, then [`FALLBACK_FRACTION`] of the
/// duration, then [`NEAR_START_OFFSET`]. Every rung is clamped and rungs
/// that collapse onto an earlier one are dropped.
pub fn fallback_ladder(timestamp: f64, duration: f64) -> Vec<f64> {
    let mut ladder: Vec<f64> = Vec::with_capacity(3);
    for candidate in [timestamp, duration * FALLBACK_FRACTION, NEAR_START_OFFSET] {
        let candidate = clamp_timestamp(candidate, duration);
        if ladder
            .iter()
            .all(|existing| (existing - candidate).abs() > SAME_POSITION)
        {
            ladder.push(candidate);
        }
    }
    ladder
}

/// One extraction to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    /// Local path of the source video.
    pub source: PathBuf,
    /// Seek target in seconds.
    pub timestamp: f64,
    /// Timeout; `None` uses [`Configuration::frame_timeout`]. Clamped by the
    /// runner either way.
    pub timeout: Option<Duration>,
    /// Where to write the frame; `None` generates a scratch file.
    pub output: Option<PathBuf>,
}

impl ExtractionRequest {
    /// Request the frame at `timestamp` (negative or non-finite values become
    /// zero).
    pub fn new<P: Into<PathBuf>>(source: P, timestamp: f64) -> Self {
        Self {
            source: source.into(),
            timestamp: clamp_timestamp(timestamp, 0.0),
            timeout: None,
            output: None,
        }
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Write to a caller-owned path instead of a scratch file.
    #[must_use]
    pub fn with_output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Keep the timestamp strictly before the end of `duration`.
    #[must_use]
    pub fn clamped_to(mut self, duration: f64) -> Self {
        self.timestamp = clamp_timestamp(self.timestamp, duration);
        self
    }
}

#[derive(Debug)]
enum FrameFile {
    /// Generated by the sampler; removed on drop.
    Scratch(TempPath),
    /// Supplied by the caller; left alone on drop.
    Owned(PathBuf),
}

impl FrameFile {
    fn path(&self) -> &Path {
        match self {
            FrameFile::Scratch(path) => path,
            FrameFile::Owned(path) => path,
        }
    }

    fn discard(self) {
        match self {
            FrameFile::Scratch(path) => {
                let _ = path.close();
            }
            FrameFile::Owned(path) => {
                if let Err(error) = fs::remove_file(&path) {
                    if error.kind() != ErrorKind::NotFound {
                        log::debug!("could not remove {}: {error}", path.display());
                    }
                }
            }
        }
    }
}

/// A successfully extracted, non-empty still image.
///
/// Frames written to a generated scratch path are deleted when the value is
/// dropped; call [`keep`](ExtractedFrame::keep) to take ownership of the file
/// instead. Frames written to a caller-supplied output path are never deleted
/// by this type.
#[derive(Debug)]
pub struct ExtractedFrame {
    file: FrameFile,
    /// Timestamp the decoder was asked to seek to, in seconds.
    pub timestamp: f64,
    /// Zero-based position within a multi-frame call.
    pub index: Option<usize>,
}

impl ExtractedFrame {
    /// Absolute path of the image.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Returns `true` if the file is a generated scratch file.
    pub fn is_scratch(&self) -> bool {
        matches!(self.file, FrameFile::Scratch(_))
    }

    /// Stop tracking the file and return its path; it will no longer be
    /// removed automatically.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::Io`] if the scratch file cannot be kept.
    pub fn keep(self) -> Result<PathBuf, StillframeError> {
        match self.file {
            FrameFile::Scratch(path) => path.keep().map_err(|error| StillframeError::Io(error.error)),
            FrameFile::Owned(path) => Ok(path),
        }
    }

    /// Delete the image now, whoever owns it.
    pub fn discard(self) {
        self.file.discard();
    }
}

/// Extracts still frames by shelling out to the decoder.
#[derive(Clone)]
pub struct FrameSampler {
    runner: ProcessRunner,
    probe: DurationProbe,
    configuration: Arc<Configuration>,
    logger: Arc<dyn Logger>,
}

impl Debug for FrameSampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("FrameSampler")
            .field("decoder", &self.configuration.decoder_path)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl FrameSampler {
    /// Assemble a sampler from already constructed parts.
    pub fn new(
        runner: ProcessRunner,
        probe: DurationProbe,
        configuration: Arc<Configuration>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            runner,
            probe,
            configuration,
            logger,
        }
    }

    /// Build the runner and probe from `configuration`, all sharing `logger`.
    pub fn from_configuration(configuration: Arc<Configuration>, logger: Arc<dyn Logger>) -> Self {
        let runner = ProcessRunner::new()
            .with_bounds(configuration.timeout_bounds)
            .with_logger(logger.clone());
        let probe = DurationProbe::new(runner.clone(), configuration.clone(), logger.clone());
        Self::new(runner, probe, configuration, logger)
    }

    /// The duration probe sharing this sampler's runner.
    pub fn probe(&self) -> &DurationProbe {
        &self.probe
    }

    /// The configuration in use.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Extract one frame at `timestamp` seconds.
    ///
    /// `timeout` defaults to [`Configuration::frame_timeout`].
    ///
    /// # Errors
    ///
    /// Only structural failures: [`StillframeError::Spawn`] if the decoder
    /// cannot be launched, [`StillframeError::Io`] if no scratch file can be
    /// created. A missing frame is `Ok(None)`.
    pub fn extract_frame<P: AsRef<Path>>(
        &self,
        path: P,
        timestamp: f64,
        timeout: Option<Duration>,
    ) -> Result<Option<ExtractedFrame>, StillframeError> {
        let mut request = ExtractionRequest::new(path.as_ref(), timestamp);
        request.timeout = timeout;
        self.extract(&request)
    }

    /// Perform one [`ExtractionRequest`].
    ///
    /// On any outcome other than a non-empty image the output file is
    /// removed, including caller-supplied outputs.
    ///
    /// # Errors
    ///
    /// Same as [`extract_frame`](FrameSampler::extract_frame).
    pub fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Option<ExtractedFrame>, StillframeError> {
        let file = match &request.output {
            Some(output) => FrameFile::Owned(output.clone()),
            None => {
                let scratch = self.configuration.scratch_directory();
                fs::create_dir_all(&scratch)?;
                FrameFile::Scratch(
                    tempfile::Builder::new()
                        .prefix("stillframe-frame-")
                        .suffix(".jpg")
                        .tempfile_in(&scratch)?
                        .into_temp_path(),
                )
            }
        };

        let timestamp = format!("{:.3}", request.timestamp);
        let args: [OsString; 14] = [
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            timestamp.clone().into(),
            "-i".into(),
            request.source.as_os_str().to_owned(),
            "-frames:v".into(),
            "1".into(),
            "-q:v".into(),
            "2".into(),
            "-y".into(),
            file.path().as_os_str().to_owned(),
        ];
        let timeout = request.timeout.unwrap_or(self.configuration.frame_timeout);

        let exited_cleanly = match self
            .runner
            .run(&self.configuration.decoder_path, &args, timeout)
        {
            Ok(output) if output.success() => true,
            Ok(output) => {
                let stderr = output.stderr_text();
                self.logger.log(
                    Level::Debug,
                    "decoder produced no frame",
                    &[
                        ("source", request.source.display().to_string()),
                        ("timestamp", timestamp.clone()),
                        ("exit_code", format!("{:?}", output.exit_code())),
                        ("stderr", last_line(&stderr)),
                    ],
                );
                false
            }
            Err(StillframeError::Timeout { .. }) => false,
            Err(error) => {
                file.discard();
                return Err(error);
            }
        };

        if exited_cleanly {
            match fs::metadata(file.path()) {
                Ok(metadata) if metadata.len() > 0 => {
                    self.logger.log(
                        Level::Debug,
                        "extracted frame",
                        &[
                            ("source", request.source.display().to_string()),
                            ("timestamp", timestamp),
                            ("bytes", metadata.len().to_string()),
                        ],
                    );
                    return Ok(Some(ExtractedFrame {
                        file,
                        timestamp: request.timestamp,
                        index: None,
                    }));
                }
                _ => self.logger.log(
                    Level::Debug,
                    "decoder exited cleanly but wrote no image",
                    &[
                        ("source", request.source.display().to_string()),
                        ("timestamp", timestamp),
                    ],
                ),
            }
        }

        file.discard();
        Ok(None)
    }

    /// Try `timestamp`, then the rest of the [`fallback_ladder`], stopping at
    /// the first usable frame.
    ///
    /// Each rung is an independent extraction with its own timeout.
    ///
    /// # Errors
    ///
    /// Same as [`extract_frame`](FrameSampler::extract_frame).
    pub fn extract_with_fallback<P: AsRef<Path>>(
        &self,
        path: P,
        timestamp: f64,
        duration: f64,
    ) -> Result<Option<ExtractedFrame>, StillframeError> {
        self.extract_with_fallback_within(path, timestamp, duration, None)
    }

    /// Like [`extract_with_fallback`](FrameSampler::extract_with_fallback)
    /// but every rung runs with `timeout` instead of `frame_timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`extract_frame`](FrameSampler::extract_frame).
    pub fn extract_with_fallback_within<P: AsRef<Path>>(
        &self,
        path: P,
        timestamp: f64,
        duration: f64,
        timeout: Option<Duration>,
    ) -> Result<Option<ExtractedFrame>, StillframeError> {
        let path = path.as_ref();
        let ladder = fallback_ladder(timestamp, duration);
        for (rung, position) in ladder.iter().enumerate() {
            if let Some(frame) = self.extract_frame(path, *position, timeout)? {
                if rung > 0 {
                    self.logger.log(
                        Level::Info,
                        "used fallback position",
                        &[
                            ("source", path.display().to_string()),
                            ("requested", format!("{timestamp:.3}")),
                            ("used", format!("{position:.3}")),
                        ],
                    );
                }
                return Ok(Some(frame));
            }
        }

        self.logger.log(
            Level::Warn,
            "fallback ladder exhausted",
            &[
                ("source", path.display().to_string()),
                ("attempts", ladder.len().to_string()),
            ],
        );
        Ok(None)
    }

    /// Extract `count` evenly spaced frames (see [`frame_timestamps`]).
    ///
    /// The result may be shorter than `count`: positions that yield no frame
    /// are logged and skipped. An unknown duration yields an empty vector.
    ///
    /// # Errors
    ///
    /// Same as [`extract_frame`](FrameSampler::extract_frame); frames already
    /// extracted are cleaned up.
    pub fn extract_frames<P: AsRef<Path>>(
        &self,
        path: P,
        count: u32,
    ) -> Result<Vec<ExtractedFrame>, StillframeError> {
        self.extract_frames_with_options(path, count, &ExtractOptions::default())
    }

    /// Like [`extract_frames`](FrameSampler::extract_frames) but reports
    /// progress and honours cancellation between positions.
    ///
    /// # Errors
    ///
    /// Additionally returns [`StillframeError::Cancelled`] if the token is
    /// cancelled before all positions were attempted.
    pub fn extract_frames_with_options<P: AsRef<Path>>(
        &self,
        path: P,
        count: u32,
        options: &ExtractOptions,
    ) -> Result<Vec<ExtractedFrame>, StillframeError> {
        let path = path.as_ref();
        let duration = self.probe.probe(path);
        if duration <= 0.0 {
            self.logger.log(
                Level::Warn,
                "duration unknown, not sampling",
                &[("source", path.display().to_string())],
            );
            return Ok(Vec::new());
        }

        let timestamps = frame_timestamps(duration, count);
        let mut tracker = ProgressTracker::new(
            options.progress.clone(),
            OperationType::FrameSampling,
            Some(timestamps.len() as u64),
            options.batch_size,
        );

        let mut frames = Vec::with_capacity(timestamps.len());
        for (index, &timestamp) in timestamps.iter().enumerate() {
            if options.is_cancelled() {
                return Err(StillframeError::Cancelled);
            }
            if index > 0 && !self.configuration.extraction_pause.is_zero() {
                thread::sleep(self.configuration.extraction_pause);
            }

            match self.extract_frame(path, timestamp, None)? {
                Some(mut frame) => {
                    frame.index = Some(index);
                    frames.push(frame);
                }
                None => self.logger.log(
                    Level::Warn,
                    "skipping position without a frame",
                    &[
                        ("source", path.display().to_string()),
                        ("index", index.to_string()),
                        ("timestamp", format!("{timestamp:.3}")),
                    ],
                ),
            }
            tracker.advance(Some(index as u64), Some(Duration::from_secs_f64(timestamp)));
        }
        tracker.finish();

        self.logger.log(
            Level::Info,
            "sampled frames",
            &[
                ("source", path.display().to_string()),
                ("requested", timestamps.len().to_string()),
                ("extracted", frames.len().to_string()),
            ],
        );
        Ok(frames)
    }
}

fn last_line(text: &str) -> String {
    let line = text.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or_default();
    line.trim().chars().take(200).collect()
}
