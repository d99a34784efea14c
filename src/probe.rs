//! Media duration probing.
//!
//! [`DurationProbe`] runs the decoder in introspection mode and pulls the
//! `Duration: HH:MM:SS.ff` token out of whatever it printed. A probe never
//! fails: anything that prevents reading a duration (missing binary, timeout,
//! unparseable output) yields `0.0`, which callers must read as "unknown".
//!
//! [`DurationEstimate`] turns a raw probe result into the value timestamps are
//! computed from, applying the crate-wide fallback policy:
//!
//! - a positive, ordinary probe result is trusted ([`Confidence::Probed`]);
//! - a positive result that is a whole number of minutes on a file smaller
//!   than [`Configuration::low_confidence_file_size`] looks like a container
//!   default rather than a measurement ([`Confidence::Low`]);
//! - a zero result is replaced by [`Configuration::fallback_duration`]
//!   ([`Confidence::Assumed`]).
//!
//! For the last two, positions derived from a percentage are capped at
//! [`UNCERTAIN_POSITION_CAP`] of the estimate.

use std::ffi::OsString;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use log::Level;
use regex::Regex;

use crate::configuration::Configuration;
use crate::error::StillframeError;
use crate::logging::Logger;
use crate::process::ProcessRunner;

/// Fraction of the estimated duration that uncertain estimates may seek to.
pub const UNCERTAIN_POSITION_CAP: f64 = 0.25;

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)duration:\s*(\d{1,3}):([0-5]?\d):([0-5]?\d(?:[.,]\d+)?)")
            .expect("duration pattern is a valid regex")
    })
}

/// Parse the first `Duration: HH:MM:SS[.fraction]` token in `text`.
///
/// Returns `None` when no token is present (including the decoder's
/// `Duration: N/A`).
///
/// # Example
///
/// ```
/// use stillframe::parse_duration;
///
/// let text = "  Duration: 00:01:30.50, start: 0.000000, bitrate: 1205 kb/s";
/// assert_eq!(parse_duration(text), Some(90.5));
/// assert_eq!(parse_duration("Duration: N/A"), None);
/// ```
pub fn parse_duration(text: &str) -> Option<f64> {
    let captures = duration_pattern().captures(text)?;
    let hours: f64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = captures.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = captures.get(3)?.as_str().replace(',', ".").parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}

/// How far a [`DurationEstimate`] can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Measured by the decoder.
    Probed,
    /// Measured, but suspiciously round for a very small file.
    Low,
    /// The probe found nothing; the configured fallback is used.
    Assumed,
}

/// A duration that timestamps can be computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationEstimate {
    /// Duration in seconds, always positive.
    pub seconds: f64,
    /// Provenance of `seconds`.
    pub confidence: Confidence,
}

impl DurationEstimate {
    /// Apply the fallback policy to a raw probe result.
    ///
    /// `file_size` is the size of the source in bytes, if known.
    pub fn from_probe(probed: f64, file_size: Option<u64>, configuration: &Configuration) -> Self {
        if !(probed.is_finite() && probed > 0.0) {
            return Self {
                seconds: configuration.fallback_duration.as_secs_f64().max(1.0),
                confidence: Confidence::Assumed,
            };
        }

        let round_minutes = probed >= 60.0 && (probed % 60.0).abs() < f64::EPSILON;
        let small_file = file_size.is_some_and(|size| size < configuration.low_confidence_file_size);
        let confidence = if round_minutes && small_file {
            Confidence::Low
        } else {
            Confidence::Probed
        };

        Self {
            seconds: probed,
            confidence,
        }
    }

    /// Returns `true` unless the decoder measured the duration outright.
    pub fn is_uncertain(&self) -> bool {
        self.confidence != Confidence::Probed
    }

    /// Timestamp at `percent` (clamped to 0-100) of the duration.
    ///
    /// Uncertain estimates are capped at [`UNCERTAIN_POSITION_CAP`] of the
    /// duration.
    pub fn timestamp_at_percent(&self, percent: f64) -> f64 {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let timestamp = self.seconds * percent / 100.0;
        if self.is_uncertain() {
            timestamp.min(self.seconds * UNCERTAIN_POSITION_CAP)
        } else {
            timestamp
        }
    }
}

/// Reads durations through the decoder's introspection mode.
#[derive(Clone)]
pub struct DurationProbe {
    runner: ProcessRunner,
    configuration: Arc<Configuration>,
    logger: Arc<dyn Logger>,
}

impl Debug for DurationProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DurationProbe")
            .field("decoder", &self.configuration.decoder_path)
            .field("timeout", &self.configuration.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl DurationProbe {
    /// Create a probe that runs the configured decoder through `runner`.
    pub fn new(
        runner: ProcessRunner,
        configuration: Arc<Configuration>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            runner,
            configuration,
            logger,
        }
    }

    /// Duration of the media at `path` in seconds, or `0.0` if unknown.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use stillframe::{Configuration, DurationProbe, ProcessRunner, default_logger};
    ///
    /// let probe = DurationProbe::new(
    ///     ProcessRunner::new(),
    ///     Arc::new(Configuration::new()),
    ///     default_logger(),
    /// );
    /// let seconds = probe.probe("input.mp4");
    /// if seconds == 0.0 {
    ///     println!("duration unknown");
    /// }
    /// ```
    pub fn probe<P: AsRef<Path>>(&self, path: P) -> f64 {
        let path = path.as_ref();
        let args: [OsString; 4] = [
            "-hide_banner".into(),
            "-nostdin".into(),
            "-i".into(),
            path.as_os_str().to_owned(),
        ];

        // The decoder exits non-zero when given no output; the banner still
        // carries the duration.
        let output = match self.runner.run(
            &self.configuration.decoder_path,
            &args,
            self.configuration.probe_timeout,
        ) {
            Ok(output) => output,
            Err(error) => {
                self.logger.log(
                    Level::Warn,
                    "duration probe failed",
                    &[
                        ("path", path.display().to_string()),
                        ("error", error.to_string()),
                    ],
                );
                return 0.0;
            }
        };

        match parse_duration(&output.combined_text()) {
            Some(seconds) => {
                self.logger.log(
                    Level::Debug,
                    "probed duration",
                    &[
                        ("path", path.display().to_string()),
                        ("seconds", format!("{seconds:.3}")),
                    ],
                );
                seconds
            }
            None => {
                self.logger.log(
                    Level::Warn,
                    "no duration in decoder output",
                    &[
                        ("path", path.display().to_string()),
                        ("exit_code", format!("{:?}", output.exit_code())),
                    ],
                );
                0.0
            }
        }
    }

    /// Probe `path` and apply the fallback policy.
    pub fn estimate<P: AsRef<Path>>(&self, path: P) -> DurationEstimate {
        let path = path.as_ref();
        let probed = self.probe(path);
        self.estimate_from(path, probed)
    }

    /// Apply the fallback policy to an already known probe result.
    pub fn estimate_from<P: AsRef<Path>>(&self, path: P, probed: f64) -> DurationEstimate {
        let file_size = fs::metadata(path.as_ref()).ok().map(|metadata| metadata.len());
        let estimate = DurationEstimate::from_probe(probed, file_size, &self.configuration);
        if estimate.is_uncertain() {
            self.logger.log(
                Level::Info,
                "using uncertain duration estimate",
                &[
                    ("path", path.as_ref().display().to_string()),
                    ("seconds", format!("{:.3}", estimate.seconds)),
                    ("confidence", format!("{:?}", estimate.confidence)),
                ],
            );
        }
        estimate
    }

    /// Verify the decoder can be launched at all.
    ///
    /// Bounded by the generic `operation_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::Spawn`] if the binary is missing or not
    /// executable, or [`StillframeError::Timeout`] if `-version` hangs.
    pub fn check_decoder(&self) -> Result<String, StillframeError> {
        let output = self.runner.run(
            &self.configuration.decoder_path,
            &["-version"],
            self.configuration.operation_timeout,
        )?;
        Ok(output
            .stdout_text()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}
