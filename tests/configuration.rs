//! Configuration and ExtractOptions tests.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use stillframe::{
    Configuration, DerivativeSize, ExtractOptions, ResizeMode, RetryPolicy, StillframeError,
    TimeoutBounds,
};

// ── Configuration defaults ─────────────────────────────────────────

#[test]
fn defaults_shell_out_to_ffmpeg() {
    let configuration = Configuration::new();
    assert_eq!(configuration.decoder_path, PathBuf::from("ffmpeg"));
    assert_eq!(configuration.default_position_percent, 10.0);
    assert_eq!(configuration.selection_frame_count, 5);
    assert_eq!(configuration.frame_timeout, Duration::from_secs(10));
    assert_eq!(configuration.timeout_bounds, TimeoutBounds::default());
    assert_eq!(configuration.max_retries, 3);
    assert_eq!(configuration.fallback_duration, Duration::from_secs(10));
    assert_eq!(configuration.derivative_sizes.len(), 3);
    assert!(configuration.validate().is_ok());
}

#[test]
fn retry_policy_follows_configuration() {
    let configuration = Configuration::new()
        .with_max_retries(5)
        .with_backoff(Duration::from_secs(1), Duration::from_secs(4))
        .with_max_recovery_attempts(2);
    let policy = RetryPolicy::from_configuration(&configuration);

    assert_eq!(policy.max_retries, 5);
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.max_recovery_attempts, 2);
}

#[test]
fn position_percent_is_clamped() {
    assert_eq!(
        Configuration::new()
            .with_default_position_percent(140.0)
            .default_position_percent,
        100.0
    );
}

#[test]
fn scratch_directory_defaults_to_temp() {
    assert_eq!(Configuration::new().scratch_directory(), std::env::temp_dir());
    assert_eq!(
        Configuration::new()
            .with_scratch_dir("/var/tmp/stillframe")
            .scratch_directory(),
        PathBuf::from("/var/tmp/stillframe")
    );
}

// ── Validation ─────────────────────────────────────────────────────

fn assert_invalid(configuration: Configuration, needle: &str) {
    match configuration.validate() {
        Err(StillframeError::InvalidConfiguration(message)) => {
            assert!(message.contains(needle), "unexpected message: {message}");
        }
        other => panic!("Expected InvalidConfiguration, got: {other:?}"),
    }
}

#[test]
fn empty_decoder_path_is_rejected() {
    assert_invalid(Configuration::new().with_decoder_path(""), "decoder_path");
}

#[test]
fn derivative_sizes_need_names_and_dimensions() {
    assert_invalid(Configuration::new().with_derivative_sizes(vec![]), "at least one");
    assert_invalid(
        Configuration::new().with_derivative_sizes(vec![DerivativeSize::new(
            "tiny",
            0,
            10,
            ResizeMode::Fit,
        )]),
        "tiny",
    );
}

#[test]
fn jpeg_quality_must_be_in_range() {
    let mut configuration = Configuration::new();
    configuration.jpeg_quality = 0;
    assert_invalid(configuration, "jpeg_quality");
}

#[test]
fn zero_timeout_floor_is_rejected() {
    let mut configuration = Configuration::new();
    configuration.timeout_bounds = TimeoutBounds {
        min: Duration::ZERO,
        max: Duration::from_secs(5),
    };
    assert_invalid(configuration, "timeout bounds");
}

// ── JSON files ─────────────────────────────────────────────────────

#[test]
fn partial_json_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stillframe.json");
    fs::write(
        &path,
        r#"{
            "decoder_path": "/opt/ffmpeg/bin/ffmpeg",
            "frame_timeout": 2.5,
            "max_retries": 7,
            "derivative_sizes": [
                { "name": "poster", "width": 640, "height": 360 },
                { "name": "icon", "width": 48, "height": 48, "mode": "crop" }
            ]
        }"#,
    )
    .unwrap();

    let configuration = Configuration::from_json_file(&path).unwrap();

    assert_eq!(configuration.decoder_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    assert_eq!(configuration.frame_timeout, Duration::from_millis(2500));
    assert_eq!(configuration.max_retries, 7);
    assert_eq!(configuration.probe_timeout, Duration::from_secs(10));
    assert_eq!(configuration.derivative_sizes[0].mode, ResizeMode::Fit);
    assert_eq!(configuration.derivative_sizes[1].mode, ResizeMode::Crop);
}

#[test]
fn negative_seconds_are_a_json_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stillframe.json");
    fs::write(&path, r#"{ "probe_timeout": -1 }"#).unwrap();

    assert!(matches!(
        Configuration::from_json_file(&path),
        Err(StillframeError::Json(_))
    ));
}

#[test]
fn out_of_range_file_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stillframe.json");
    fs::write(&path, r#"{ "default_position_percent": 250 }"#).unwrap();

    assert!(matches!(
        Configuration::from_json_file(&path),
        Err(StillframeError::InvalidConfiguration(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(matches!(
        Configuration::from_json_file("/nonexistent/stillframe.json"),
        Err(StillframeError::Io(_))
    ));
}

// ── ExtractOptions builder ─────────────────────────────────────────

#[test]
fn options_defaults() {
    let options = ExtractOptions::new();
    let debug = format!("{options:?}");
    assert!(debug.contains("ExtractOptions"));
    assert!(debug.contains("has_cancellation: false"));
    assert!(debug.contains("batch_size: 1"));
}

#[test]
fn options_with_batch_size_clamps_zero() {
    let options = ExtractOptions::new().with_batch_size(0);
    assert!(format!("{options:?}").contains("batch_size: 1"));
}

#[test]
fn options_with_cancellation() {
    let options = ExtractOptions::new().with_cancellation(stillframe::CancellationToken::new());
    assert!(format!("{options:?}").contains("has_cancellation: true"));
}
