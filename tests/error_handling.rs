//! Error handling integration tests.
//!
//! These tests verify that errors carry a meaningful message and are
//! classified the way the batch worker relies on.

use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

use stillframe::StillframeError;

#[test]
fn infrastructure_failures_are_structural() {
    let structural = [
        StillframeError::Storage {
            path: "thumbnails/a/large.jpg".to_string(),
            reason: "quota exceeded".to_string(),
        },
        StillframeError::Persistence("database gone".to_string()),
        StillframeError::Io(IoError::new(ErrorKind::PermissionDenied, "denied")),
    ];
    for error in &structural {
        assert!(error.is_structural(), "{error} should be structural");
    }
}

#[test]
fn per_item_failures_are_not_structural() {
    let per_item = [
        StillframeError::UnknownMedia("42".to_string()),
        StillframeError::UnsupportedMedia {
            media_id: "7".to_string(),
            mime_type: "image/png".to_string(),
        },
        StillframeError::NoFrame {
            path: PathBuf::from("clip.mp4"),
        },
        StillframeError::Timeout {
            program: "ffmpeg".to_string(),
            timeout: Duration::from_secs(10),
        },
        StillframeError::Cancelled,
    ];
    for error in &per_item {
        assert!(!error.is_structural(), "{error} should not be structural");
    }
}

#[test]
fn spawn_error_names_the_program() {
    let error = StillframeError::Spawn {
        program: "/usr/bin/ffmpeg".to_string(),
        source: IoError::new(ErrorKind::NotFound, "No such file or directory"),
    };
    let message = error.to_string();
    assert!(
        message.contains("Failed to launch /usr/bin/ffmpeg"),
        "Error message should name the program: {message}",
    );
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn retries_exhausted_reports_attempts() {
    let error = StillframeError::RetriesExhausted {
        job_id: "nightly".to_string(),
        attempts: 3,
        last_error: "Persistence error: disk full".to_string(),
    };
    assert_eq!(
        error.to_string(),
        "Job nightly failed after 3 attempts: Persistence error: disk full"
    );
}

#[test]
fn json_errors_convert() {
    let json_error = serde_json::from_str::<u32>("not json").unwrap_err();
    let error: StillframeError = json_error.into();
    assert!(matches!(error, StillframeError::Json(_)));
    assert!(error.is_structural());
}

#[test]
fn timeout_message_includes_duration() {
    let error = StillframeError::Timeout {
        program: "ffmpeg".to_string(),
        timeout: Duration::from_secs(10),
    };
    assert_eq!(error.to_string(), "ffmpeg timed out after 10s");
}
