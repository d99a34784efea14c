//! Shared fixtures: a scripted stand-in for the decoder and a small JPEG.
//!
//! The fake decoder appends every command line to `invocations.log`, answers
//! `-version`, prints a `Duration:` banner in introspection mode and, in
//! extraction mode, behaves according to [`FrameMode`].

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use stillframe::{Configuration, FrameSampler, Logger, MemoryLogger};
use tempfile::TempDir;

/// What the fake decoder does when asked for a frame.
#[derive(Debug, Clone)]
pub enum FrameMode {
    /// Copy the fixture JPEG to the output path.
    Copy,
    /// Exit non-zero without writing anything.
    Fail,
    /// Exit zero but leave a zero-length output.
    Empty,
    /// Succeed only when `-ss` equals the given string.
    OnlyAt(String),
    /// Never return on its own.
    Hang,
}

pub struct FakeDecoder {
    pub dir: TempDir,
    pub decoder: PathBuf,
    pub fixture: PathBuf,
    pub scratch: PathBuf,
    pub storage_root: PathBuf,
    log: PathBuf,
}

impl FakeDecoder {
    /// `duration` is the banner text, e.g. `00:01:30.50`; `None` prints
    /// `Duration: N/A`.
    pub fn new(duration: Option<&str>, mode: FrameMode) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let fixture = dir.path().join("fixture.jpg");
        write_fixture_jpeg(&fixture, 64, 48);

        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).expect("create scratch dir");
        let storage_root = dir.path().join("storage");
        fs::create_dir_all(storage_root.join("videos")).expect("create storage root");

        let log = dir.path().join("invocations.log");
        let decoder = dir.path().join("fake-decoder");
        write_script(&decoder, &script(duration, &mode, &fixture, &log));

        Self {
            dir,
            decoder,
            fixture,
            scratch,
            storage_root,
            log,
        }
    }

    /// Replace the script with one behaving differently; the log is kept.
    pub fn reconfigure(&self, duration: Option<&str>, mode: FrameMode) {
        write_script(
            &self.decoder,
            &script(duration, &mode, &self.fixture, &self.log),
        );
    }

    /// Configuration pointing at this decoder, with no pause between frames.
    pub fn configuration(&self) -> Configuration {
        Configuration::new()
            .with_decoder_path(&self.decoder)
            .with_scratch_dir(&self.scratch)
            .with_extraction_pause(Duration::ZERO)
            .with_frame_timeout(Duration::from_secs(5))
            .with_probe_timeout(Duration::from_secs(5))
    }

    pub fn sampler(&self, logger: Arc<MemoryLogger>) -> FrameSampler {
        self.sampler_with(self.configuration(), logger)
    }

    pub fn sampler_with(&self, configuration: Configuration, logger: Arc<MemoryLogger>) -> FrameSampler {
        let logger: Arc<dyn Logger> = logger;
        FrameSampler::from_configuration(Arc::new(configuration), logger)
    }

    /// Put a source video (any bytes will do) into storage.
    pub fn add_source(&self, name: &str, size: usize) -> String {
        let storage_path = format!("videos/{name}");
        fs::write(self.storage_root.join(&storage_path), vec![0_u8; size]).expect("write source");
        storage_path
    }

    /// Every command line the decoder was started with.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Command lines of extraction runs.
    pub fn extractions(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|line| line.contains("-frames:v"))
            .collect()
    }

    /// Command lines of probe runs.
    pub fn probes(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|line| !line.contains("-frames:v") && !line.contains("-version"))
            .collect()
    }

    /// Files left in the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        fs::read_dir(&self.scratch)
            .map(|entries| entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect())
            .unwrap_or_default()
    }
}

fn script(duration: Option<&str>, mode: &FrameMode, fixture: &Path, log: &Path) -> String {
    let fixture = fixture.display();
    let frame_branch = match mode {
        FrameMode::Copy => format!("cp '{fixture}' \"$last\"\n    exit 0"),
        FrameMode::Fail => "echo 'decode error' >&2\n    exit 1".to_string(),
        FrameMode::Empty => ": > \"$last\"\n    exit 0".to_string(),
        FrameMode::OnlyAt(timestamp) => format!(
            "if [ \"$ss\" = \"{timestamp}\" ]; then cp '{fixture}' \"$last\"; exit 0; fi\n    exit 1"
        ),
        FrameMode::Hang => "exec sleep 30".to_string(),
    };
    let banner = match duration {
        Some(text) => format!("  Duration: {text}, start: 0.000000, bitrate: 1205 kb/s"),
        None => "  Duration: N/A, bitrate: N/A".to_string(),
    };

    format!(
        r#"#!/bin/sh
echo "$*" >> '{log}'
ss=""
prev=""
last=""
for arg; do
  if [ "$prev" = "-ss" ]; then ss="$arg"; fi
  prev="$arg"
  last="$arg"
done
case " $* " in
  *" -version "*)
    echo "fake-decoder version 1.0"
    exit 0
    ;;
  *" -frames:v "*)
    {frame_branch}
    ;;
esac
echo "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'input.mp4':" >&2
echo "{banner}" >&2
echo "At least one output file must be specified" >&2
exit 1
"#,
        log = log.display(),
    )
}

pub fn write_script(path: &Path, body: &str) {
    let staging = path.with_extension("tmp");
    fs::write(&staging, body).expect("write script");
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).expect("chmod script");
    fs::rename(&staging, path).expect("install script");
}

pub fn write_fixture_jpeg(path: &Path, width: u32, height: u32) {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 4) as u8, (y * 5) as u8, 128])
    });
    image.save(path).expect("write fixture jpeg");
}
