//! # stillframe
//!
//! Extract still-image thumbnails from videos by shelling out to an external
//! decoder, and keep a persisted "has thumbnails" flag in sync with what is
//! actually in storage.
//!
//! `stillframe` never links against a media library. Every decoder call goes
//! through a [`ProcessRunner`] that closes stdin, drains output incrementally
//! and enforces a wall-clock bound, so a stuck or corrupt input can never hang
//! the caller.
//!
//! ## Quick Start
//!
//! ### Extract a Frame
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillframe::{Configuration, FrameSampler, default_logger};
//!
//! let sampler = FrameSampler::from_configuration(Arc::new(Configuration::new()), default_logger());
//! match sampler.extract_frame("input.mp4", 5.0, None)? {
//!     Some(frame) => println!("frame written to {}", frame.keep()?.display()),
//!     None => println!("no frame at 5s"),
//! }
//! # Ok::<(), stillframe::StillframeError>(())
//! ```
//!
//! ### Keep Thumbnails Consistent
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
//! let configuration = Arc::new(Configuration::new());
//! let synchronizer = ThumbnailSynchronizer::new(
//!     Arc::new(FilesystemStorage::new("/srv/media")),
//!     Arc::new(JsonStore::open("state.json")?),
//!     FrameSampler::from_configuration(configuration, logger.clone()),
//!     logger,
//! );
//!
//! synchronizer.register("42", MediaAsset::new("clip-42", "videos/clip-42.mp4", "video/mp4"))?;
//! let stored = synchronizer.regenerate("42", 50.0);
//! println!("thumbnails stored: {stored}");
//! # Ok::<(), stillframe::StillframeError>(())
//! ```
//!
//! ### Retry a Batch
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillframe::{
//!     BatchWorker, Configuration, FilesystemStorage, FrameSampler, JsonStore, Persistence,
//!     RetryPolicy, RetryingDispatchStrategy, ThumbnailSynchronizer, default_logger,
//! };
//!
//! let logger = default_logger();
//! let configuration = Arc::new(Configuration::new());
//! let persistence: Arc<dyn Persistence> = Arc::new(JsonStore::open("state.json")?);
//! let synchronizer = ThumbnailSynchronizer::new(
//!     Arc::new(FilesystemStorage::new("/srv/media")),
//!     persistence.clone(),
//!     FrameSampler::from_configuration(configuration.clone(), logger.clone()),
//!     logger.clone(),
//! );
//! let strategy = RetryingDispatchStrategy::new(
//!     BatchWorker::new(synchronizer, logger.clone()),
//!     persistence.clone(),
//!     RetryPolicy::from_configuration(&configuration),
//!     logger,
//! );
//!
//! let media_ids = persistence.media_ids()?;
//! strategy.create_job("nightly", media_ids, 10.0)?;
//! strategy.send("nightly")?;
//! # Ok::<(), stillframe::StillframeError>(())
//! ```
//!
//! ## Features
//!
//! - **Bounded processes**: timeouts clamped to a configured range,
//!   termination then kill escalation, output drained while running
//! - **Duration probing**: tolerant parsing of the decoder's banner with an
//!   explicit fallback policy for unknown or suspicious durations
//! - **Frame sampling**: single frames, a fallback ladder, and evenly spaced
//!   candidates for interactive selection
//! - **Consistency flag**: derivatives validated against storage, written
//!   only when the answer changes
//! - **Retrying dispatch**: exponential backoff, persisted retry counters
//!   and checkpoints, expiry recovery, stop requests
//! - **Progress & cancellation**: cooperative callbacks and
//!   `CancellationToken` for multi-item work
//!
//! ## Requirements
//!
//! A decoder executable compatible with `ffmpeg`'s command line must be
//! available, by default as `ffmpeg` on the `PATH`.

pub mod batch;
pub mod configuration;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod media;
pub mod persistence;
pub mod probe;
pub mod process;
pub mod progress;
pub mod sampler;
pub mod storage;
pub mod synchronizer;
pub mod thumbnail;

pub use batch::{BatchSummary, BatchWorker};
pub use configuration::{Configuration, ExtractOptions};
pub use dispatch::{
    JobRecord, JobSender, JobStatus, RecoveryCheckpoint, RetryPolicy, RetryState,
    RetryingDispatchStrategy,
};
pub use error::StillframeError;
pub use logging::{LogContext, LogFacade, LogRecord, Logger, MemoryLogger, default_logger};
pub use media::{MediaAsset, MediaRecord};
pub use persistence::{JsonStore, Persistence};
pub use probe::{Confidence, DurationEstimate, DurationProbe, parse_duration};
pub use process::{ProcessOutput, ProcessRunner, TimeoutBounds};
pub use progress::{CancellationToken, OperationType, ProgressCallback, ProgressInfo};
pub use sampler::{
    ExtractedFrame, ExtractionRequest, FrameSampler, fallback_ladder, frame_timestamps,
};
pub use storage::{FilesystemStorage, Storage};
pub use synchronizer::{FramePosition, ThumbnailSynchronizer};
pub use thumbnail::{DerivativeSize, ResizeMode, SetValidation, ThumbnailSet, derivative_path};
