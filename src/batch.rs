//! Batch regeneration.
//!
//! [`BatchWorker`] is the [`JobSender`] that runs a regeneration job inline:
//! it walks the job's media items from its recorded position, regenerating
//! each through the [`ThumbnailSynchronizer`]. Progress is persisted after
//! every item so a retried or recovered job resumes where the last attempt
//! stopped.
//!
//! A single media item failing (no frame, bad image, unknown id) is counted
//! and skipped. Infrastructure failures (storage, persistence, local I/O)
//! abort the attempt so the dispatch strategy can retry it.

use std::sync::Arc;

use log::Level;

use crate::configuration::ExtractOptions;
use crate::dispatch::{JobRecord, JobSender, JobStatus};
use crate::error::StillframeError;
use crate::logging::Logger;
use crate::progress::{OperationType, ProgressTracker};
use crate::synchronizer::{FramePosition, ThumbnailSynchronizer};

/// Counts reported at the end of one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Items regenerated successfully, across all attempts.
    pub processed: usize,
    /// Items that failed, across all attempts.
    pub failed: usize,
    /// Items in the job.
    pub total: usize,
}

impl BatchSummary {
    /// Summary of the counters recorded on `job`.
    pub fn of(job: &JobRecord) -> Self {
        Self {
            processed: job.processed,
            failed: job.failed,
            total: job.total(),
        }
    }
}

/// Runs regeneration jobs item by item.
pub struct BatchWorker {
    synchronizer: ThumbnailSynchronizer,
    options: ExtractOptions,
    logger: Arc<dyn Logger>,
}

impl BatchWorker {
    /// Create a worker regenerating through `synchronizer`.
    pub fn new(synchronizer: ThumbnailSynchronizer, logger: Arc<dyn Logger>) -> Self {
        Self {
            synchronizer,
            options: ExtractOptions::default(),
            logger,
        }
    }

    /// Report progress and honour cancellation through `options`.
    #[must_use]
    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    /// The synchronizer items are regenerated through.
    pub fn synchronizer(&self) -> &ThumbnailSynchronizer {
        &self.synchronizer
    }

    fn stop_requested(&self, job_id: &str) -> Result<bool, StillframeError> {
        if self.options.is_cancelled() {
            return Ok(true);
        }
        let stored = self.synchronizer.persistence().job(job_id)?;
        Ok(stored.is_some_and(|job| job.status == JobStatus::Stopped))
    }

    fn save_progress(&self, job: &mut JobRecord) -> Result<(), StillframeError> {
        let persistence = self.synchronizer.persistence();
        // Keep a stop request that landed while the item was running.
        if persistence
            .job(&job.id)?
            .is_some_and(|stored| stored.status == JobStatus::Stopped)
        {
            job.status = JobStatus::Stopped;
        }
        persistence.save_job(job)?;
        persistence.flush()
    }
}

impl JobSender for BatchWorker {
    fn send(&self, job: &mut JobRecord) -> Result<(), StillframeError> {
        let total = job.total();
        let started_at = job.next_index.min(total);
        let mut tracker = ProgressTracker::new(
            self.options.progress.clone(),
            OperationType::BatchRegeneration,
            Some(total as u64),
            self.options.batch_size,
        )
        .resume_at(started_at as u64);

        self.logger.log(
            Level::Info,
            "batch attempt started",
            &[
                ("job", job.id.clone()),
                ("from", started_at.to_string()),
                ("total", total.to_string()),
            ],
        );

        for index in started_at..total {
            if self.stop_requested(&job.id)? {
                self.logger.log(
                    Level::Info,
                    "batch stopped before next item",
                    &[("job", job.id.clone()), ("index", index.to_string())],
                );
                return Err(StillframeError::Cancelled);
            }

            let media_id = job.media_ids[index].clone();
            let position = FramePosition::Percent(job.position_percent);
            match self.synchronizer.try_regenerate(&media_id, position) {
                Ok(true) => job.processed += 1,
                Ok(false) => {
                    job.failed += 1;
                    self.logger.log(
                        Level::Warn,
                        "derivatives incomplete after regeneration",
                        &[("job", job.id.clone()), ("media", media_id)],
                    );
                }
                Err(error) if error.is_structural() => {
                    self.logger.log(
                        Level::Warn,
                        "batch aborted",
                        &[
                            ("job", job.id.clone()),
                            ("media", media_id),
                            ("error", error.to_string()),
                        ],
                    );
                    return Err(error);
                }
                Err(error) => {
                    job.failed += 1;
                    self.logger.log(
                        Level::Warn,
                        "batch item failed",
                        &[
                            ("job", job.id.clone()),
                            ("media", media_id),
                            ("error", error.to_string()),
                        ],
                    );
                }
            }

            job.next_index = index + 1;
            job.progress_percent = (job.next_index as f32 / total as f32) * 100.0;
            self.save_progress(job)?;
            tracker.advance(Some(index as u64), None);
        }
        tracker.finish();

        let summary = BatchSummary::of(job);
        self.logger.log(
            Level::Info,
            "batch finished",
            &[
                ("job", job.id.clone()),
                ("processed", summary.processed.to_string()),
                ("failed", summary.failed.to_string()),
                ("total", summary.total.to_string()),
            ],
        );
        Ok(())
    }
}
