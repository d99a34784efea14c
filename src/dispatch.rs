//! Retrying job dispatch.
//!
//! [`RetryingDispatchStrategy`] wraps a [`JobSender`] (the mechanism that
//! actually runs a job) and adds bounded retries with exponential backoff.
//! Every state transition is written through [`Persistence`] and flushed
//! before the strategy moves on, so a worker that restarts can pick the job
//! up again from its recorded checkpoint.
//!
//! ```text
//! Starting → Running → Complete
//!                    → Error            (retries exhausted)
//!                    → Recovering → Running
//!                    → Stopped          (stop request or cancellation)
//! expired, unrecoverable → Failed { reason: "expired" }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillframe::{
//!     JobRecord, JsonStore, RetryPolicy, RetryingDispatchStrategy, StillframeError,
//!     default_logger,
//! };
//!
//! let persistence = Arc::new(JsonStore::open("state.json")?);
//! let sender = |job: &mut JobRecord| -> Result<(), StillframeError> {
//!     println!("running {}", job.id);
//!     Ok(())
//! };
//! let strategy = RetryingDispatchStrategy::new(
//!     sender,
//!     persistence,
//!     RetryPolicy::default(),
//!     default_logger(),
//! );
//!
//! strategy.create_job("nightly", vec!["42".to_string()], 10.0)?;
//! let status = strategy.send("nightly")?;
//! println!("{status}");
//! # Ok::<(), StillframeError>(())
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::Level;
use serde::{Deserialize, Serialize};

use crate::configuration::Configuration;
use crate::error::StillframeError;
use crate::logging::Logger;
use crate::persistence::Persistence;

/// Lifecycle state of a dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, never sent.
    Starting,
    /// A send is in progress.
    Running,
    /// Waiting to be sent again after a failure or an expiry.
    Recovering,
    /// Finished successfully.
    Complete,
    /// Retries exhausted.
    Error {
        /// Message of the last failure.
        message: String,
    },
    /// Stopped on request.
    Stopped,
    /// Given up on without retrying (e.g. an unrecoverable expiry).
    Failed {
        /// Why the job was given up on.
        reason: String,
    },
}

impl JobStatus {
    /// Returns `true` for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete
                | JobStatus::Error { .. }
                | JobStatus::Stopped
                | JobStatus::Failed { .. }
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Recovering => write!(f, "recovering"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Error { message } => write!(f, "error: {message}"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Where an interrupted job left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    /// Index of the last item that was completed, if any.
    pub last_item_index: Option<usize>,
    /// Progress recorded at the time of the checkpoint.
    pub progress_percent: f32,
}

impl RecoveryCheckpoint {
    fn of(job: &JobRecord) -> Self {
        Self {
            last_item_index: job.next_index.checked_sub(1),
            progress_percent: job.progress_percent,
        }
    }
}

/// Retry bookkeeping attached to a job.
///
/// `retry_count` only ever grows and never exceeds `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed sends so far.
    pub retry_count: u32,
    /// Bound on `retry_count`; reaching it is terminal.
    pub max_retries: u32,
    /// Set while the job is between attempts; cleared once it is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<RecoveryCheckpoint>,
}

impl RetryState {
    /// A fresh state with the given bound.
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            checkpoint: None,
        }
    }

    /// Returns `true` once no further send is permitted.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// A persisted, dispatched batch of regenerations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier.
    pub id: String,
    /// Media items to regenerate, in processing order.
    pub media_ids: Vec<String>,
    /// Frame position used for every item, as a percentage of duration.
    pub position_percent: f64,
    /// Current state.
    pub status: JobStatus,
    /// Retry counter and checkpoint.
    pub retry: RetryState,
    /// How many times the job was restarted after expiring.
    #[serde(default)]
    pub recovery_attempts: u32,
    /// Share of items attempted so far (0-100).
    #[serde(default)]
    pub progress_percent: f32,
    /// Index of the next item to attempt.
    #[serde(default)]
    pub next_index: usize,
    /// Items regenerated successfully.
    #[serde(default)]
    pub processed: usize,
    /// Items that failed.
    #[serde(default)]
    pub failed: usize,
    /// Message of the most recent send failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// A new job in the `Starting` state.
    pub fn new<S: Into<String>>(
        id: S,
        media_ids: Vec<String>,
        position_percent: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            media_ids,
            position_percent,
            status: JobStatus::Starting,
            retry: RetryState::new(max_retries),
            recovery_attempts: 0,
            progress_percent: 0.0,
            next_index: 0,
            processed: 0,
            failed: 0,
            last_error: None,
        }
    }

    /// Number of items in the job.
    pub fn total(&self) -> usize {
        self.media_ids.len()
    }
}

/// The mechanism that actually runs a job.
///
/// Implementations may update the progress fields of `job` as they go
/// (`next_index`, `processed`, `failed`, `progress_percent`). Returning
/// [`StillframeError::Cancelled`] means the job was stopped, not that it
/// failed.
pub trait JobSender: Send + Sync {
    /// Run `job` once.
    fn send(&self, job: &mut JobRecord) -> Result<(), StillframeError>;
}

impl<F> JobSender for F
where
    F: Fn(&mut JobRecord) -> Result<(), StillframeError> + Send + Sync,
{
    fn send(&self, job: &mut JobRecord) -> Result<(), StillframeError> {
        self(job)
    }
}

/// Backoff and recovery bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed sends before a job becomes `Error`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Restarts granted to expired jobs without partial progress.
    pub max_recovery_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_configuration(&Configuration::default())
    }
}

impl RetryPolicy {
    /// The policy described by `configuration`.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            max_retries: configuration.max_retries,
            base_delay: configuration.backoff_base,
            max_delay: configuration.max_backoff,
            max_recovery_attempts: configuration.max_recovery_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use stillframe::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    /// assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    /// assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2_u32
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Adds persisted retries, expiry recovery and stop handling around a
/// [`JobSender`].
pub struct RetryingDispatchStrategy<S> {
    sender: S,
    persistence: Arc<dyn Persistence>,
    policy: RetryPolicy,
    logger: Arc<dyn Logger>,
    sleep: SleepFn,
}

impl<S: JobSender> RetryingDispatchStrategy<S> {
    /// Create a strategy around `sender`.
    pub fn new(
        sender: S,
        persistence: Arc<dyn Persistence>,
        policy: RetryPolicy,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            sender,
            persistence,
            policy,
            logger,
            sleep: Arc::new(thread::sleep),
        }
    }

    /// Replace how backoff delays are waited out.
    #[must_use]
    pub fn with_sleep_fn<F>(mut self, sleep: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleep = Arc::new(sleep);
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The wrapped sender.
    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Record a new job in the `Starting` state.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::JobExists`] if the identifier is taken, or
    /// a persistence error.
    pub fn create_job<I: Into<String>>(
        &self,
        id: I,
        media_ids: Vec<String>,
        position_percent: f64,
    ) -> Result<JobRecord, StillframeError> {
        let id = id.into();
        if self.persistence.job(&id)?.is_some() {
            return Err(StillframeError::JobExists(id));
        }
        let job = JobRecord::new(
            id,
            media_ids,
            position_percent.clamp(0.0, 100.0),
            self.policy.max_retries,
        );
        self.persistence.save_job(&job)?;
        self.persistence.flush()?;
        self.logger.log(
            Level::Info,
            "job created",
            &[
                ("job", job.id.clone()),
                ("items", job.total().to_string()),
            ],
        );
        Ok(job)
    }

    /// Load a job.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::UnknownJob`] if it does not exist.
    pub fn job(&self, job_id: &str) -> Result<JobRecord, StillframeError> {
        self.persistence
            .job(job_id)?
            .ok_or_else(|| StillframeError::UnknownJob(job_id.to_string()))
    }

    /// Send the job, retrying failures with backoff until it completes, is
    /// stopped, or exhausts its retries.
    ///
    /// Returns the final status (`Complete` or `Stopped`). A stop persisted
    /// while an attempt or a backoff sleep was in progress is never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// - [`StillframeError::RetriesExhausted`] once the retry counter reaches
    ///   its bound; the job is then `Error` and no further send is made.
    /// - [`StillframeError::JobTerminal`] if the job is already terminal.
    /// - [`StillframeError::UnknownJob`] or persistence errors.
    pub fn send(&self, job_id: &str) -> Result<JobStatus, StillframeError> {
        let mut job = self.job(job_id)?;
        if job.status.is_terminal() {
            return Err(StillframeError::JobTerminal {
                job_id: job.id,
                status: job.status.to_string(),
            });
        }

        loop {
            self.transition(&mut job, JobStatus::Running)?;

            let outcome = self.sender.send(&mut job);
            if self.stopped_meanwhile(job_id)? {
                return Ok(JobStatus::Stopped);
            }

            let error = match outcome {
                Ok(()) => {
                    job.retry.checkpoint = None;
                    job.progress_percent = 100.0;
                    self.transition(&mut job, JobStatus::Complete)?;
                    return Ok(job.status);
                }
                Err(StillframeError::Cancelled) => {
                    self.transition(&mut job, JobStatus::Stopped)?;
                    return Ok(job.status);
                }
                Err(error) => error,
            };

            job.retry.retry_count = job
                .retry
                .retry_count
                .saturating_add(1)
                .min(job.retry.max_retries);
            job.last_error = Some(error.to_string());

            if job.retry.is_exhausted() {
                job.retry.checkpoint = None;
                self.logger.log(
                    Level::Warn,
                    "job retries exhausted",
                    &[
                        ("job", job.id.clone()),
                        ("retries", job.retry.retry_count.to_string()),
                        ("error", error.to_string()),
                    ],
                );
                let message = error.to_string();
                self.transition(
                    &mut job,
                    JobStatus::Error {
                        message: message.clone(),
                    },
                )?;
                return Err(StillframeError::RetriesExhausted {
                    job_id: job.id,
                    attempts: job.retry.retry_count,
                    last_error: message,
                });
            }

            job.retry.checkpoint = Some(RecoveryCheckpoint::of(&job));
            self.transition(&mut job, JobStatus::Recovering)?;

            let delay = self.policy.delay_for(job.retry.retry_count);
            self.logger.log(
                Level::Warn,
                "job send failed, retrying",
                &[
                    ("job", job.id.clone()),
                    ("retry", job.retry.retry_count.to_string()),
                    ("max_retries", job.retry.max_retries.to_string()),
                    ("delay_ms", delay.as_millis().to_string()),
                    ("error", error.to_string()),
                ],
            );
            (self.sleep)(delay);

            if self.stopped_meanwhile(job_id)? {
                return Ok(JobStatus::Stopped);
            }
        }
    }

    /// Whether a stop request was persisted while this strategy held the job.
    ///
    /// A stored `Stopped` always wins over the in-memory record, which is left
    /// unsaved.
    fn stopped_meanwhile(&self, job_id: &str) -> Result<bool, StillframeError> {
        let stopped = self
            .persistence
            .job(job_id)?
            .is_some_and(|stored| stored.status == JobStatus::Stopped);
        if stopped {
            self.logger.log(
                Level::Info,
                "job stopped while in flight",
                &[("job", job_id.to_string())],
            );
        }
        Ok(stopped)
    }

    /// Deal with a job whose worker went away.
    ///
    /// The job is recoverable when it made partial progress
    /// (`0 < progress < 100`) or has restarts left; recoverable jobs are
    /// checkpointed, moved to `Recovering` and sent again. Others become
    /// `Failed { reason: "expired" }`. Terminal jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`send`](RetryingDispatchStrategy::send).
    pub fn handle_expired(&self, job_id: &str) -> Result<JobStatus, StillframeError> {
        let mut job = self.job(job_id)?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        let partial = job.progress_percent > 0.0 && job.progress_percent < 100.0;
        if partial || job.recovery_attempts < self.policy.max_recovery_attempts {
            job.retry.checkpoint = Some(RecoveryCheckpoint::of(&job));
            job.recovery_attempts = job.recovery_attempts.saturating_add(1);
            self.logger.log(
                Level::Info,
                "recovering expired job",
                &[
                    ("job", job.id.clone()),
                    ("progress", format!("{:.1}", job.progress_percent)),
                    ("recovery_attempts", job.recovery_attempts.to_string()),
                ],
            );
            self.transition(&mut job, JobStatus::Recovering)?;
            return self.send(job_id);
        }

        self.transition(
            &mut job,
            JobStatus::Failed {
                reason: "expired".to_string(),
            },
        )?;
        Ok(job.status)
    }

    /// Mark the job `Stopped`. A running batch notices before its next item;
    /// a decoder call already in flight is only bounded by its timeout.
    ///
    /// Terminal jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// [`StillframeError::UnknownJob`] or persistence errors.
    pub fn stop(&self, job_id: &str) -> Result<JobStatus, StillframeError> {
        let mut job = self.job(job_id)?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        job.retry.checkpoint = None;
        self.transition(&mut job, JobStatus::Stopped)?;
        Ok(job.status)
    }

    /// Remove a terminal job's record.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::JobActive`] if the job is not terminal.
    pub fn discard(&self, job_id: &str) -> Result<JobRecord, StillframeError> {
        let job = self.job(job_id)?;
        if !job.status.is_terminal() {
            return Err(StillframeError::JobActive {
                job_id: job.id,
                status: job.status.to_string(),
            });
        }
        self.persistence.remove_job(job_id)?;
        self.persistence.flush()?;
        self.logger
            .log(Level::Info, "job discarded", &[("job", job.id.clone())]);
        Ok(job)
    }

    fn transition(&self, job: &mut JobRecord, status: JobStatus) -> Result<(), StillframeError> {
        let previous = std::mem::replace(&mut job.status, status);
        self.persistence.save_job(job)?;
        self.persistence.flush()?;
        self.logger.log(
            Level::Info,
            "job state changed",
            &[
                ("job", job.id.clone()),
                ("from", previous.to_string()),
                ("to", job.status.to_string()),
            ],
        );
        Ok(())
    }
}
