//! Retrying dispatch strategy tests.
//!
//! Senders are plain closures; backoff sleeps are recorded instead of
//! waited out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stillframe::{
    JobRecord, JobStatus, JsonStore, Logger, MemoryLogger, Persistence, RetryPolicy,
    RetryingDispatchStrategy, StillframeError,
};

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        max_recovery_attempts: 1,
    }
}

struct Harness<S> {
    strategy: RetryingDispatchStrategy<S>,
    persistence: Arc<JsonStore>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

fn harness<S>(sender: S, policy: RetryPolicy) -> Harness<S>
where
    S: stillframe::JobSender,
{
    let persistence = Arc::new(JsonStore::in_memory());
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();
    let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
    let strategy = RetryingDispatchStrategy::new(sender, persistence.clone(), policy, logger)
        .with_sleep_fn(move |delay| recorded.lock().unwrap().push(delay));
    Harness {
        strategy,
        persistence,
        sleeps,
    }
}

fn failing_sender(calls: Arc<AtomicU32>, failures: u32) -> impl Fn(&mut JobRecord) -> Result<(), StillframeError> + Send + Sync {
    move |_job: &mut JobRecord| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            Err(StillframeError::Persistence(format!("attempt {call} failed")))
        } else {
            Ok(())
        }
    }
}

// ── send ───────────────────────────────────────────────────────────

#[test]
fn three_failures_with_three_retries_is_terminal() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), u32::MAX), policy(3));
    harness
        .strategy
        .create_job("job-1", vec!["a".into(), "b".into()], 10.0)
        .unwrap();

    let result = harness.strategy.send("job-1");

    match result {
        Err(StillframeError::RetriesExhausted {
            job_id, attempts, ..
        }) => {
            assert_eq!(job_id, "job-1");
            assert_eq!(attempts, 3);
        }
        other => panic!("Expected RetriesExhausted, got: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let job = harness.persistence.job("job-1").unwrap().unwrap();
    assert!(matches!(job.status, JobStatus::Error { .. }));
    assert_eq!(job.retry.retry_count, 3);
    assert!(job.retry.checkpoint.is_none());
    assert_eq!(job.last_error.as_deref(), Some("Persistence error: attempt 3 failed"));
    assert_eq!(
        *harness.sleeps.lock().unwrap(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
}

#[test]
fn terminal_job_is_never_sent_again() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), u32::MAX), policy(3));
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();
    assert!(harness.strategy.send("job-1").is_err());

    let again = harness.strategy.send("job-1");

    assert!(matches!(again, Err(StillframeError::JobTerminal { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn recovers_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), 2), policy(3));
    harness.strategy.create_job("job-1", vec!["a".into()], 10.0).unwrap();

    let status = harness.strategy.send("job-1").unwrap();

    assert_eq!(status, JobStatus::Complete);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let job = harness.strategy.job("job-1").unwrap();
    assert_eq!(job.retry.retry_count, 2);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.retry.checkpoint.is_none());
}

#[test]
fn zero_retries_fails_on_first_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), u32::MAX), policy(0));
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();

    assert!(matches!(
        harness.strategy.send("job-1"),
        Err(StillframeError::RetriesExhausted { attempts: 0, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(harness.sleeps.lock().unwrap().is_empty());
}

#[test]
fn checkpoint_is_recorded_between_attempts() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let sender = move |job: &mut JobRecord| -> Result<(), StillframeError> {
        observed
            .lock()
            .unwrap()
            .push((job.status.clone(), job.retry.checkpoint.clone()));
        if job.next_index == 0 {
            job.next_index = 2;
            job.progress_percent = 50.0;
            return Err(StillframeError::Persistence("disk full".to_string()));
        }
        Ok(())
    };
    let harness = harness(sender, policy(3));
    harness
        .strategy
        .create_job("job-1", vec!["a".into(), "b".into(), "c".into(), "d".into()], 10.0)
        .unwrap();

    harness.strategy.send("job-1").unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, JobStatus::Running);
    assert!(seen[0].1.is_none());
    let checkpoint = seen[1].1.clone().expect("checkpoint after failure");
    assert_eq!(checkpoint.last_item_index, Some(1));
    assert_eq!(checkpoint.progress_percent, 50.0);
}

#[test]
fn cancelled_send_is_stopped() {
    let harness = harness(
        |_job: &mut JobRecord| -> Result<(), StillframeError> { Err(StillframeError::Cancelled) },
        policy(3),
    );
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();

    assert_eq!(harness.strategy.send("job-1").unwrap(), JobStatus::Stopped);
    assert_eq!(harness.strategy.job("job-1").unwrap().retry.retry_count, 0);
}

#[test]
fn stop_during_backoff_ends_the_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let persistence = Arc::new(JsonStore::in_memory());
    let store = persistence.clone();
    let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
    let strategy = RetryingDispatchStrategy::new(
        failing_sender(calls.clone(), u32::MAX),
        persistence.clone(),
        policy(5),
        logger,
    )
    .with_sleep_fn(move |_| {
        let mut job = store.job("job-1").unwrap().unwrap();
        job.status = JobStatus::Stopped;
        store.save_job(&job).unwrap();
    });
    strategy.create_job("job-1", vec![], 10.0).unwrap();

    assert_eq!(strategy.send("job-1").unwrap(), JobStatus::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Persists a stop request for the job it is sending, then succeeds or fails.
fn stopping_sender(
    store: Arc<JsonStore>,
    calls: Arc<AtomicU32>,
    succeed: bool,
) -> impl Fn(&mut JobRecord) -> Result<(), StillframeError> + Send + Sync {
    move |job: &mut JobRecord| {
        calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = store.job(&job.id).unwrap().unwrap();
        stored.status = JobStatus::Stopped;
        store.save_job(&stored).unwrap();
        if succeed {
            Ok(())
        } else {
            Err(StillframeError::Persistence("disk full".to_string()))
        }
    }
}

#[test]
fn stop_during_a_failing_attempt_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let persistence = Arc::new(JsonStore::in_memory());
    let harness = {
        let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorded = sleeps.clone();
        let strategy = RetryingDispatchStrategy::new(
            stopping_sender(persistence.clone(), calls.clone(), false),
            persistence.clone(),
            policy(3),
            logger,
        )
        .with_sleep_fn(move |delay| recorded.lock().unwrap().push(delay));
        Harness {
            strategy,
            persistence,
            sleeps,
        }
    };
    harness.strategy.create_job("job-1", vec!["a".into()], 10.0).unwrap();

    assert_eq!(harness.strategy.send("job-1").unwrap(), JobStatus::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(harness.sleeps.lock().unwrap().is_empty());
    let stored = harness.persistence.job("job-1").unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Stopped);
    assert_eq!(stored.retry.retry_count, 0);
}

#[test]
fn stop_during_the_last_attempt_beats_completion() {
    let calls = Arc::new(AtomicU32::new(0));
    let persistence = Arc::new(JsonStore::in_memory());
    let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
    let strategy = RetryingDispatchStrategy::new(
        stopping_sender(persistence.clone(), calls.clone(), true),
        persistence.clone(),
        policy(3),
        logger,
    );
    strategy.create_job("job-1", vec!["a".into()], 10.0).unwrap();

    assert_eq!(strategy.send("job-1").unwrap(), JobStatus::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        persistence.job("job-1").unwrap().unwrap().status,
        JobStatus::Stopped
    );
    assert!(matches!(
        strategy.send("job-1"),
        Err(StillframeError::JobTerminal { .. })
    ));
}

#[test]
fn unknown_and_duplicate_jobs() {
    let harness = harness(failing_sender(Arc::new(AtomicU32::new(0)), 0), policy(3));
    assert!(matches!(
        harness.strategy.send("nope"),
        Err(StillframeError::UnknownJob(_))
    ));

    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();
    assert!(matches!(
        harness.strategy.create_job("job-1", vec![], 10.0),
        Err(StillframeError::JobExists(_))
    ));
}

// ── backoff ────────────────────────────────────────────────────────

#[test]
fn backoff_doubles_and_is_capped() {
    let policy = policy(10);
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    assert_eq!(policy.delay_for(5), Duration::from_secs(30));
    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
}

// ── handle_expired / stop / discard ────────────────────────────────

#[test]
fn expired_job_with_partial_progress_is_resumed() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), 0), policy(3));
    let mut job = harness
        .strategy
        .create_job("job-1", vec!["a".into(), "b".into()], 10.0)
        .unwrap();
    job.status = JobStatus::Running;
    job.next_index = 1;
    job.progress_percent = 50.0;
    job.recovery_attempts = 5;
    harness.persistence.save_job(&job).unwrap();

    let status = harness.strategy.handle_expired("job-1").unwrap();

    assert_eq!(status, JobStatus::Complete);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.strategy.job("job-1").unwrap().recovery_attempts, 6);
}

#[test]
fn expired_job_without_progress_gets_bounded_restarts() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), 0), policy(3));
    let mut job = harness.strategy.create_job("job-1", vec!["a".into()], 10.0).unwrap();
    job.status = JobStatus::Running;
    harness.persistence.save_job(&job).unwrap();

    // max_recovery_attempts is 1: the first expiry restarts the job.
    assert_eq!(
        harness.strategy.handle_expired("job-1").unwrap(),
        JobStatus::Complete
    );

    let mut job = harness.strategy.create_job("job-2", vec!["a".into()], 10.0).unwrap();
    job.status = JobStatus::Running;
    job.recovery_attempts = 1;
    harness.persistence.save_job(&job).unwrap();

    assert_eq!(
        harness.strategy.handle_expired("job-2").unwrap(),
        JobStatus::Failed {
            reason: "expired".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn expiring_a_terminal_job_changes_nothing() {
    let harness = harness(failing_sender(Arc::new(AtomicU32::new(0)), 0), policy(3));
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();
    harness.strategy.send("job-1").unwrap();

    assert_eq!(
        harness.strategy.handle_expired("job-1").unwrap(),
        JobStatus::Complete
    );
}

#[test]
fn stopped_job_is_terminal() {
    let calls = Arc::new(AtomicU32::new(0));
    let harness = harness(failing_sender(calls.clone(), 0), policy(3));
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();

    assert_eq!(harness.strategy.stop("job-1").unwrap(), JobStatus::Stopped);
    assert!(matches!(
        harness.strategy.send("job-1"),
        Err(StillframeError::JobTerminal { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn only_terminal_jobs_can_be_discarded() {
    let harness = harness(failing_sender(Arc::new(AtomicU32::new(0)), 0), policy(3));
    harness.strategy.create_job("job-1", vec![], 10.0).unwrap();

    assert!(matches!(
        harness.strategy.discard("job-1"),
        Err(StillframeError::JobActive { .. })
    ));

    harness.strategy.send("job-1").unwrap();
    harness.strategy.discard("job-1").unwrap();
    assert!(harness.persistence.job("job-1").unwrap().is_none());
}

#[test]
fn transitions_are_flushed_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let persistence = Arc::new(JsonStore::open(&path).unwrap());
    let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
    let strategy = RetryingDispatchStrategy::new(
        failing_sender(Arc::new(AtomicU32::new(0)), 1),
        persistence,
        policy(3),
        logger,
    )
    .with_sleep_fn(|_| {});

    strategy.create_job("job-1", vec!["a".into()], 10.0).unwrap();
    strategy.send("job-1").unwrap();

    let reopened = JsonStore::open(&path).unwrap();
    let job = reopened.job("job-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.retry.retry_count, 1);
}
