//! Bounded external-process execution.
//!
//! [`ProcessRunner`] launches a command with stdin closed, drains stdout and
//! stderr incrementally on reader threads, and polls the child at a fixed
//! tick until it exits or its deadline passes. On timeout the whole process
//! group is sent a termination signal, then killed (at most twice), and the
//! call returns [`StillframeError::Timeout`] whatever the final state. A
//! zombie is acceptable; a hang is not.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use stillframe::ProcessRunner;
//!
//! let runner = ProcessRunner::new();
//! let output = runner.run("ffmpeg", &["-version"], Duration::from_secs(5))?;
//! println!("{}", output.stdout_text());
//! # Ok::<(), stillframe::StillframeError>(())
//! ```

use std::ffi::OsStr;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::{ErrorKind, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use log::Level;
use serde::{Deserialize, Serialize};

use crate::configuration::seconds;
use crate::error::StillframeError;
use crate::logging::{Logger, default_logger};

/// Interval between liveness checks of a running child.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a signalled child gets to exit before the next escalation step.
pub const TERMINATION_GRACE: Duration = Duration::from_millis(250);

/// Number of forceful kill attempts after the initial termination signal.
pub const MAX_KILL_ESCALATIONS: u32 = 2;

/// How long output is still collected after the child has exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Inclusive range every timeout is clamped into before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutBounds {
    /// Shortest permitted timeout.
    #[serde(with = "seconds")]
    pub min: Duration,
    /// Longest permitted timeout.
    #[serde(with = "seconds")]
    pub max: Duration,
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl TimeoutBounds {
    /// Create bounds; the arguments are reordered if given backwards.
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Clamp `timeout` into the bounds.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.max(self.min).min(self.max)
    }
}

/// Everything a finished child produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit status reported by the operating system.
    pub status: ExitStatus,
    /// Bytes written to stdout.
    pub stdout: Vec<u8>,
    /// Bytes written to stderr.
    pub stderr: Vec<u8>,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Returns `true` if the child exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Numeric exit code, if the child was not terminated by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, decoded lossily.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    Closed,
}

#[derive(Default)]
struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open_streams: usize,
}

impl OutputBuffer {
    fn absorb(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Data(Stream::Stdout, bytes) => self.stdout.extend_from_slice(&bytes),
            Chunk::Data(Stream::Stderr, bytes) => self.stderr.extend_from_slice(&bytes),
            Chunk::Closed => self.open_streams = self.open_streams.saturating_sub(1),
        }
    }

    /// Take whatever is available right now without blocking.
    fn drain(&mut self, receiver: &Receiver<Chunk>) {
        loop {
            match receiver.try_recv() {
                Ok(chunk) => self.absorb(chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Collect trailing output after exit, for at most `window`.
    fn finish(&mut self, receiver: &Receiver<Chunk>, window: Duration) {
        let until = Instant::now() + window;
        while self.open_streams > 0 {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match receiver.recv_timeout(remaining) {
                Ok(chunk) => self.absorb(chunk),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn spawn_reader<R>(mut reader: R, stream: Stream, sender: Sender<Chunk>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    if sender.send(Chunk::Data(stream, buffer[..read].to_vec())).is_err() {
                        return;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = sender.send(Chunk::Closed);
    });
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // preconditions. The child has not been reaped yet, so its pid (and the
    // process group it leads) still belongs to it.
    unsafe {
        libc::kill(-pid, signal);
        libc::kill(pid, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: Signal) {
    let _ = child.kill();
}

/// Poll `child` until it exits or `grace` elapses. Returns `true` on exit.
fn wait_briefly(child: &mut Child, grace: Duration) -> bool {
    let until = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return false,
        }
        let now = Instant::now();
        if now >= until {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(until - now));
    }
}

/// Runs external commands under a wall-clock bound.
///
/// The runner owns no state between calls beyond its bounds and logger, so a
/// single instance (or any clone of it) can run independent commands
/// concurrently.
#[derive(Clone)]
pub struct ProcessRunner {
    bounds: TimeoutBounds,
    logger: Arc<dyn Logger>,
}

impl Debug for ProcessRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ProcessRunner")
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    /// Create a runner with the default 1-60 s bounds, logging through the
    /// `log` facade.
    pub fn new() -> Self {
        Self {
            bounds: TimeoutBounds::default(),
            logger: default_logger(),
        }
    }

    /// Replace the timeout bounds.
    #[must_use]
    pub fn with_bounds(mut self, bounds: TimeoutBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Replace the logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// The bounds every timeout is clamped into.
    pub fn bounds(&self) -> TimeoutBounds {
        self.bounds
    }

    /// The timeout actually applied for a requested `timeout`.
    pub fn effective_timeout(&self, timeout: Duration) -> Duration {
        self.bounds.clamp(timeout)
    }

    /// Run `program` with `args`, waiting at most `timeout` (after clamping).
    ///
    /// A non-zero exit is not an error; inspect
    /// [`ProcessOutput::success`].
    ///
    /// # Errors
    ///
    /// - [`StillframeError::Spawn`] if the program cannot be launched.
    /// - [`StillframeError::Timeout`] if it is still running at the deadline;
    ///   the process group has been signalled before this returns.
    /// - [`StillframeError::Io`] if the child's status cannot be queried.
    pub fn run<P, A>(
        &self,
        program: P,
        args: &[A],
        timeout: Duration,
    ) -> Result<ProcessOutput, StillframeError>
    where
        P: AsRef<OsStr>,
        A: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let program_name = program.to_string_lossy().into_owned();
        let timeout = self.effective_timeout(timeout);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        self.logger.log(
            Level::Debug,
            "spawning process",
            &[
                ("program", program_name.clone()),
                (
                    "args",
                    args.iter()
                        .map(|arg| arg.as_ref().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                ("timeout_ms", timeout.as_millis().to_string()),
            ],
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| StillframeError::Spawn {
            program: program_name.clone(),
            source,
        })?;

        let (sender, receiver) = mpsc::channel();
        let mut output = OutputBuffer::default();
        if let Some(stdout) = child.stdout.take() {
            output.open_streams += 1;
            spawn_reader(stdout, Stream::Stdout, sender.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output.open_streams += 1;
            spawn_reader(stderr, Stream::Stderr, sender.clone());
        }
        drop(sender);

        let deadline = started + timeout;
        loop {
            output.drain(&receiver);
            match child.try_wait() {
                Ok(Some(status)) => {
                    output.finish(&receiver, DRAIN_WINDOW);
                    let elapsed = started.elapsed();
                    self.logger.log(
                        Level::Debug,
                        "process exited",
                        &[
                            ("program", program_name),
                            ("status", status.to_string()),
                            ("elapsed_ms", elapsed.as_millis().to_string()),
                        ],
                    );
                    return Ok(ProcessOutput {
                        status,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        elapsed,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    self.terminate(&mut child, &program_name);
                    return Err(StillframeError::Io(error));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        self.logger.log(
            Level::Warn,
            "process timed out, terminating",
            &[
                ("program", program_name.clone()),
                ("timeout_ms", timeout.as_millis().to_string()),
            ],
        );
        self.terminate(&mut child, &program_name);

        Err(StillframeError::Timeout {
            program: program_name,
            timeout,
        })
    }

    /// Signal, wait, then kill at most [`MAX_KILL_ESCALATIONS`] times.
    ///
    /// Returns `true` if the child was observed to exit.
    fn terminate(&self, child: &mut Child, program: &str) -> bool {
        send_signal(child, Signal::Terminate);
        if wait_briefly(child, TERMINATION_GRACE) {
            return true;
        }

        for escalation in 1..=MAX_KILL_ESCALATIONS {
            self.logger.log(
                Level::Warn,
                "process ignored termination, killing",
                &[
                    ("program", program.to_string()),
                    ("escalation", escalation.to_string()),
                ],
            );
            send_signal(child, Signal::Kill);
            let _ = child.kill();
            if wait_briefly(child, TERMINATION_GRACE) {
                return true;
            }
        }

        self.logger.log(
            Level::Error,
            "process survived kill escalation, giving up",
            &[("program", program.to_string()), ("pid", child.id().to_string())],
        );
        false
    }
}
