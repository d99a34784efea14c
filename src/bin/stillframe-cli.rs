use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::Level;
use serde_json::json;
use stillframe::{
    BatchSummary, BatchWorker, Configuration, ExtractOptions, ExtractionRequest,
    FilesystemStorage, FramePosition, FrameSampler, JobRecord, JsonStore, LogContext, Logger,
    MediaAsset, Persistence, ProgressCallback, ProgressInfo, RetryPolicy,
    RetryingDispatchStrategy, StillframeError, ThumbnailSynchronizer,
};

const CLI_AFTER_HELP: &str = "Examples:\n  stillframe probe input.mp4 --json\n  stillframe extract-frame input.mp4 --at 0:00:12.5 --out poster.jpg\n  stillframe register 42 videos/clip-42.mp4 --storage-root /srv/media\n  stillframe batch --percent 25 --progress\n  stillframe completions zsh > _stillframe";

#[derive(Debug, Parser)]
#[command(
    name = "stillframe",
    version,
    about = "Extract video thumbnails and keep their bookkeeping in sync",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long, global = true)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long, global = true)]
    overwrite: bool,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Decoder executable (overrides the configuration file).
    #[arg(long, global = true)]
    decoder: Option<PathBuf>,

    /// JSON state file holding media and job records.
    #[arg(long, global = true, default_value = "stillframe-state.json")]
    state: PathBuf,

    /// Root directory of the storage sources and thumbnails live in.
    #[arg(long, global = true, default_value = ".")]
    storage_root: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the duration of a video.
    #[command(
        about = "Probe a video's duration",
        after_help = "Examples:\n  stillframe probe input.mp4\n  stillframe probe input.mp4 --json"
    )]
    Probe {
        /// Input video path.
        input: PathBuf,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Extract one frame to a file.
    #[command(
        about = "Extract a single frame",
        after_help = "Examples:\n  stillframe extract-frame input.mp4 --at 12.5 --out frame.jpg\n  stillframe extract-frame input.mp4 --at 01:30 --out frame.jpg --fallback"
    )]
    ExtractFrame {
        /// Input video path.
        input: PathBuf,
        /// Timestamp (seconds, MM:SS or HH:MM:SS[.fff]).
        #[arg(long, default_value = "0")]
        at: String,
        /// Output JPEG path.
        #[arg(long)]
        out: PathBuf,
        /// Timeout in seconds per extraction (clamped to the configured bounds).
        #[arg(long)]
        timeout: Option<f64>,
        /// Try 25% of the duration and then 1s if the timestamp yields nothing.
        #[arg(long)]
        fallback: bool,
    },

    /// Extract evenly spaced frames to a directory.
    #[command(
        about = "Extract evenly spaced frames",
        after_help = "Examples:\n  stillframe extract-frames input.mp4 --out candidates --count 5 --progress"
    )]
    ExtractFrames {
        /// Input video path.
        input: PathBuf,
        /// Output directory.
        #[arg(long)]
        out: PathBuf,
        /// Number of frames (1-20).
        #[arg(long, default_value_t = 5)]
        count: u32,
    },

    /// Record a media item.
    Register {
        /// Media identifier.
        media_id: String,
        /// Storage path of the source video, relative to the storage root.
        source: String,
        /// MIME type.
        #[arg(long, default_value = "video/mp4")]
        mime_type: String,
        /// Storage identifier thumbnails are filed under (defaults to the media id).
        #[arg(long)]
        storage_id: Option<String>,
    },

    /// Generate thumbnails at the configured default position.
    Ingest {
        /// Media identifier.
        media_id: String,
    },

    /// Regenerate thumbnails at a chosen position.
    #[command(
        after_help = "Examples:\n  stillframe regenerate 42 --percent 50\n  stillframe regenerate 42 --at 00:00:07.25"
    )]
    Regenerate {
        /// Media identifier.
        media_id: String,
        /// Position as a percentage of the duration.
        #[arg(long, conflicts_with = "at")]
        percent: Option<f64>,
        /// Absolute timestamp (seconds, MM:SS or HH:MM:SS[.fff]).
        #[arg(long)]
        at: Option<String>,
    },

    /// Reconcile the thumbnail flag with storage.
    Sync {
        /// Media identifier; every registered item when omitted.
        media_id: Option<String>,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Regenerate many items as a retried job.
    #[command(
        after_help = "Examples:\n  stillframe batch\n  stillframe batch 42 43 --percent 25 --job nightly"
    )]
    Batch {
        /// Media identifiers; every registered item when omitted.
        media_ids: Vec<String>,
        /// Position as a percentage of the duration.
        #[arg(long)]
        percent: Option<f64>,
        /// Job identifier (generated when omitted).
        #[arg(long)]
        job: Option<String>,
    },

    /// Show one job or list all jobs.
    Job {
        /// Job identifier; every job when omitted.
        job_id: Option<String>,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Request a job to stop before its next item.
    Stop {
        /// Job identifier.
        job_id: String,
    },

    /// Recover (or give up on) a job whose worker went away.
    Expire {
        /// Job identifier.
        job_id: String,
    },

    /// Remove a finished job's record.
    Discard {
        /// Job identifier.
        job_id: String,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

struct TerminalLogger {
    max_level: Level,
}

impl Logger for TerminalLogger {
    fn log(&self, level: Level, message: &str, context: LogContext<'_>) {
        if level > self.max_level {
            return;
        }
        let label = match level {
            Level::Error => "error".red().bold(),
            Level::Warn => "warn".yellow().bold(),
            Level::Info => "info".cyan().bold(),
            Level::Debug | Level::Trace => "debug".dimmed(),
        };
        let context = context
            .iter()
            .map(|(key, value)| format!("{}={value}", key.dimmed()))
            .collect::<Vec<_>>()
            .join(" ");
        eprintln!("{label} {message} {context}");
    }
}

struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(0);
        let style =
            ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}")?;
        bar.set_style(style.progress_chars("##-"));
        Ok(Self { bar })
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Some(total) = info.total {
            self.bar.set_length(total);
        }
        self.bar.set_position(info.current);
        if let Some(remaining) = info.estimated_remaining {
            self.bar.set_message(format!("~{}s left", remaining.as_secs()));
        }
        if info.total.is_some_and(|total| info.current >= total) {
            self.bar.finish_with_message("done");
        }
    }
}

fn parse_timecode(value: &str) -> Result<f64, Box<dyn std::error::Error>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("time value cannot be empty".into());
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Ok(seconds.max(0.0));
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("invalid time format: {trimmed}").into());
    }

    let (hours, minutes, seconds_str) = if parts.len() == 3 {
        (parts[0].parse::<u64>()?, parts[1].parse::<u64>()?, parts[2])
    } else {
        (0_u64, parts[0].parse::<u64>()?, parts[1])
    };

    let seconds = seconds_str.parse::<f64>()?;
    let total_seconds = (hours as f64 * 3600.0) + (minutes as f64 * 60.0) + seconds;
    Ok(total_seconds.max(0.0))
}

fn parse_position(
    percent: Option<f64>,
    at: Option<&str>,
    default_percent: f64,
) -> Result<FramePosition, Box<dyn std::error::Error>> {
    match (percent, at) {
        (Some(_), Some(_)) => Err("use either --percent or --at, not both".into()),
        (Some(percent), None) if !(0.0..=100.0).contains(&percent) => {
            Err(format!("--percent must be within 0-100, got {percent}").into())
        }
        (Some(percent), None) => Ok(FramePosition::Percent(percent)),
        (None, Some(at)) => Ok(FramePosition::Seconds(parse_timecode(at)?)),
        (None, None) => Ok(FramePosition::Percent(default_percent)),
    }
}

fn default_job_id(now: SystemTime) -> String {
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("batch-{seconds}")
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

/// Components wired once per invocation.
struct Context {
    configuration: Arc<Configuration>,
    logger: Arc<dyn Logger>,
    persistence: Arc<JsonStore>,
    synchronizer: ThumbnailSynchronizer,
}

impl Context {
    fn build(global: &GlobalOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let mut configuration = match &global.config {
            Some(path) => Configuration::from_json_file(path)?,
            None => Configuration::new(),
        };
        if let Some(decoder) = &global.decoder {
            configuration = configuration.with_decoder_path(decoder);
        }
        configuration.validate()?;
        let configuration = Arc::new(configuration);

        let logger: Arc<dyn Logger> = Arc::new(TerminalLogger {
            max_level: if global.verbose {
                Level::Debug
            } else {
                Level::Warn
            },
        });
        let persistence = Arc::new(JsonStore::open(&global.state)?);
        let sampler = FrameSampler::from_configuration(configuration.clone(), logger.clone());
        let synchronizer = ThumbnailSynchronizer::new(
            Arc::new(FilesystemStorage::new(&global.storage_root)),
            persistence.clone(),
            sampler,
            logger.clone(),
        );

        Ok(Self {
            configuration,
            logger,
            persistence,
            synchronizer,
        })
    }

    fn options(&self, global: &GlobalOptions) -> Result<ExtractOptions, Box<dyn std::error::Error>> {
        let mut options = ExtractOptions::new();
        if global.progress {
            options = options.with_progress(Arc::new(TerminalProgress::new()?));
        }
        Ok(options)
    }

    fn strategy(
        &self,
        options: ExtractOptions,
    ) -> RetryingDispatchStrategy<BatchWorker> {
        let worker = BatchWorker::new(self.synchronizer.clone(), self.logger.clone())
            .with_options(options);
        RetryingDispatchStrategy::new(
            worker,
            self.persistence.clone(),
            RetryPolicy::from_configuration(&self.configuration),
            self.logger.clone(),
        )
    }
}

fn print_summary(job: &JobRecord) {
    let summary = BatchSummary::of(job);
    println!(
        "{} {} processed, {} failed, {} total ({})",
        "batch:".bold(),
        summary.processed.to_string().green(),
        summary.failed.to_string().red(),
        summary.total,
        job.status
    );
}

fn job_json(job: &JobRecord) -> serde_json::Value {
    json!({
        "id": job.id,
        "status": job.status.to_string(),
        "items": job.total(),
        "processed": job.processed,
        "failed": job.failed,
        "progress_percent": job.progress_percent,
        "retry_count": job.retry.retry_count,
        "max_retries": job.retry.max_retries,
        "recovery_attempts": job.recovery_attempts,
        "last_error": job.last_error,
    })
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "stillframe", &mut std::io::stdout());
        return Ok(());
    }

    let context = Context::build(&cli.global)?;
    let sampler = context.synchronizer.sampler();

    match cli.command {
        Commands::Probe { input, json } => {
            let probed = sampler.probe().probe(&input);
            let estimate = sampler.probe().estimate_from(&input, probed);
            if json {
                let payload = json!({
                    "path": input.display().to_string(),
                    "probed_seconds": probed,
                    "estimated_seconds": estimate.seconds,
                    "confidence": format!("{:?}", estimate.confidence).to_lowercase(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if probed > 0.0 {
                println!("Duration: {probed:.3}s");
            } else {
                println!(
                    "Duration: unknown (assuming {:.1}s)",
                    estimate.seconds
                );
            }
        }
        Commands::ExtractFrame {
            input,
            at,
            out,
            timeout,
            fallback,
        } => {
            ensure_writable_path(&out, cli.global.overwrite)?;
            let timestamp = parse_timecode(&at)?;
            let timeout = timeout
                .map(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)))
                .transpose()?;

            let frame = if fallback {
                let duration = sampler.probe().estimate(&input).seconds;
                sampler
                    .extract_with_fallback_within(&input, timestamp, duration, timeout)?
                    .map(|frame| -> Result<_, StillframeError> {
                        let timestamp = frame.timestamp;
                        let kept = frame.keep()?;
                        fs::copy(&kept, &out)?;
                        fs::remove_file(&kept)?;
                        Ok(timestamp)
                    })
                    .transpose()?
            } else {
                let mut request = ExtractionRequest::new(&input, timestamp).with_output(&out);
                if let Some(timeout) = timeout {
                    request = request.with_timeout(timeout);
                }
                sampler.extract(&request)?.map(|frame| frame.timestamp)
            };

            match frame {
                Some(taken_at) => println!(
                    "{} {} ({taken_at:.3}s)",
                    "saved".green().bold(),
                    out.display()
                ),
                None => return Err(format!("no frame could be extracted from {}", input.display()).into()),
            }
        }
        Commands::ExtractFrames { input, out, count } => {
            if out.exists() && !cli.global.overwrite {
                return Err(format!(
                    "output directory already exists: {} (use --overwrite)",
                    out.display()
                )
                .into());
            }
            fs::create_dir_all(&out)?;

            let options = context.options(&cli.global)?;
            let frames = sampler.extract_frames_with_options(&input, count, &options)?;
            for frame in &frames {
                let index = frame.index.unwrap_or_default();
                let output_path = out.join(format!("frame_{index:02}_{:.3}s.jpg", frame.timestamp));
                fs::copy(frame.path(), &output_path)?;
                if cli.global.verbose {
                    eprintln!("saved frame {index} -> {}", output_path.display());
                }
            }

            println!(
                "{} {}",
                "success:".green().bold(),
                format!("Extracted {} frame(s) to {}", frames.len(), out.display()).green()
            );
        }
        Commands::Register {
            media_id,
            source,
            mime_type,
            storage_id,
        } => {
            let storage_id = storage_id.unwrap_or_else(|| media_id.clone());
            let asset = MediaAsset::new(storage_id, source, mime_type);
            let has_thumbnails = context.synchronizer.register(&media_id, asset)?;
            println!(
                "{} {media_id} (has_thumbnails={has_thumbnails})",
                "registered".green().bold()
            );
        }
        Commands::Ingest { media_id } => {
            if context.synchronizer.ingest(&media_id) {
                println!("{} {media_id}", "ingested".green().bold());
            } else {
                return Err(format!("thumbnail generation failed for {media_id}").into());
            }
        }
        Commands::Regenerate {
            media_id,
            percent,
            at,
        } => {
            let position = parse_position(
                percent,
                at.as_deref(),
                context.configuration.default_position_percent,
            )?;
            if context.synchronizer.try_regenerate(&media_id, position)? {
                println!("{} {media_id}", "regenerated".green().bold());
            } else {
                return Err(format!("derivatives for {media_id} are incomplete").into());
            }
        }
        Commands::Sync { media_id, json } => {
            let media_ids = match media_id {
                Some(media_id) => vec![media_id],
                None => context.persistence.media_ids()?,
            };
            let mut results = Vec::with_capacity(media_ids.len());
            for media_id in media_ids {
                let has_thumbnails = context.synchronizer.synchronize(&media_id)?;
                results.push((media_id, has_thumbnails));
            }

            if json {
                let payload: Vec<_> = results
                    .iter()
                    .map(|(media_id, has_thumbnails)| {
                        json!({ "media_id": media_id, "has_thumbnails": has_thumbnails })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for (media_id, has_thumbnails) in results {
                    let marker = if has_thumbnails {
                        "ok".green().bold()
                    } else {
                        "missing".red().bold()
                    };
                    println!("{marker} {media_id}");
                }
            }
        }
        Commands::Batch {
            media_ids,
            percent,
            job,
        } => {
            let percent = percent.unwrap_or(context.configuration.default_position_percent);
            if !(0.0..=100.0).contains(&percent) {
                return Err(format!("--percent must be within 0-100, got {percent}").into());
            }
            let media_ids = if media_ids.is_empty() {
                context.persistence.media_ids()?
            } else {
                media_ids
            };
            let job_id = job.unwrap_or_else(|| default_job_id(SystemTime::now()));

            let strategy = context.strategy(context.options(&cli.global)?);
            strategy.create_job(&job_id, media_ids, percent)?;
            let outcome = strategy.send(&job_id);
            print_summary(&strategy.job(&job_id)?);
            outcome?;
        }
        Commands::Job { job_id, json } => {
            let jobs = match job_id {
                Some(job_id) => vec![
                    context
                        .persistence
                        .job(&job_id)?
                        .ok_or(StillframeError::UnknownJob(job_id))?,
                ],
                None => context.persistence.jobs()?,
            };
            if json {
                let payload: Vec<_> = jobs.iter().map(job_json).collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for job in &jobs {
                    println!(
                        "{} {} {:.1}% retries {}/{}",
                        job.id.bold(),
                        job.status,
                        job.progress_percent,
                        job.retry.retry_count,
                        job.retry.max_retries
                    );
                }
            }
        }
        Commands::Stop { job_id } => {
            let status = context.strategy(ExtractOptions::new()).stop(&job_id)?;
            println!("{} {job_id} ({status})", "stop".yellow().bold());
        }
        Commands::Expire { job_id } => {
            let strategy = context.strategy(context.options(&cli.global)?);
            let outcome = strategy.handle_expired(&job_id);
            print_summary(&strategy.job(&job_id)?);
            outcome?;
        }
        Commands::Discard { job_id } => {
            context.strategy(ExtractOptions::new()).discard(&job_id)?;
            println!("{} {job_id}", "discarded".green().bold());
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
