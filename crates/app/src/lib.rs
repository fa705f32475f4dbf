use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::arch::ArchitectureDetector;
use upscaler_core::backend::select_backend;
use upscaler_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use upscaler_core::diagnostics::DoctorReport;
use upscaler_core::error::{is_cancelled, UpscaleError};
use upscaler_core::logging::{
    self, FileSink, LoggingInitOptions, PanicHookInstall, DEFAULT_LOG_FILTER,
};
use upscaler_core::model_store::ModelStore;
use upscaler_core::pipeline::{
    discover, output_path_for, BatchOptions, BatchReport, FileJob, MediaFilter, MediaKind,
    NullProgress, Pipeline, ProgressEvent, ProgressSink, ProgressTracker,
};

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "upscaler",
    version,
    about = "Tiled super-resolution for images and video"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        global = true,
        help = "Data directory holding config.toml, logs and models"
    )]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a single image
    Image(ImageArgs),
    /// Upscale a video file, or a Y4M stream on stdin/stdout
    Video(VideoArgs),
    /// Upscale every matching file in a directory
    #[command(alias = "batch")]
    All(BatchArgs),
    /// List, download, verify or remove catalog models
    Models(ModelsArgs),
    /// Identify the architecture and scale of a checkpoint
    Detect(DetectArgs),
    /// Report which tools and backends are usable here
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum ProgressMode {
    #[default]
    Bar,
    Json,
    None,
}

#[derive(Args, Debug, Default)]
struct ProcessingArgs {
    #[arg(long, value_name = "NAME", help = "auto, ncnn, onnx or classical")]
    backend: Option<String>,
    #[arg(long, value_name = "NAME|PATH", help = "Catalog model name or model file")]
    model: Option<String>,
    #[arg(long)]
    scale: Option<u32>,
    #[arg(long, value_name = "PX", help = "Tile edge in pixels (0 = pick from free memory)")]
    tile: Option<usize>,
    #[arg(long, value_name = "PX")]
    tile_overlap: Option<usize>,
    #[arg(long, overrides_with = "no_preserve_tone")]
    preserve_tone: bool,
    #[arg(long, overrides_with = "preserve_tone")]
    no_preserve_tone: bool,
    #[arg(long, help = "Half-precision inference on the onnx backend")]
    fp16: bool,
    #[arg(long, value_name = "cuda|tensorrt|cpu")]
    execution: Option<String>,
    #[arg(long, value_enum, default_value_t = ProgressMode::Bar)]
    progress: ProgressMode,
}

#[derive(Args, Debug)]
struct ImageArgs {
    input: PathBuf,
    /// Defaults to `<stem>_upscaled.<ext>` next to the input
    output: Option<PathBuf>,
    #[command(flatten)]
    processing: ProcessingArgs,
}

#[derive(Args, Debug)]
struct VideoArgs {
    /// `INPUT [OUTPUT]`; with --stdin only OUTPUT, with --stdout only INPUT
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
    #[arg(long, help = "Read a Y4M stream from standard input")]
    stdin: bool,
    #[arg(long, help = "Write the upscaled Y4M stream to standard output")]
    stdout: bool,
    #[arg(long, overrides_with = "no_copy_audio")]
    copy_audio: bool,
    #[arg(long, overrides_with = "copy_audio")]
    no_copy_audio: bool,
    #[command(flatten)]
    processing: ProcessingArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(default_value = ".")]
    root: PathBuf,
    #[arg(long = "type", value_name = "image|video|all", default_value = "all")]
    media_type: String,
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
    #[arg(long, default_value = "*", help = "File name pattern with * and ? wildcards")]
    pattern: String,
    #[arg(short, long)]
    recursive: bool,
    #[arg(long)]
    skip_existing: bool,
    #[arg(long, help = "List what would be processed and exit")]
    dry_run: bool,
    #[command(flatten)]
    processing: ProcessingArgs,
}

#[derive(Args, Debug)]
struct ModelsArgs {
    #[arg(long)]
    list: bool,
    #[arg(long, value_name = "NAME")]
    download: Option<String>,
    #[arg(long, requires = "download", help = "Download even if a verified copy exists")]
    force: bool,
    #[arg(long, value_name = "NAME")]
    check: Option<String>,
    #[arg(long, help = "Remove downloaded catalog models and partial downloads")]
    clean: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct DetectArgs {
    #[arg(value_name = "MODEL", help = "Checkpoint path or catalog model name")]
    model: String,
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct DoctorArgs {
    #[arg(long)]
    json: bool,
}

struct RunContext {
    data_dir: PathBuf,
    config: AppConfig,
    cancel: CancellationToken,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    upscaler_core::runtime::setup_runtime_libs();
    let config = load_config(&resolved_data_dir);
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    upscaler_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current frame");
            signal_token.cancel();
        }
    });

    let ctx = RunContext {
        data_dir: resolved_data_dir,
        config,
        cancel,
    };
    // Inference, subprocess waits and blocking downloads all run off the runtime.
    tokio::task::spawn_blocking(move || run_command(cli.command, ctx))
        .await
        .context("worker thread panicked")?
}

/// Process exit code for a failed run.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if is_cancelled(error) {
        EXIT_CANCELLED
    } else {
        EXIT_FAILURE
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e:#}. Using default settings.");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let panic_hook = logging::install_panic_hook(Some(data_dir));
    if let PanicHookInstall::Skipped {
        attempted_crash_dir,
        reason,
    } = &panic_hook
    {
        let attempted = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash reports disabled (path: {attempted}; reason: {reason}). Panics will not be persisted."
        );
    }

    let options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let filters = logging::compose_log_filters(&options);
    let console_filter = parse_env_filter_with_fallback(&filters.console, "console");

    match logging::build_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
        }
        FileSink::Unavailable {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn run_command(command: Commands, mut ctx: RunContext) -> Result<()> {
    match command {
        Commands::Image(args) => {
            apply_overrides(&mut ctx.config, &args.processing);
            let output = args
                .output
                .unwrap_or_else(|| default_output(&args.input));
            let job = FileJob {
                input: args.input,
                output,
                kind: MediaKind::Image,
                frames: 1,
            };
            let mut pipeline = build_pipeline(&ctx)?;
            let mut sink = progress_sink(args.processing.progress);
            batch_outcome(pipeline.run_batch(&[job], sink.as_mut()))
        }
        Commands::Video(args) => {
            apply_overrides(&mut ctx.config, &args.processing);
            if args.copy_audio {
                ctx.config.processing.copy_audio = true;
            } else if args.no_copy_audio {
                ctx.config.processing.copy_audio = false;
            }
            let mode = video_mode(&args)?;
            let mut pipeline = build_pipeline(&ctx)?;
            let mut sink = progress_sink(args.processing.progress);
            run_video(&mut pipeline, mode, sink.as_mut())
        }
        Commands::All(args) => {
            apply_overrides(&mut ctx.config, &args.processing);
            run_batch_command(&ctx, &args)
        }
        Commands::Models(args) => run_models(&ctx, &args),
        Commands::Detect(args) => run_detect(&ctx, &args),
        Commands::Doctor(args) => {
            let report = DoctorReport::collect(&ctx.data_dir, &models_dir(&ctx));
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            Ok(())
        }
    }
}

fn apply_overrides(config: &mut AppConfig, args: &ProcessingArgs) {
    let processing = &mut config.processing;
    if let Some(backend) = &args.backend {
        processing.backend = backend.clone();
    }
    if let Some(model) = &args.model {
        processing.model = model.clone();
    }
    if let Some(scale) = args.scale {
        processing.scale = scale;
    }
    if let Some(tile) = args.tile {
        processing.tile = tile;
    }
    if let Some(overlap) = args.tile_overlap {
        processing.tile_overlap = overlap;
    }
    if args.preserve_tone {
        processing.preserve_tone = true;
    } else if args.no_preserve_tone {
        processing.preserve_tone = false;
    }
    if args.fp16 {
        processing.fp16 = true;
    }
    if let Some(execution) = &args.execution {
        processing.execution = execution.clone();
    }
}

fn models_dir(ctx: &RunContext) -> PathBuf {
    resolve_relative_to(&ctx.data_dir, &ctx.config.paths.models_dir)
}

fn build_pipeline(ctx: &RunContext) -> Result<Pipeline> {
    let preference = ctx.config.backend_preference()?;
    let backend = select_backend(preference, &ctx.config.backend_options(&ctx.data_dir))?;
    Ok(Pipeline::new(
        backend,
        ctx.config.pipeline_options(),
        ctx.cancel.clone(),
    ))
}

fn default_output(input: &Path) -> PathBuf {
    let dir = input.parent().unwrap_or_else(|| Path::new(""));
    output_path_for(input, dir, dir, false)
}

#[derive(Debug, PartialEq, Eq)]
enum VideoMode {
    File { input: PathBuf, output: PathBuf },
    FromStdin { output: PathBuf },
    ToStdout { input: PathBuf },
    Pipe,
}

fn video_mode(args: &VideoArgs) -> Result<VideoMode> {
    Ok(match (args.stdin, args.stdout, args.paths.as_slice()) {
        (false, false, [input]) => VideoMode::File {
            input: input.clone(),
            output: default_output(input),
        },
        (false, false, [input, output]) => VideoMode::File {
            input: input.clone(),
            output: output.clone(),
        },
        (true, false, [output]) => VideoMode::FromStdin {
            output: output.clone(),
        },
        (false, true, [input]) => VideoMode::ToStdout {
            input: input.clone(),
        },
        (true, true, []) => VideoMode::Pipe,
        (true, false, _) => bail!("--stdin takes exactly one path: the output file"),
        (false, true, _) => bail!("--stdout takes exactly one path: the input file"),
        (true, true, _) => bail!("--stdin with --stdout takes no paths"),
        (false, false, _) => bail!("expected INPUT [OUTPUT]"),
    })
}

fn run_video(pipeline: &mut Pipeline, mode: VideoMode, sink: &mut dyn ProgressSink) -> Result<()> {
    match mode {
        VideoMode::File { input, output } => {
            let job = FileJob {
                input,
                output,
                kind: MediaKind::Video,
                frames: 1,
            };
            let jobs = pipeline.plan_jobs(vec![job]);
            batch_outcome(pipeline.run_batch(&jobs, sink))
        }
        VideoMode::FromStdin { output } => {
            run_stream(sink, PathBuf::from("-"), output.clone(), 0, |tracker| {
                pipeline.process_stdin(&output, tracker)
            })
        }
        VideoMode::ToStdout { input } => {
            let probe = FileJob {
                input: input.clone(),
                output: PathBuf::from("-"),
                kind: MediaKind::Video,
                frames: 1,
            };
            let frames = pipeline
                .plan_jobs(vec![probe])
                .first()
                .map_or(0, |job| job.frames);
            run_stream(sink, input.clone(), PathBuf::from("-"), frames, |tracker| {
                pipeline.process_to_stdout(&input, tracker)
            })
        }
        VideoMode::Pipe => run_stream(sink, PathBuf::from("-"), PathBuf::from("-"), 0, |tracker| {
            let stdin = io::stdin();
            let stdout = io::stdout();
            pipeline.stream_y4m(BufReader::new(stdin.lock()), stdout.lock(), tracker)
        }),
    }
}

/// Single stream with an unknown or probed length, reported like a one-file batch.
fn run_stream(
    sink: &mut dyn ProgressSink,
    input: PathBuf,
    output: PathBuf,
    frames: u64,
    work: impl FnOnce(&mut ProgressTracker<'_>) -> Result<u64>,
) -> Result<()> {
    let mut tracker = ProgressTracker::new(&[frames], sink);
    tracker.start_file(input, frames);
    match work(&mut tracker) {
        Ok(_) => {
            tracker.finish_file(output);
            tracker.finish_batch(1, 0);
            Ok(())
        }
        Err(e) => {
            tracker.fail_file(&e);
            tracker.finish_batch(0, 1);
            Err(e)
        }
    }
}

fn run_batch_command(ctx: &RunContext, args: &BatchArgs) -> Result<()> {
    let options = BatchOptions {
        root: args.root.clone(),
        output_dir: args.output.clone(),
        filter: args.media_type.parse::<MediaFilter>()?,
        pattern: args.pattern.clone(),
        recursive: args.recursive,
        skip_existing: args.skip_existing,
    };
    let jobs = discover(&options)?;
    if jobs.is_empty() {
        info!(root = %options.root.display(), "No matching files");
        return Ok(());
    }

    if args.dry_run {
        for job in &jobs {
            println!("{} -> {}", job.input.display(), job.output.display());
        }
        println!("{} file(s)", jobs.len());
        return Ok(());
    }

    let mut pipeline = build_pipeline(ctx)?;
    let jobs = pipeline.plan_jobs(jobs);
    info!(
        files = jobs.len(),
        frames = jobs.iter().map(|j| j.frames).sum::<u64>(),
        backend = pipeline.upscaler().backend_name(),
        "Starting batch"
    );
    let mut sink = progress_sink(args.processing.progress);
    batch_outcome(pipeline.run_batch(&jobs, sink.as_mut()))
}

/// Collapse a report into the command's result. A lone failure keeps its own
/// error so the exit message names the real cause.
fn batch_outcome(mut report: BatchReport) -> Result<()> {
    if report.cancelled {
        return Err(UpscaleError::Cancelled.into());
    }
    match report.failed.len() {
        0 => Ok(()),
        1 if report.succeeded.is_empty() => Err(report.failed.remove(0).1),
        failed => {
            let names: Vec<String> = report
                .failed
                .iter()
                .map(|(path, _)| path.display().to_string())
                .collect();
            bail!(
                "{failed} of {} files failed: {}",
                failed + report.succeeded.len(),
                names.join(", ")
            )
        }
    }
}

fn run_models(ctx: &RunContext, args: &ModelsArgs) -> Result<()> {
    let store = ModelStore::new(models_dir(ctx));

    if args.list {
        return list_models(&store, args.json);
    }

    if args.clean {
        let removed = store.clean()?;
        println!("Removed {removed} file(s) from {}", store.models_dir().display());
        return Ok(());
    }

    if let Some(name) = &args.download {
        let path = store.download(name, args.force)?;
        println!("{name}: {}", path.display());
        return Ok(());
    }

    if let Some(name) = &args.check {
        if store.is_downloaded(name)? {
            println!("{name}: ok ({})", store.model_path(name)?.display());
            return Ok(());
        }
        bail!("{name} is not downloaded (run `upscaler models --download {name}`)");
    }

    list_models(&store, args.json)
}

fn list_models(store: &ModelStore, json: bool) -> Result<()> {
    let statuses = store.statuses()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for status in &statuses {
        let state = if status.downloaded { "downloaded" } else { "-" };
        println!(
            "{:<32} x{} {:<12} {:<11} {}",
            status.entry.name,
            status.entry.scale,
            format!("{:?}", status.entry.format).to_lowercase(),
            state,
            status.entry.description
        );
    }
    Ok(())
}

fn run_detect(ctx: &RunContext, args: &DetectArgs) -> Result<()> {
    let path = ModelStore::new(models_dir(ctx)).resolve(&args.model)?;
    let detector = if args.no_cache {
        ArchitectureDetector::without_cache()
    } else {
        ArchitectureDetector::new()
    };
    let (descriptor, cached) = detector.detect(&path)?;

    if args.json {
        let value = serde_json::json!({
            "path": path,
            "architecture": descriptor.name,
            "scale": descriptor.scale(),
            "confidence": descriptor.confidence,
            "trusted": descriptor.is_trusted(),
            "params": descriptor.params,
            "cached": cached,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let params: Vec<String> = descriptor
        .params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    println!("Architecture: {}", descriptor.name);
    println!("Scale:        {}x", descriptor.scale());
    println!("Confidence:   {:.3}", descriptor.confidence);
    println!("Params:       {}", params.join(", "));
    println!("Cached:       {}", if cached { "yes" } else { "no" });
    if !descriptor.is_trusted() {
        println!("warning: low confidence, the checkpoint may be a variant this tool does not know");
    }
    Ok(())
}

fn progress_sink(mode: ProgressMode) -> Box<dyn ProgressSink> {
    match mode {
        ProgressMode::Bar => Box::new(BarProgress::new()),
        ProgressMode::Json => Box::new(JsonProgress::new(io::stderr())),
        ProgressMode::None => Box::new(NullProgress),
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 2;

/// Frames per second after the first few frames, which include model warm-up.
fn compute_fps(frames_done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || frames_done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }
    (frames_done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn render_progress_line(processed: u64, total: u64, fps: f64, total_elapsed: f64) -> String {
    if total == 0 {
        return format!(
            "\rFrame {} | {:.1} fps | Elapsed: {}    ",
            processed,
            fps,
            format_duration(total_elapsed),
        );
    }

    let fraction = (processed as f64 / total as f64).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar: String = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH - filled);
    let eta = if fps > 0.0 {
        format!(
            " | ETA: {}",
            format_duration(total.saturating_sub(processed) as f64 / fps)
        )
    } else {
        String::new()
    };

    format!(
        "\r[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        processed,
        total,
        fps,
        format_duration(total_elapsed),
        eta,
    )
}

/// Single redrawn line on stderr; file boundaries get their own line.
struct BarProgress {
    started: Instant,
    fps_started: Option<Instant>,
    frames_seen: u64,
    line_open: bool,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            fps_started: None,
            frames_seen: 0,
            line_open: false,
        }
    }

    fn end_line(&mut self) {
        if self.line_open {
            eprintln!();
            self.line_open = false;
        }
    }
}

impl ProgressSink for BarProgress {
    fn on_event(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::FileStarted {
                index,
                total_files,
                path,
                ..
            } if *total_files > 1 => {
                self.end_line();
                eprintln!("[{index}/{total_files}] {}", path.display());
            }
            ProgressEvent::FrameDone {
                processed_frames,
                total_frames,
                ..
            } => {
                self.frames_seen += 1;
                if self.fps_started.is_none() && self.frames_seen > FPS_WARMUP_FRAMES {
                    self.fps_started = Some(Instant::now());
                }
                let fps_elapsed = self.fps_started.map_or(0.0, |at| at.elapsed().as_secs_f64());
                let fps = compute_fps(self.frames_seen, fps_elapsed);
                let line = render_progress_line(
                    *processed_frames,
                    *total_frames,
                    fps,
                    self.started.elapsed().as_secs_f64(),
                );
                eprint!("{line}");
                self.line_open = true;
            }
            ProgressEvent::FileFailed { .. } => self.end_line(),
            ProgressEvent::BatchFinished {
                succeeded, failed, ..
            } => {
                self.end_line();
                if succeeded + failed > 1 {
                    eprintln!(
                        "Done: {succeeded} succeeded, {failed} failed in {}",
                        format_duration(self.started.elapsed().as_secs_f64())
                    );
                }
            }
            _ => {}
        }
    }
}

/// One JSON object per event, for wrappers that drive the CLI.
struct JsonProgress<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonProgress<W> {
    fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ProgressSink for JsonProgress<W> {
    fn on_event(&mut self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(self.out, "{line}");
            let _ = self.out.flush();
        }
    }
}


#[cfg(test)]
mod outcome_tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let cancelled = anyhow::Error::from(UpscaleError::Cancelled).context("processing clip.mkv");
        assert_eq!(exit_code(&cancelled), EXIT_CANCELLED);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), EXIT_FAILURE);
    }

    #[test]
    fn clean_report_is_ok() {
        let report = BatchReport {
            succeeded: vec![PathBuf::from("a.png")],
            ..Default::default()
        };
        assert!(batch_outcome(report).is_ok());
    }

    #[test]
    fn lone_failure_keeps_its_error() {
        let report = BatchReport {
            failed: vec![(PathBuf::from("a.png"), anyhow::anyhow!("cannot decode a.png"))],
            ..Default::default()
        };
        let err = batch_outcome(report).unwrap_err();
        assert_eq!(err.to_string(), "cannot decode a.png");
    }

    #[test]
    fn partial_failure_is_summarised() {
        let report = BatchReport {
            succeeded: vec![PathBuf::from("a.png")],
            failed: vec![(PathBuf::from("b.png"), anyhow::anyhow!("bad"))],
            cancelled: false,
        };
        let err = batch_outcome(report).unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 files failed: b.png");
    }

    #[test]
    fn cancelled_report_maps_to_cancel_exit() {
        let report = BatchReport {
            cancelled: true,
            ..Default::default()
        };
        let err = batch_outcome(report).unwrap_err();
        assert_eq!(exit_code(&err), EXIT_CANCELLED);
    }
}
