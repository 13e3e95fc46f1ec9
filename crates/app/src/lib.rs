use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tempora_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use tempora_core::io::video_output::default_video_output;
use tempora_core::io::{
    probe_video, EncoderConfig, FrameSource, ImageSequenceSink, ImageSequenceSource,
    VideoDecoder, VideoEncoder,
};
use tempora_core::logging::{open_log_file, LogFile, LogFilters, DEFAULT_LOG_FILTER};
use tempora_core::model::{InferenceBackend, OnnxFlowModel, SessionConfig};
use tempora_core::pipeline::{
    FrameSink, InterpolationPipeline, MontageWindow, PipelineReport, ProgressCallback,
};
use tempora_core::scheduler::{expected_output_frames, midpoint_ratios, InterpolationScheduler};

const DEFAULT_SEQUENCE_DIR: &str = "vid_out";

#[derive(Parser, Debug)]
#[command(
    name = "tempora",
    about = "Streaming video frame interpolation",
    group(ArgGroup::new("input").required(true).args(["video", "img"]))
)]
struct Cli {
    #[arg(long, value_name = "PATH", help = "Input video file")]
    video: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory of numbered .png/.exr frames")]
    img: Option<PathBuf>,

    #[arg(long, help = "Interpolation exponent: 2^exp output frames per input pair (1-6)")]
    exp: Option<u32>,

    #[arg(long, help = "Pad to multiples of 64 for high-resolution input")]
    uhd: bool,

    #[arg(long, help = "Drop near-identical consecutive frames")]
    skip: bool,

    #[arg(long, help = "Render source and interpolated frames side by side")]
    montage: bool,

    #[arg(long, value_name = "FPS", help = "Output frame rate (default: source fps * 2^exp)")]
    fps: Option<f64>,

    #[arg(long, help = "Write a numbered image sequence instead of a video")]
    png: bool,

    #[arg(long, value_name = "EXT", help = "Output video container extension")]
    ext: Option<String>,

    #[arg(short, long, value_name = "PATH", help = "Output video file or image directory")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Flow model (.onnx)")]
    model: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    #[arg(long, value_name = "N", help = "Frames buffered between pipeline stages")]
    queue_capacity: Option<usize>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Cpu,
    Cuda,
    #[value(alias = "trt")]
    Tensorrt,
}

impl From<BackendArg> for InferenceBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Cpu => InferenceBackend::Cpu,
            BackendArg::Cuda => InferenceBackend::Cuda,
            BackendArg::Tensorrt => InferenceBackend::Tensorrt,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = tempora_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tempora_core::runtime::log_runtime_lib_status(&runtime_libs);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir, &cli)?;
    run_interpolation(cli, config, resolved_data_dir).await
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::resolve(cli_log_filter, verbose, rust_log.as_deref());
    let console_env_filter = parse_env_filter_with_fallback(&filters.console, "console");

    match open_log_file(data_dir) {
        LogFile::Ready(appender) => {
            let file_env_filter = parse_env_filter_with_fallback(&filters.file, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        LogFile::Unavailable { log_dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
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

fn load_config(data_dir: &Path, cli: &Cli) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    apply_cli_overrides(&mut config, cli);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    let interpolation = &mut config.interpolation;
    if let Some(exp) = cli.exp {
        interpolation.exp = exp;
    }
    interpolation.high_res |= cli.uhd;
    interpolation.skip_static |= cli.skip;
    interpolation.montage |= cli.montage;

    if let Some(capacity) = cli.queue_capacity {
        config.pipeline.queue_capacity = capacity;
    }
    if let Some(model) = &cli.model {
        config.inference.model_path = model.clone();
    }
    if let Some(backend) = cli.backend {
        config.inference.backend = backend.into();
    }
    if let Some(ext) = &cli.ext {
        config.output.extension = ext.clone();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum InputKind {
    Video {
        path: PathBuf,
        fps: f64,
        has_audio: bool,
    },
    Images,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputPlan {
    ImageSequence {
        dir: PathBuf,
    },
    Video {
        path: PathBuf,
        fps: f64,
        audio_source: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy)]
struct OutputRequest<'a> {
    output: Option<&'a Path>,
    png: bool,
    fps_override: Option<f64>,
    skip_static: bool,
    exp: u32,
    extension: &'a str,
}

/// Image input always produces an image sequence. Audio is only carried
/// over when the output timing still matches the source.
fn plan_output(input: &InputKind, request: &OutputRequest<'_>) -> OutputPlan {
    let sequence_dir = || {
        request
            .output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SEQUENCE_DIR))
    };

    match input {
        InputKind::Images => OutputPlan::ImageSequence {
            dir: sequence_dir(),
        },
        InputKind::Video { .. } if request.png => OutputPlan::ImageSequence {
            dir: sequence_dir(),
        },
        InputKind::Video {
            path,
            fps,
            has_audio,
        } => {
            let fps = request
                .fps_override
                .unwrap_or(fps * (1_u64 << request.exp) as f64);
            let output = request
                .output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| default_video_output(path, request.exp, fps, request.extension));

            let audio_source = if !has_audio {
                None
            } else if request.fps_override.is_some() {
                info!("Output fps overridden, audio will not be carried over");
                None
            } else if request.skip_static {
                info!("Static-frame skipping changes timing, audio will not be carried over");
                None
            } else {
                Some(path.clone())
            };

            OutputPlan::Video {
                path: output,
                fps,
                audio_source,
            }
        }
    }
}

async fn run_interpolation(cli: Cli, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    if let Some(fps) = cli.fps {
        if !fps.is_finite() || fps <= 0.0 {
            bail!("--fps must be a positive number (got {fps})");
        }
    }

    let (source, input): (Box<dyn FrameSource>, InputKind) = match (&cli.video, &cli.img) {
        (Some(path), _) => {
            let stream = probe_video(path)?;
            info!(
                path = %path.display(),
                width = stream.width,
                height = stream.height,
                fps = stream.fps,
                codec = %stream.codec_name,
                frames = ?stream.total_frames,
                audio = stream.has_audio,
                "Probed input video"
            );
            let decoder: Box<dyn FrameSource> = Box::new(VideoDecoder::open(path, &stream)?);
            let input = InputKind::Video {
                path: path.clone(),
                fps: stream.fps,
                has_audio: stream.has_audio,
            };
            (decoder, input)
        }
        (None, Some(dir)) => {
            let sequence: Box<dyn FrameSource> = Box::new(ImageSequenceSource::open(dir)?);
            (sequence, InputKind::Images)
        }
        (None, None) => bail!("either --video or --img is required"),
    };

    let interpolation = &config.interpolation;
    let plan = plan_output(
        &input,
        &OutputRequest {
            output: cli.output.as_deref(),
            png: cli.png,
            fps_override: cli.fps,
            skip_static: interpolation.skip_static,
            exp: interpolation.exp,
            extension: &config.output.extension,
        },
    );

    let (source_width, source_height) = source.dimensions();
    let output_width = if interpolation.montage {
        MontageWindow::centered(source_width)?.width * 2
    } else {
        source_width
    };

    let trt_cache_dir = resolve_relative_to(&data_dir, &config.inference.trt_cache_dir);
    let model = OnnxFlowModel::load(&SessionConfig {
        model_path: &config.inference.model_path,
        backend: config.inference.backend,
        trt_cache_dir: Some(&trt_cache_dir),
    })?;
    let scheduler = InterpolationScheduler::new(Box::new(model), interpolation.scheduler_config())?;
    info!(
        exp = interpolation.exp,
        ratios = ?midpoint_ratios(interpolation.exp),
        high_res = interpolation.high_res,
        skip_static = interpolation.skip_static,
        montage = interpolation.montage,
        "Interpolation configured"
    );

    let sink: Box<dyn FrameSink> = match &plan {
        OutputPlan::ImageSequence { dir } => {
            info!(dir = %dir.display(), "Writing image sequence");
            Box::new(ImageSequenceSink::create(dir)?)
        }
        OutputPlan::Video {
            path,
            fps,
            audio_source,
        } => {
            info!(path = %path.display(), fps, audio = audio_source.is_some(), "Writing video");
            Box::new(VideoEncoder::new(&EncoderConfig {
                output_path: path.clone(),
                audio_source: audio_source.clone(),
                codec: config.output.codec.clone(),
                crf: config.output.crf,
                pixel_format: config.output.pixel_format.clone(),
                width: output_width,
                height: source_height,
                fps: *fps,
            })?)
        }
    };

    let total_input = source.total_frames();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight frames");
            let _ = cancel_tx.send(true);
        }
    });

    let pipeline = InterpolationPipeline::new(config.pipeline.queue_capacity);
    let started = Instant::now();
    let result = pipeline
        .run(
            source,
            scheduler,
            sink,
            total_input,
            cancel_rx,
            Some(make_progress_callback()),
        )
        .await;
    eprintln!();

    let report = result?;
    log_report(&report, total_input, interpolation.exp, started.elapsed().as_secs_f64());
    if report.cancelled {
        bail!("interpolation cancelled after {} frames", report.frames_written);
    }
    Ok(())
}

fn log_report(report: &PipelineReport, total_input: Option<u64>, exp: u32, elapsed: f64) {
    info!(
        frames_read = report.frames_read,
        frames_written = report.frames_written,
        expected = ?total_input.map(|n| expected_output_frames(n, exp)),
        pairs_interpolated = report.pairs_interpolated,
        pairs_duplicated = report.pairs_duplicated,
        pairs_skipped = report.pairs_skipped,
        model_calls = report.model_calls,
        elapsed = %format_duration(elapsed),
        "Interpolation finished"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_INPUT_FRAMES: u64 = 2;

fn render_progress(
    output_written: u64,
    total_output: Option<u64>,
    total_input: Option<u64>,
    total_elapsed: f64,
    fps_elapsed: f64,
) -> String {
    let input_done = estimate_input_processed(output_written, total_output, total_input);
    let input_fps = compute_input_fps(input_done, fps_elapsed);

    let Some(total) = total_output else {
        return format!(
            "\rFrame {} | {:.1} fps | Elapsed: {}    ",
            output_written,
            input_fps,
            format_duration(total_elapsed),
        );
    };

    let fraction = if total > 0 {
        (output_written as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));
    let input_total = total_input.unwrap_or(total);

    let eta = if input_fps > 0.0 {
        let remaining_input = input_total.saturating_sub(input_done) as f64;
        format!(" | ETA: {}", format_duration(remaining_input / input_fps))
    } else {
        String::new()
    };

    format!(
        "\r[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        input_done,
        input_total,
        input_fps,
        format_duration(total_elapsed),
        eta,
    )
}

fn compute_input_fps(input_done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || input_done <= FPS_WARMUP_INPUT_FRAMES {
        return 0.0;
    }

    (input_done - FPS_WARMUP_INPUT_FRAMES) as f64 / elapsed
}

fn estimate_input_processed(
    output_written: u64,
    total_output: Option<u64>,
    total_input: Option<u64>,
) -> u64 {
    match (total_output, total_input) {
        (Some(out_total), Some(in_total)) if out_total > 0 => {
            let ratio = in_total as f64 / out_total as f64;
            (output_written as f64 * ratio).round() as u64
        }
        _ => output_written,
    }
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let fps_start = Mutex::new(None::<Instant>);
    Box::new(move |current, total_output, total_input| {
        let input_done = estimate_input_processed(current, total_output, total_input);
        let fps_elapsed = {
            let mut fps_start = fps_start
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if fps_start.is_none() && input_done > FPS_WARMUP_INPUT_FRAMES {
                *fps_start = Some(Instant::now());
            }
            fps_start
                .as_ref()
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        };

        eprint!(
            "{}",
            render_progress(
                current,
                total_output,
                total_input,
                start.elapsed().as_secs_f64(),
                fps_elapsed,
            )
        );
    })
}
