use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use batch::{
    config::BatchConfig,
    job::{
        AudioFormat, AudioQuality, EncodeOptions, InterpolationMethod, JobKind, JobRecord,
        JobStatus, OutputFormat, QualityPreset,
    },
    orchestrator::{EventStream, Orchestrator, QueueEvent, QueueHandle},
    probe::probe_media,
    scan::{self, CollectResult, MediaClass},
    toolchain::{inspect_toolchain, ToolchainStatus},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use humansize::{format_size, DECIMAL};
use log::{info, warn};

/// Batch media conversion queue driving ffmpeg and the AI engines
#[derive(Parser, Debug)]
#[command(name = "vbatch", author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Change the frame rate of video files
    Convert {
        /// Files or directories to enqueue
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Target frame rate
        #[arg(short, long)]
        fps: f64,
        /// Frame generation method
        #[arg(short, long, value_enum, default_value_t = MethodArg::Duplicate)]
        method: MethodArg,
        #[command(flatten)]
        encode: EncodeArgs,
    },
    /// AI-upscale video files with Real-ESRGAN
    Upscale {
        /// Files or directories to enqueue
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Upscale factor (2, 3, or 4)
        #[arg(short, long, default_value_t = 4)]
        scale: u32,
        /// Real-ESRGAN model name
        #[arg(short, long, default_value = "realesrgan-x4plus")]
        model: String,
        #[command(flatten)]
        encode: EncodeArgs,
    },
    /// Re-encode video files towards a target size
    Compress {
        /// Files or directories to enqueue
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Target size in megabytes
        #[arg(short, long)]
        size_mb: f64,
        /// Output width (height follows the aspect ratio)
        #[arg(long)]
        width: Option<u32>,
        /// Output height (width follows the aspect ratio)
        #[arg(long)]
        height: Option<u32>,
        /// Force software encoding
        #[arg(long)]
        sw: bool,
        /// Output container
        #[arg(long, value_enum, default_value_t = ContainerArg::Mp4)]
        container: ContainerArg,
    },
    /// Pad audio files with leading/trailing silence
    PadAudio {
        /// Files or directories to enqueue
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Seconds of silence before the audio
        #[arg(short, long, default_value_t = 0.0)]
        before: f64,
        /// Seconds of silence after the audio
        #[arg(short, long, default_value_t = 0.0)]
        after: f64,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = AudioFormatArg::Mp3)]
        format: AudioFormatArg,
        /// Bitrate tier for lossy formats
        #[arg(short, long, value_enum, default_value_t = AudioQualityArg::Standard)]
        quality: AudioQualityArg,
    },
    /// Print media metadata for files
    Probe {
        /// Files to inspect
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Check the external toolchain
    Doctor {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Minterpolate,
    Blend,
    Duplicate,
    Rife,
}

impl From<MethodArg> for InterpolationMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::Minterpolate => InterpolationMethod::Minterpolate,
            MethodArg::Blend => InterpolationMethod::Blend,
            MethodArg::Duplicate => InterpolationMethod::Duplicate,
            MethodArg::Rife => InterpolationMethod::Rife,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ContainerArg {
    Mp4,
    Mov,
    Webm,
}

impl From<ContainerArg> for OutputFormat {
    fn from(c: ContainerArg) -> Self {
        match c {
            ContainerArg::Mp4 => OutputFormat::Mp4,
            ContainerArg::Mov => OutputFormat::Mov,
            ContainerArg::Webm => OutputFormat::Webm,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PresetArg {
    Fast,
    Balanced,
    Quality,
}

impl From<PresetArg> for QualityPreset {
    fn from(p: PresetArg) -> Self {
        match p {
            PresetArg::Fast => QualityPreset::Fast,
            PresetArg::Balanced => QualityPreset::Balanced,
            PresetArg::Quality => QualityPreset::Quality,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AudioFormatArg {
    Mp3,
    Aac,
    Wav,
    Flac,
}

impl From<AudioFormatArg> for AudioFormat {
    fn from(f: AudioFormatArg) -> Self {
        match f {
            AudioFormatArg::Mp3 => AudioFormat::Mp3,
            AudioFormatArg::Aac => AudioFormat::Aac,
            AudioFormatArg::Wav => AudioFormat::Wav,
            AudioFormatArg::Flac => AudioFormat::Flac,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AudioQualityArg {
    Low,
    Standard,
    High,
}

impl From<AudioQualityArg> for AudioQuality {
    fn from(q: AudioQualityArg) -> Self {
        match q {
            AudioQualityArg::Low => AudioQuality::Low,
            AudioQualityArg::Standard => AudioQuality::Standard,
            AudioQualityArg::High => AudioQuality::High,
        }
    }
}

/// Encoder selection shared by convert and upscale
#[derive(Args, Debug)]
struct EncodeArgs {
    /// Output container
    #[arg(long, value_enum, default_value_t = ContainerArg::Mp4)]
    container: ContainerArg,
    /// Encoder effort/quality trade-off
    #[arg(long, value_enum, default_value_t = PresetArg::Balanced)]
    preset: PresetArg,
    /// Force software encoding (hardware is preferred by default)
    #[arg(long)]
    sw: bool,
    /// Encode HEVC instead of H.264
    #[arg(long)]
    hevc: bool,
}

impl EncodeArgs {
    fn to_options(&self) -> EncodeOptions {
        EncodeOptions {
            container: self.container.into(),
            preset: self.preset.into(),
            use_hw_accel: !self.sw,
            use_hevc: self.hevc,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = BatchConfig::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Convert { inputs, fps, method, encode } => {
            let kind = JobKind::RateConvert {
                target_fps: fps,
                method: method.into(),
                encode: encode.to_options(),
            };
            run_batch(config, &inputs, MediaClass::Video, kind).await
        }
        Command::Upscale { inputs, scale, model, encode } => {
            let kind = JobKind::Upscale {
                scale,
                model,
                encode: encode.to_options(),
            };
            run_batch(config, &inputs, MediaClass::Video, kind).await
        }
        Command::Compress { inputs, size_mb, width, height, sw, container } => {
            let kind = JobKind::Compress {
                target_size_mb: size_mb,
                target_width: width,
                target_height: height,
                use_hw_accel: !sw,
                container: container.into(),
            };
            run_batch(config, &inputs, MediaClass::Video, kind).await
        }
        Command::PadAudio { inputs, before, after, format, quality } => {
            let kind = JobKind::PadAudio {
                pad_before: before,
                pad_after: after,
                format: format.into(),
                quality: quality.into(),
            };
            run_batch(config, &inputs, MediaClass::Audio, kind).await
        }
        Command::Probe { inputs, json } => probe_inputs(&config, &inputs, json).await,
        Command::Doctor { json } => doctor(&config, json).await,
    }
}

/// Collect inputs, enqueue them, run the queue to completion, and summarize
async fn run_batch(
    config: BatchConfig,
    inputs: &[PathBuf],
    class: MediaClass,
    kind: JobKind,
) -> Result<()> {
    let status = inspect_toolchain(&config).await;
    ensure_tools(&status, &kind)?;

    let collected = scan::collect_inputs(inputs, class);
    for result in &collected {
        if let CollectResult::Skipped(path, reason) = result {
            warn!("skipping {}: {}", path.display(), reason);
        }
    }
    let paths = scan::candidate_paths(&collected);
    if paths.is_empty() {
        bail!("no usable media inputs found");
    }
    info!("🎬 {} input(s) for {}", paths.len(), kind.label());

    let queue = Orchestrator::spawn(config);
    let report = queue.enqueue_paths(paths, &kind).await?;
    for (path, reason) in &report.rejected {
        warn!("rejected {}: {}", path.display(), reason);
    }
    if !report.duplicates.is_empty() {
        info!("{} duplicate path(s) ignored", report.duplicates.len());
    }
    if report.accepted.is_empty() {
        bail!("no jobs were accepted");
    }

    // Probes run concurrently; wait for every job to become ready or fail
    let jobs = wait_for_probes(&queue).await?;
    for job in jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        warn!(
            "probe failed for {}: {}",
            job.display_name(),
            job.error.as_deref().unwrap_or("unknown")
        );
    }

    let mut events = queue.subscribe();
    let ready = queue.start(None).await?;
    info!("starting batch run over {} job(s)", ready);

    // Ctrl-C cancels the whole queue cooperatively
    let cancel_queue = queue.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling the queue");
            let _ = cancel_queue.cancel().await;
        }
    });

    render_events(&mut events).await;
    summarize(&queue).await
}

async fn wait_for_probes(queue: &QueueHandle) -> Result<Vec<JobRecord>> {
    loop {
        let jobs = queue.jobs().await?;
        let settled = jobs
            .iter()
            .all(|j| !matches!(j.status, JobStatus::Pending | JobStatus::Probing));
        if settled {
            return Ok(jobs);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn ensure_tools(status: &ToolchainStatus, kind: &JobKind) -> Result<()> {
    if !status.available {
        bail!("ffmpeg/ffprobe not found; install them or point the config at the binaries");
    }
    if let JobKind::RateConvert { method: InterpolationMethod::Rife, .. } = kind {
        if !status.rife_available() {
            bail!("rife-ncnn-vulkan or its model directory not found; required for --method rife");
        }
    }
    if let JobKind::Upscale { .. } = kind {
        if !status.realesrgan_available() {
            bail!("realesrgan-ncnn-vulkan not found; required for upscaling");
        }
    }
    Ok(())
}

/// Drive the event stream to the terminal until the run finishes.
///
/// Progress redraws one stdout line in place; log output goes to stderr, so
/// the two do not interleave.
async fn render_events(events: &mut EventStream) {
    let mut line_open = false;
    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::JobProgress { sample, .. } => {
                print!(
                    "\r  {:>5.1}%  frame {:>7}  {:>6.1} fps  {:>8}  elapsed {}",
                    sample.completion_percent,
                    sample.frame_count,
                    sample.instant_fps,
                    sample.speed_multiplier,
                    sample.elapsed_display
                );
                let _ = std::io::stdout().flush();
                line_open = true;
            }
            QueueEvent::JobCompleted { outcome, .. } => {
                if line_open {
                    println!();
                    line_open = false;
                }
                if outcome.success {
                    println!("  done: {} ({})", outcome.output_path.display(), outcome.message);
                } else {
                    println!("  failed: {}", outcome.message);
                }
            }
            QueueEvent::RunFinished { aggregate } => {
                if line_open {
                    println!();
                }
                info!(
                    "run finished: {}/{} completed, {} failed, {} cancelled",
                    aggregate.completed, aggregate.total, aggregate.failed, aggregate.cancelled
                );
                return;
            }
            QueueEvent::JobStatus { .. } | QueueEvent::BatchProgress { .. } => {}
        }
    }
}

async fn summarize(queue: &QueueHandle) -> Result<()> {
    let jobs = queue.jobs().await?;
    let mut failed = 0usize;

    println!();
    for job in &jobs {
        match job.status {
            JobStatus::Completed => {
                let in_size = job.metadata.as_ref().map(|m| m.file_size).unwrap_or(0);
                let out_size = job
                    .outcome
                    .as_ref()
                    .and_then(|o| std::fs::metadata(&o.output_path).ok())
                    .map(|m| m.len())
                    .unwrap_or(0);
                println!(
                    "  ✅ {}  {} -> {}",
                    job.display_name(),
                    format_size(in_size, DECIMAL),
                    format_size(out_size, DECIMAL)
                );
            }
            JobStatus::Failed => {
                failed += 1;
                println!(
                    "  ❌ {}  {}",
                    job.display_name(),
                    job.error.as_deref().unwrap_or("unknown error")
                );
            }
            JobStatus::Cancelled => {
                println!("  ⚠️  {}  cancelled", job.display_name());
            }
            _ => {}
        }
    }

    if failed > 0 {
        bail!("{} of {} job(s) failed", failed, jobs.len());
    }
    Ok(())
}

async fn probe_inputs(config: &BatchConfig, inputs: &[PathBuf], json: bool) -> Result<()> {
    let mut failures = 0usize;
    for input in inputs {
        match probe_media(config, input).await {
            Ok(info) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!("{}", input.display());
                    println!("  duration  {:.3}s", info.duration);
                    if info.fps > 0.0 {
                        println!(
                            "  video     {} {}x{} @ {:.3} fps",
                            info.codec, info.width, info.height, info.fps
                        );
                    } else {
                        println!("  codec     {}", info.codec);
                    }
                    if let Some(rate) = info.sample_rate {
                        println!(
                            "  audio     {} Hz, {} channel(s)",
                            rate,
                            info.channels.unwrap_or(0)
                        );
                    }
                    if let Some(bitrate) = info.bitrate {
                        println!("  bitrate   {} bps", bitrate);
                    }
                    println!("  size      {}", format_size(info.file_size, DECIMAL));
                }
            }
            Err(err) => {
                failures += 1;
                warn!("{}: {}", input.display(), err);
            }
        }
    }
    if failures > 0 {
        bail!("{} input(s) failed to probe", failures);
    }
    Ok(())
}

async fn doctor(config: &BatchConfig, json: bool) -> Result<()> {
    let status = inspect_toolchain(config).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        let mark = |ok: bool| if ok { "✅" } else { "❌" };
        println!(
            "{} ffmpeg       {}",
            mark(status.ffmpeg_path.is_some()),
            status.ffmpeg_path.as_deref().unwrap_or("not found")
        );
        if let Some(version) = &status.ffmpeg_version {
            println!("   version      {}", version);
        }
        println!(
            "{} ffprobe      {}",
            mark(status.ffprobe_path.is_some()),
            status.ffprobe_path.as_deref().unwrap_or("not found")
        );
        println!(
            "{} videotoolbox {}",
            mark(status.videotoolbox_available),
            if status.videotoolbox_available { "hardware encoders present" } else { "unavailable" }
        );
        println!(
            "{} hevc         {}",
            mark(status.hevc_available),
            if status.hevc_available { "hevc_videotoolbox present" } else { "unavailable" }
        );
        println!(
            "{} rife         {}",
            mark(status.rife_available()),
            status.rife_path.as_deref().unwrap_or("not found")
        );
        if let Some(dir) = &status.rife_model_dir {
            println!("   model dir    {}", dir.display());
        }
        println!(
            "{} realesrgan   {}",
            mark(status.realesrgan_available()),
            status.realesrgan_path.as_deref().unwrap_or("not found")
        );
    }

    if !status.available {
        bail!("toolchain incomplete: ffmpeg and ffprobe are required");
    }
    Ok(())
}
