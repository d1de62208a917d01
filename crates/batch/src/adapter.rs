use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::BatchConfig;
use crate::engine;
use crate::engine::CANCEL_MARKER;
use crate::job::{EncodeOptions, InterpolationMethod, JobDescriptor, JobKind, ProgressSample};
use crate::probe::{probe_duration, probe_media, MediaMetadata, ProbeError};
use crate::progress::ProgressParser;

/// How long a politely asked ffmpeg gets to flush and exit before it is
/// killed. Fixed on purpose; a stop request must never hang on a stuck
/// encoder because of a generous config value.
const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Lines of engine stderr kept for error reporting
const STDERR_TAIL_LINES: usize = 12;

/// How often frame-pipeline stages are polled for produced output
const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Everything an engine needs to execute one job
pub struct RunRequest {
    pub descriptor: JobDescriptor,
    pub metadata: MediaMetadata,
    /// Latest progress sample; each send replaces the previous value, so a
    /// slow consumer sees the newest sample and never stalls the engine
    pub progress: watch::Sender<ProgressSample>,
    pub cancel: CancellationToken,
}

/// What a finished run reports back for outcome assembly
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output_path: PathBuf,
    pub input_duration: f64,
    pub output_duration: f64,
}

/// Seam between the queue and the external conversion engines. The queue
/// only ever sees this trait; tests substitute a scripted implementation.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Inspect an input before it becomes runnable
    async fn probe(&self, path: &Path) -> Result<MediaMetadata, ProbeError>;

    /// Execute one job to completion, streaming progress along the way
    async fn run(&self, request: RunRequest) -> Result<RunSummary>;
}

/// Production engine driving ffmpeg, rife-ncnn-vulkan and
/// realesrgan-ncnn-vulkan as child processes
pub struct FfmpegEngine {
    config: BatchConfig,
}

impl FfmpegEngine {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Spawn ffmpeg with `-progress pipe:1` and stream its stdout through
    /// the parser, mapping raw percent into `window`. Cancellation writes
    /// "q" to stdin and escalates to a kill after the grace period.
    async fn stream_ffmpeg(
        &self,
        args: Vec<String>,
        mut parser: ProgressParser,
        window: (f64, f64),
        request: &RunRequest,
    ) -> Result<()> {
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.config.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", self.config.ffmpeg_bin.display()))?;

        let stdout = child.stdout.take().context("ffmpeg stdout was not captured")?;
        let stderr = child.stderr.take().context("ffmpeg stderr was not captured")?;
        let mut stdin = child.stdin.take();

        let stderr_task = tokio::spawn(collect_stderr_tail(stderr));

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    stop_child(&mut child, &mut stdin).await;
                    stderr_task.abort();
                    bail!("conversion {}", CANCEL_MARKER);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            if let Some(sample) = parser.parse_line(&text) {
                                emit_scaled(&request.progress, sample, window);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        // The progress stream can end before the process does (muxer
        // finalization); a cancel in that window still gets the
        // quit-then-kill treatment
        let status = tokio::select! {
            _ = request.cancel.cancelled() => {
                stop_child(&mut child, &mut stdin).await;
                stderr_task.abort();
                bail!("conversion {}", CANCEL_MARKER);
            }
            status = child.wait() => status.context("waiting for ffmpeg to exit")?,
        };
        let tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            bail!("ffmpeg exited with {}: {}", status, tail.trim());
        }
        if !parser.finished() {
            debug!("ffmpeg exited cleanly without a progress=end marker");
        }
        Ok(())
    }

    /// Run a frame-pipeline stage that reports no usable progress of its
    /// own; completion is inferred by counting PNGs appearing in
    /// `watch_dir` against `expected`. These engines have no quit protocol,
    /// so cancellation kills outright.
    async fn run_counted_stage(
        &self,
        bin: &Path,
        args: Vec<String>,
        watch_dir: &Path,
        expected: u64,
        window: (f64, f64),
        request: &RunRequest,
    ) -> Result<()> {
        debug!("{} {}", bin.display(), args.join(" "));

        let mut child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", bin.display()))?;

        let stderr = child.stderr.take().context("stage stderr was not captured")?;
        let stderr_task = tokio::spawn(collect_stderr_tail(stderr));

        let mut ticker = tokio::time::interval(STAGE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    bail!("conversion {}", CANCEL_MARKER);
                }
                status = child.wait() => {
                    break status.context("waiting for stage to exit")?;
                }
                _ = ticker.tick() => {
                    let produced = count_png_frames(watch_dir);
                    let raw = if expected > 0 {
                        (produced as f64 / expected as f64 * 100.0).min(100.0)
                    } else {
                        0.0
                    };
                    let sample = ProgressSample {
                        completion_percent: raw,
                        frame_count: produced,
                        ..ProgressSample::default()
                    };
                    emit_scaled(&request.progress, sample, window);
                }
            }
        };

        let tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            bail!("{} exited with {}: {}", bin.display(), status, tail.trim());
        }
        Ok(())
    }

    /// Best-effort audio lift for the remux at the end of a frame pipeline.
    /// A video-only input makes ffmpeg fail without creating the file, which
    /// is exactly the signal wanted.
    async fn extract_audio(&self, input: &Path, audio_path: &Path) -> bool {
        let args = engine::build_audio_extract_args(input, audio_path);
        let _ = Command::new(&self.config.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        audio_path.exists()
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vbatch-frames-");
        match &self.config.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("failed to create scratch directory")
    }

    /// RIFE rate conversion: extract frames (0-30%), interpolate (30-80%),
    /// encode and remux (80-100%). The scratch directory cleans itself up on
    /// every exit path, including errors.
    async fn rife_pipeline(
        &self,
        request: &RunRequest,
        target_fps: f64,
        encode: &EncodeOptions,
        output: &Path,
    ) -> Result<()> {
        let metadata = &request.metadata;
        let multiplier = engine::rife_multiplier(metadata.fps, target_fps);
        info!(
            "RIFE interpolation {}x: {} fps -> {} fps",
            multiplier, metadata.fps, target_fps
        );

        let scratch = self.scratch_dir()?;
        let input_frames = scratch.path().join("input");
        let output_frames = scratch.path().join("output");
        tokio::fs::create_dir_all(&input_frames)
            .await
            .context("creating frame directories")?;
        tokio::fs::create_dir_all(&output_frames)
            .await
            .context("creating frame directories")?;

        info!("Phase 1: extracting frames");
        let expected_input = engine::expected_output_frames(metadata.fps, metadata.duration).unwrap_or(0);
        let args = engine::build_frame_extract_args(&request.descriptor.input, &input_frames);
        self.run_counted_stage(
            &self.config.ffmpeg_bin,
            args,
            &input_frames,
            expected_input,
            (0.0, 30.0),
            request,
        )
        .await?;

        let extracted = count_png_frames(&input_frames);
        if extracted == 0 {
            bail!("no frames extracted from {}", request.descriptor.input.display());
        }

        info!("Phase 2: RIFE interpolation over {} frames", extracted);
        let target_frames = extracted as usize * multiplier as usize;
        let model_dir = self.config.rife_model_dir();
        debug!("RIFE model: {}", model_dir.display());
        let args = engine::build_rife_args(&input_frames, &output_frames, &model_dir, target_frames);
        self.run_counted_stage(
            &self.config.rife_bin,
            args,
            &output_frames,
            target_frames as u64,
            (30.0, 80.0),
            request,
        )
        .await?;

        let produced = count_png_frames(&output_frames);
        if produced == 0 {
            bail!("RIFE produced no frames");
        }

        info!("Phase 3: encoding {} frames", produced);
        let audio_path = scratch.path().join("audio.aac");
        let has_audio = self.extract_audio(&request.descriptor.input, &audio_path).await;

        // The power-of-two multiplier usually overshoots the requested rate;
        // encode at the real frame density and let an fps filter trim it
        let encode_fps = if metadata.duration > 0.0 {
            produced as f64 / metadata.duration
        } else {
            target_fps
        };
        let adjust = ((target_fps - encode_fps).abs() > 1.0).then_some(target_fps);
        let args = engine::build_frame_encode_args(
            &output_frames,
            encode_fps,
            has_audio.then_some(audio_path.as_path()),
            encode,
            adjust,
            output,
        );
        self.stream_ffmpeg(
            args,
            ProgressParser::new(metadata.duration, Some(produced)),
            (80.0, 100.0),
            request,
        )
        .await
    }

    /// Real-ESRGAN upscale: same three phases as RIFE, frame count and rate
    /// preserved.
    async fn upscale_pipeline(
        &self,
        request: &RunRequest,
        scale: u32,
        model: &str,
        encode: &EncodeOptions,
        output: &Path,
    ) -> Result<()> {
        let metadata = &request.metadata;
        info!("Upscale {}x via {}", scale, model);

        let scratch = self.scratch_dir()?;
        let input_frames = scratch.path().join("input");
        let output_frames = scratch.path().join("output");
        tokio::fs::create_dir_all(&input_frames)
            .await
            .context("creating frame directories")?;
        tokio::fs::create_dir_all(&output_frames)
            .await
            .context("creating frame directories")?;

        info!("Phase 1: extracting frames");
        let expected_input = engine::expected_output_frames(metadata.fps, metadata.duration).unwrap_or(0);
        let args = engine::build_frame_extract_args(&request.descriptor.input, &input_frames);
        self.run_counted_stage(
            &self.config.ffmpeg_bin,
            args,
            &input_frames,
            expected_input,
            (0.0, 30.0),
            request,
        )
        .await?;

        let extracted = count_png_frames(&input_frames);
        if extracted == 0 {
            bail!("no frames extracted from {}", request.descriptor.input.display());
        }

        info!("Phase 2: upscaling {} frames", extracted);
        let args = engine::build_realesrgan_args(&input_frames, &output_frames, model, scale);
        self.run_counted_stage(
            &self.config.realesrgan_bin,
            args,
            &output_frames,
            extracted,
            (30.0, 80.0),
            request,
        )
        .await?;

        let produced = count_png_frames(&output_frames);
        if produced == 0 {
            bail!("upscaler produced no frames");
        }

        info!("Phase 3: encoding {} frames", produced);
        let audio_path = scratch.path().join("audio.aac");
        let has_audio = self.extract_audio(&request.descriptor.input, &audio_path).await;

        let encode_fps = if metadata.fps > 0.0 {
            metadata.fps
        } else if metadata.duration > 0.0 {
            produced as f64 / metadata.duration
        } else {
            30.0
        };
        let args = engine::build_frame_encode_args(
            &output_frames,
            encode_fps,
            has_audio.then_some(audio_path.as_path()),
            encode,
            None,
            output,
        );
        self.stream_ffmpeg(
            args,
            ProgressParser::new(metadata.duration, Some(produced)),
            (80.0, 100.0),
            request,
        )
        .await
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn probe(&self, path: &Path) -> Result<MediaMetadata, ProbeError> {
        probe_media(&self.config, path).await
    }

    async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let output = request.descriptor.output_path();
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating output directory {}", parent.display()))?;
            }
        }

        match request.descriptor.kind.clone() {
            JobKind::RateConvert {
                target_fps,
                method: InterpolationMethod::Rife,
                encode,
            } => {
                self.rife_pipeline(&request, target_fps, &encode, &output).await?;
            }
            JobKind::RateConvert { target_fps, method, encode } => {
                let args = engine::build_rate_convert_args(
                    &request.descriptor.input,
                    &output,
                    target_fps,
                    method,
                    &encode,
                );
                let expected = engine::expected_output_frames(target_fps, request.metadata.duration);
                self.stream_ffmpeg(
                    args,
                    ProgressParser::new(request.metadata.duration, expected),
                    (0.0, 100.0),
                    &request,
                )
                .await?;
            }
            JobKind::Upscale { scale, model, encode } => {
                self.upscale_pipeline(&request, scale, &model, &encode, &output).await?;
            }
            JobKind::Compress {
                target_size_mb,
                target_width,
                target_height,
                use_hw_accel,
                container,
            } => {
                let args = engine::build_compress_args(
                    &request.descriptor.input,
                    &output,
                    request.metadata.duration,
                    target_size_mb,
                    target_width,
                    target_height,
                    use_hw_accel,
                    container,
                );
                self.stream_ffmpeg(
                    args,
                    ProgressParser::new(request.metadata.duration, None),
                    (0.0, 100.0),
                    &request,
                )
                .await?;
            }
            JobKind::PadAudio { pad_before, pad_after, format, quality } => {
                let args = engine::build_pad_audio_args(
                    &request.descriptor.input,
                    &output,
                    pad_before,
                    pad_after,
                    format,
                    quality,
                );
                let padded_duration = request.metadata.duration + pad_before + pad_after;
                self.stream_ffmpeg(
                    args,
                    ProgressParser::new(padded_duration, None),
                    (0.0, 100.0),
                    &request,
                )
                .await?;
            }
        }

        let output_duration = probe_duration(&self.config, &output).await?;
        Ok(RunSummary {
            output_path: output,
            input_duration: request.metadata.duration,
            output_duration,
        })
    }
}

async fn collect_stderr_tail(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Ask a child ffmpeg to quit over stdin, escalating to a kill once the
/// grace period runs out
async fn stop_child(child: &mut Child, stdin: &mut Option<ChildStdin>) {
    if let Some(pipe) = stdin.as_mut() {
        let _ = pipe.write_all(b"q\n").await;
        let _ = pipe.flush().await;
    }
    if tokio::time::timeout(TERMINATION_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Map a 0-100 sample into a phase window and publish it; the watch cell
/// keeps only the newest sample, so the engine never waits on the consumer
fn emit_scaled(progress: &watch::Sender<ProgressSample>, mut sample: ProgressSample, window: (f64, f64)) {
    sample.completion_percent = window.0 + sample.completion_percent * (window.1 - window.0) / 100.0;
    let _ = progress.send(sample);
}

fn count_png_frames(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("png"))
                .count() as u64
        })
        .unwrap_or(0)
}
