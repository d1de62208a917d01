use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::probe::MediaMetadata;

/// Unique identifier for a queued job
pub type JobId = Uuid;

/// Upper bound for a sane interpolation target
pub const MAX_TARGET_FPS: f64 = 240.0;

/// How a rate-conversion job generates the frames between originals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// Motion-compensated interpolation (ffmpeg minterpolate filter)
    Minterpolate,
    /// Frame blending (ffmpeg framerate filter)
    Blend,
    /// Plain frame duplication (ffmpeg fps filter)
    Duplicate,
    /// AI interpolation via rife-ncnn-vulkan
    Rife,
}

/// Encoder effort/quality trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Fast,
    Balanced,
    Quality,
}

/// Output container for video jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mov,
    Webm,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mov => "mov",
            OutputFormat::Webm => "webm",
        }
    }
}

/// Output format for audio-pad jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "m4a",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }
}

/// Bitrate tier for lossy audio output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Standard,
    High,
}

/// Video encoder selection shared by rate-conversion and upscale jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeOptions {
    pub container: OutputFormat,
    pub preset: QualityPreset,
    pub use_hw_accel: bool,
    pub use_hevc: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            container: OutputFormat::Mp4,
            preset: QualityPreset::Balanced,
            use_hw_accel: true,
            use_hevc: false,
        }
    }
}

/// What a job does to its input, with the kind-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobKind {
    /// Change the frame rate while preserving wall-clock duration
    RateConvert {
        target_fps: f64,
        method: InterpolationMethod,
        encode: EncodeOptions,
    },
    /// AI super-resolution via realesrgan-ncnn-vulkan
    Upscale {
        scale: u32,
        model: String,
        encode: EncodeOptions,
    },
    /// Re-encode towards a target file size
    Compress {
        target_size_mb: f64,
        target_width: Option<u32>,
        target_height: Option<u32>,
        use_hw_accel: bool,
        container: OutputFormat,
    },
    /// Add leading/trailing silence to an audio file
    PadAudio {
        pad_before: f64,
        pad_after: f64,
        format: AudioFormat,
        quality: AudioQuality,
    },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::RateConvert { .. } => "rate-convert",
            JobKind::Upscale { .. } => "upscale",
            JobKind::Compress { .. } => "compress",
            JobKind::PadAudio { .. } => "pad-audio",
        }
    }
}

/// Reasons a descriptor is rejected before it ever reaches the queue
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DescriptorError {
    #[error("output path equals input path: {0}")]
    OutputEqualsInput(PathBuf),
    #[error("target frame rate {0} out of range (0, {MAX_TARGET_FPS}]")]
    TargetFpsOutOfRange(f64),
    #[error("upscale factor {0} unsupported (expected 2, 3, or 4)")]
    BadScaleFactor(u32),
    #[error("upscale model name is empty")]
    EmptyModelName,
    #[error("target size must be positive, got {0} MB")]
    NonPositiveTargetSize(f64),
    #[error("padding must be non-negative (before {0}s, after {1}s)")]
    NegativePadding(f64, f64),
}

/// Immutable description of one requested transformation.
///
/// The effective output path is either the explicit override or derived from
/// the input stem and the job kind; `output_path()` resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub input: PathBuf,
    /// Explicit output path; None means "derive from input and kind"
    pub output_override: Option<PathBuf>,
    pub kind: JobKind,
}

impl JobDescriptor {
    pub fn new(input: impl Into<PathBuf>, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.into(),
            output_override: None,
            kind,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output_override = Some(output.into());
        self
    }

    /// Resolve the effective output path for the current parameters
    pub fn output_path(&self) -> PathBuf {
        if let Some(ref output) = self.output_override {
            return output.clone();
        }
        self.derived_output()
    }

    fn derived_output(&self) -> PathBuf {
        let stem = self
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let parent = self.input.parent().unwrap_or_else(|| Path::new("."));

        let name = match &self.kind {
            JobKind::RateConvert { target_fps, encode, .. } => {
                format!("{}_{}fps.{}", stem, format_fps(*target_fps), encode.container.extension())
            }
            JobKind::Upscale { scale, encode, .. } => {
                format!("{}_x{}.{}", stem, scale, encode.container.extension())
            }
            JobKind::Compress { container, .. } => {
                format!("{}_compressed.{}", stem, container.extension())
            }
            JobKind::PadAudio { format, .. } => {
                format!("{}_padded.{}", stem, format.extension())
            }
        };
        parent.join(name)
    }

    /// Check the descriptor invariants
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let output = self.output_path();
        if output == self.input {
            return Err(DescriptorError::OutputEqualsInput(output));
        }
        match &self.kind {
            JobKind::RateConvert { target_fps, .. } => {
                if !(*target_fps > 0.0 && *target_fps <= MAX_TARGET_FPS) {
                    return Err(DescriptorError::TargetFpsOutOfRange(*target_fps));
                }
            }
            JobKind::Upscale { scale, model, .. } => {
                if !(2..=4).contains(scale) {
                    return Err(DescriptorError::BadScaleFactor(*scale));
                }
                if model.trim().is_empty() {
                    return Err(DescriptorError::EmptyModelName);
                }
            }
            JobKind::Compress { target_size_mb, .. } => {
                if !(*target_size_mb > 0.0) {
                    return Err(DescriptorError::NonPositiveTargetSize(*target_size_mb));
                }
            }
            JobKind::PadAudio { pad_before, pad_after, .. } => {
                if *pad_before < 0.0 || *pad_after < 0.0 {
                    return Err(DescriptorError::NegativePadding(*pad_before, *pad_after));
                }
            }
        }
        Ok(())
    }
}

fn format_fps(fps: f64) -> String {
    if fps.fract().abs() < 1e-9 {
        format!("{}", fps as u64)
    } else {
        format!("{:.2}", fps)
    }
}

/// Lifecycle of one job.
///
/// `pending -> probing -> ready -> running -> {completed | failed | cancelled}`.
/// Probing and ready are reachable once; a queue-wide cancel moves pending,
/// probing, and ready jobs straight to cancelled without running them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Probing,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Probing)
                | (Pending, Cancelled)
                | (Probing, Ready)
                | (Probing, Failed)
                | (Probing, Cancelled)
                | (Ready, Running)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Probing => "probing",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Latest parsed progress snapshot for the running job.
///
/// Replaced on every update, never appended. Serializes with the field names
/// the `job-progress` event channel carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    /// Fractional completion in [0, 100]
    pub completion_percent: f64,
    pub frame_count: u64,
    pub instant_fps: f64,
    /// Engine-reported output time, HH:MM:SS.ss
    pub elapsed_display: String,
    /// Engine-reported speed multiplier, e.g. "2.41x"
    pub speed_multiplier: String,
}

impl Default for ProgressSample {
    fn default() -> Self {
        Self {
            completion_percent: 0.0,
            frame_count: 0,
            instant_fps: 0.0,
            elapsed_display: "00:00:00.00".to_string(),
            speed_multiplier: "0x".to_string(),
        }
    }
}

/// Terminal result of one job episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub success: bool,
    pub output_path: PathBuf,
    pub input_duration_seconds: f64,
    pub output_duration_seconds: f64,
    pub duration_delta_seconds: f64,
    pub duration_valid: bool,
    pub message: String,
}

/// One queue entry: a descriptor plus everything learned about it since
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub descriptor: JobDescriptor,
    pub metadata: Option<MediaMetadata>,
    pub status: JobStatus,
    pub progress: Option<ProgressSample>,
    pub outcome: Option<JobOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            metadata: None,
            status: JobStatus::Pending,
            progress: None,
            outcome: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id
    }

    /// Short name for logs and the aggregate view
    pub fn display_name(&self) -> String {
        self.descriptor
            .input
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.descriptor.input.display().to_string())
    }
}

/// Derived, whole-queue view; recomputed on every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAggregate {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Index of the running job in enqueue order, if any
    pub active_index: Option<usize>,
    pub active_name: Option<String>,
    /// (completed jobs + running job's fraction) / total * 100; failed and
    /// cancelled jobs stay visible in their counts instead of padding the bar
    pub overall_percent: f64,
}

impl BatchAggregate {
    pub fn empty() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            active_index: None,
            active_name: None,
            overall_percent: 0.0,
        }
    }

    pub fn from_records(records: &[JobRecord]) -> Self {
        let total = records.len();
        if total == 0 {
            return Self::empty();
        }

        let completed = records.iter().filter(|r| r.status == JobStatus::Completed).count();
        let failed = records.iter().filter(|r| r.status == JobStatus::Failed).count();
        let cancelled = records.iter().filter(|r| r.status == JobStatus::Cancelled).count();

        let active_index = records.iter().position(|r| r.status == JobStatus::Running);
        let active_name = active_index.map(|i| records[i].display_name());
        let active_fraction = active_index
            .and_then(|i| records[i].progress.as_ref())
            .map(|p| (p.completion_percent / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let overall_percent = (completed as f64 + active_fraction) / total as f64 * 100.0;

        Self {
            total,
            completed,
            failed,
            cancelled,
            active_index,
            active_name,
            overall_percent,
        }
    }
}
