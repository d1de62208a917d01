use std::path::Path;

use crate::job::{
    AudioFormat, AudioQuality, EncodeOptions, InterpolationMethod, OutputFormat, QualityPreset,
};

/// Sentinel embedded in the error of an episode that was terminated by a
/// cancellation request. The queue classifies an episode as cancelled (not
/// failed) exactly when the error message contains this marker; no other
/// string is ever sniffed for.
pub const CANCEL_MARKER: &str = "cancelled by request";

/// Audio budget assumed when sizing compressed output
const COMPRESS_AUDIO_BITRATE: u64 = 128_000;
/// Floor below which a compression target is not worth attempting
const MIN_VIDEO_BITRATE: u64 = 100_000;
/// Container/muxing overhead reserve taken off the size budget
const MUX_OVERHEAD: f64 = 0.95;

/// ffmpeg filter expression for a non-AI rate conversion; None for RIFE,
/// which runs as a frame pipeline instead of a single filter pass
pub fn interpolation_filter(method: InterpolationMethod, target_fps: f64) -> Option<String> {
    match method {
        InterpolationMethod::Minterpolate => Some(format!(
            "minterpolate=fps={}:mi_mode=mci:mc_mode=aobmc:me_mode=bidir:vsbmc=1",
            target_fps
        )),
        InterpolationMethod::Blend => Some(format!(
            "framerate=fps={}:interp_start=0:interp_end=255:scene=8.2",
            target_fps
        )),
        InterpolationMethod::Duplicate => Some(format!("fps={}", target_fps)),
        InterpolationMethod::Rife => None,
    }
}

fn videotoolbox_quality(preset: QualityPreset) -> u32 {
    match preset {
        QualityPreset::Fast => 50,
        QualityPreset::Balanced => 65,
        QualityPreset::Quality => 80,
    }
}

fn vp9_crf(preset: QualityPreset) -> &'static str {
    match preset {
        QualityPreset::Fast => "35",
        QualityPreset::Balanced => "30",
        QualityPreset::Quality => "25",
    }
}

fn x265_crf(preset: QualityPreset) -> &'static str {
    match preset {
        QualityPreset::Fast => "28",
        QualityPreset::Balanced => "23",
        QualityPreset::Quality => "18",
    }
}

fn x264_crf(preset: QualityPreset) -> &'static str {
    match preset {
        QualityPreset::Fast => "23",
        QualityPreset::Balanced => "18",
        QualityPreset::Quality => "15",
    }
}

/// Video codec argument block for the selected container/preset/hardware mix
pub fn video_codec_args(encode: &EncodeOptions) -> Vec<String> {
    let mut args = Vec::new();
    match encode.container {
        OutputFormat::Webm => {
            args.extend([
                "-c:v".to_string(),
                "libvpx-vp9".to_string(),
                "-crf".to_string(),
                vp9_crf(encode.preset).to_string(),
                "-b:v".to_string(),
                "0".to_string(),
            ]);
        }
        OutputFormat::Mp4 | OutputFormat::Mov => {
            if encode.use_hw_accel {
                if encode.use_hevc {
                    args.extend([
                        "-c:v".to_string(),
                        "hevc_videotoolbox".to_string(),
                        "-q:v".to_string(),
                        videotoolbox_quality(encode.preset).to_string(),
                        "-tag:v".to_string(),
                        "hvc1".to_string(),
                        "-allow_sw".to_string(),
                        "1".to_string(),
                    ]);
                } else {
                    args.extend([
                        "-c:v".to_string(),
                        "h264_videotoolbox".to_string(),
                        "-q:v".to_string(),
                        videotoolbox_quality(encode.preset).to_string(),
                        "-allow_sw".to_string(),
                        "1".to_string(),
                    ]);
                }
            } else if encode.use_hevc {
                args.extend([
                    "-c:v".to_string(),
                    "libx265".to_string(),
                    "-preset".to_string(),
                    "medium".to_string(),
                    "-crf".to_string(),
                    x265_crf(encode.preset).to_string(),
                    "-tag:v".to_string(),
                    "hvc1".to_string(),
                ]);
            } else {
                args.extend([
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-preset".to_string(),
                    "medium".to_string(),
                    "-crf".to_string(),
                    x264_crf(encode.preset).to_string(),
                ]);
            }
        }
    }
    args
}

/// Pass-through audio for mp4/mov, opus re-encode for webm
pub fn audio_codec_for(container: OutputFormat) -> &'static str {
    match container {
        OutputFormat::Webm => "libopus",
        OutputFormat::Mp4 | OutputFormat::Mov => "copy",
    }
}

fn push_progress_args(args: &mut Vec<String>) {
    args.extend(["-progress".to_string(), "pipe:1".to_string(), "-nostats".to_string()]);
}

/// ffmpeg invocation for a single-pass rate conversion (minterpolate, blend,
/// or duplicate). RIFE does not go through here.
pub fn build_rate_convert_args(
    input: &Path,
    output: &Path,
    target_fps: f64,
    method: InterpolationMethod,
    encode: &EncodeOptions,
) -> Vec<String> {
    let filter = interpolation_filter(method, target_fps)
        .unwrap_or_else(|| format!("fps={}", target_fps));

    let mut args = vec![
        "-y".to_string(),
        "-threads".to_string(),
        "0".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-filter:v".to_string(),
        filter,
        "-filter_threads".to_string(),
        "0".to_string(),
    ];
    args.extend(video_codec_args(encode));
    args.extend(["-c:a".to_string(), audio_codec_for(encode.container).to_string()]);
    push_progress_args(&mut args);
    args.push(output.display().to_string());
    args
}

/// Video bitrate (bits/s) that lands the output near the target size after
/// reserving the audio budget and mux overhead
pub fn compute_video_bitrate(target_size_mb: f64, duration_secs: f64) -> u64 {
    if duration_secs <= 0.0 {
        return MIN_VIDEO_BITRATE;
    }
    let total_bits = target_size_mb * 1024.0 * 1024.0 * 8.0 * MUX_OVERHEAD;
    let video_bits = total_bits / duration_secs - COMPRESS_AUDIO_BITRATE as f64;
    (video_bits as i64).max(MIN_VIDEO_BITRATE as i64) as u64
}

fn scale_filter(target_width: Option<u32>, target_height: Option<u32>) -> Option<String> {
    match (target_width, target_height) {
        (Some(w), Some(h)) => Some(format!("scale={}:{}", w, h)),
        (Some(w), None) => Some(format!("scale={}:-2", w)),
        (None, Some(h)) => Some(format!("scale=-2:{}", h)),
        (None, None) => None,
    }
}

/// ffmpeg invocation for size-targeted compression
#[allow(clippy::too_many_arguments)]
pub fn build_compress_args(
    input: &Path,
    output: &Path,
    duration_secs: f64,
    target_size_mb: f64,
    target_width: Option<u32>,
    target_height: Option<u32>,
    use_hw_accel: bool,
    container: OutputFormat,
) -> Vec<String> {
    let bitrate = compute_video_bitrate(target_size_mb, duration_secs);

    let mut args = vec![
        "-y".to_string(),
        "-threads".to_string(),
        "0".to_string(),
        "-i".to_string(),
        input.display().to_string(),
    ];

    if let Some(filter) = scale_filter(target_width, target_height) {
        args.extend(["-filter:v".to_string(), filter]);
    }

    match container {
        OutputFormat::Webm => {
            args.extend([
                "-c:v".to_string(),
                "libvpx-vp9".to_string(),
                "-b:v".to_string(),
                bitrate.to_string(),
                "-c:a".to_string(),
                "libopus".to_string(),
                "-b:a".to_string(),
                COMPRESS_AUDIO_BITRATE.to_string(),
            ]);
        }
        OutputFormat::Mp4 | OutputFormat::Mov => {
            if use_hw_accel {
                args.extend([
                    "-c:v".to_string(),
                    "h264_videotoolbox".to_string(),
                    "-b:v".to_string(),
                    bitrate.to_string(),
                    "-allow_sw".to_string(),
                    "1".to_string(),
                ]);
            } else {
                args.extend([
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-preset".to_string(),
                    "medium".to_string(),
                    "-b:v".to_string(),
                    bitrate.to_string(),
                ]);
            }
            args.extend([
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                COMPRESS_AUDIO_BITRATE.to_string(),
            ]);
        }
    }

    push_progress_args(&mut args);
    args.push(output.display().to_string());
    args
}

/// Audio filter chain applying leading/trailing silence
pub fn pad_filter(pad_before: f64, pad_after: f64) -> String {
    let before_ms = (pad_before * 1000.0).round() as u64;
    match (before_ms > 0, pad_after > 0.0) {
        (true, true) => format!("adelay=delays={}:all=1,apad=pad_dur={}", before_ms, pad_after),
        (true, false) => format!("adelay=delays={}:all=1", before_ms),
        (false, true) => format!("apad=pad_dur={}", pad_after),
        (false, false) => "anull".to_string(),
    }
}

fn audio_encode_args(format: AudioFormat, quality: AudioQuality) -> Vec<String> {
    match format {
        AudioFormat::Mp3 => {
            let bitrate = match quality {
                AudioQuality::Low => "96k",
                AudioQuality::Standard => "192k",
                AudioQuality::High => "320k",
            };
            vec!["-c:a".into(), "libmp3lame".into(), "-b:a".into(), bitrate.into()]
        }
        AudioFormat::Aac => {
            let bitrate = match quality {
                AudioQuality::Low => "96k",
                AudioQuality::Standard => "160k",
                AudioQuality::High => "256k",
            };
            vec!["-c:a".into(), "aac".into(), "-b:a".into(), bitrate.into()]
        }
        AudioFormat::Wav => vec!["-c:a".into(), "pcm_s16le".into()],
        AudioFormat::Flac => vec!["-c:a".into(), "flac".into()],
    }
}

/// ffmpeg invocation for an audio padding job
pub fn build_pad_audio_args(
    input: &Path,
    output: &Path,
    pad_before: f64,
    pad_after: f64,
    format: AudioFormat,
    quality: AudioQuality,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-af".to_string(),
        pad_filter(pad_before, pad_after),
        "-vn".to_string(),
    ];
    args.extend(audio_encode_args(format, quality));
    push_progress_args(&mut args);
    args.push(output.display().to_string());
    args
}

// ---- Frame pipeline stages (RIFE interpolation, Real-ESRGAN upscale) ----

/// Stage 1: dump the input into numbered PNG frames
pub fn build_frame_extract_args(input: &Path, frames_dir: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-qscale:v".to_string(),
        "2".to_string(),
        format!("{}/frame_%08d.png", frames_dir.display()),
    ]
}

/// Side channel: lift the audio track out for the final remux
pub fn build_audio_extract_args(input: &Path, audio_path: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-vn".to_string(),
        "-acodec".to_string(),
        "copy".to_string(),
        audio_path.display().to_string(),
    ]
}

/// Stage 2 (rate conversion): rife-ncnn-vulkan over the extracted frames
pub fn build_rife_args(
    input_dir: &Path,
    output_dir: &Path,
    model_dir: &Path,
    target_frames: usize,
) -> Vec<String> {
    vec![
        "-i".to_string(),
        input_dir.display().to_string(),
        "-o".to_string(),
        output_dir.display().to_string(),
        "-m".to_string(),
        model_dir.display().to_string(),
        "-n".to_string(),
        target_frames.to_string(),
        "-f".to_string(),
        "frame_%08d.png".to_string(),
    ]
}

/// Stage 2 (upscale): realesrgan-ncnn-vulkan over the extracted frames
pub fn build_realesrgan_args(
    input_dir: &Path,
    output_dir: &Path,
    model: &str,
    scale: u32,
) -> Vec<String> {
    vec![
        "-i".to_string(),
        input_dir.display().to_string(),
        "-o".to_string(),
        output_dir.display().to_string(),
        "-n".to_string(),
        model.to_string(),
        "-s".to_string(),
        scale.to_string(),
        "-f".to_string(),
        "png".to_string(),
    ]
}

/// Stage 3: encode processed frames back into a video, remuxing audio when
/// present. `adjust_fps` adds a final fps filter when the frame count the AI
/// stage produced overshoots the requested rate.
pub fn build_frame_encode_args(
    frames_dir: &Path,
    encode_fps: f64,
    audio_path: Option<&Path>,
    encode: &EncodeOptions,
    adjust_fps: Option<f64>,
    output: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-framerate".to_string(),
        encode_fps.to_string(),
        "-i".to_string(),
        format!("{}/frame_%08d.png", frames_dir.display()),
    ];

    if let Some(audio) = audio_path {
        args.extend(["-i".to_string(), audio.display().to_string()]);
    }

    args.extend(video_codec_args(encode));

    if audio_path.is_some() {
        let audio_codec = match encode.container {
            OutputFormat::Webm => "libopus",
            OutputFormat::Mp4 | OutputFormat::Mov => "aac",
        };
        args.extend([
            "-c:a".to_string(),
            audio_codec.to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "1:a".to_string(),
        ]);
    }

    if let Some(fps) = adjust_fps {
        args.extend(["-filter:v".to_string(), format!("fps={}", fps)]);
    }

    args.push(output.display().to_string());
    args
}

/// RIFE needs a power-of-two multiplier; pick the smallest one that reaches
/// the target rate, never below 2x
pub fn rife_multiplier(input_fps: f64, target_fps: f64) -> u32 {
    if input_fps <= 0.0 {
        return 2;
    }
    let multiplier = (target_fps / input_fps).ceil() as u32;
    multiplier.next_power_of_two().max(2)
}

/// Total frames the engine should emit for a rate conversion, when the
/// duration is known
pub fn expected_output_frames(target_fps: f64, duration_secs: f64) -> Option<u64> {
    if target_fps > 0.0 && duration_secs > 0.0 {
        Some((target_fps * duration_secs).round() as u64)
    } else {
        None
    }
}
