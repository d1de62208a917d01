use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::BatchConfig;

/// Probe failure taxonomy surfaced to the queue and its subscribers.
///
/// A job whose input fails to probe never becomes runnable; the variant
/// message is what lands in the job's error field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("probe failed: {0}")]
    Failed(String),
}

/// Metadata fetched once per input before its job becomes runnable.
///
/// For audio-only inputs the video fields are zero and the audio fields are
/// populated instead. `thumbnail` is reserved for an external thumbnailer
/// and is never filled by the probe itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Container duration in seconds
    pub duration: f64,
    /// Average video frame rate (0.0 for audio-only inputs)
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Codec of the primary stream (video if present, else audio)
    pub codec: String,
    /// Overall bitrate in bits per second, when the container reports one
    pub bitrate: Option<u64>,
    /// Input file size in bytes
    pub file_size: u64,
    /// Audio sample rate in Hz, when an audio stream exists
    pub sample_rate: Option<u32>,
    /// Audio channel count, when an audio stream exists
    pub channels: Option<u32>,
    pub thumbnail: Option<String>,
}

/// Raw ffprobe JSON output
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeData {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: Option<FfprobeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeFormat {
    #[serde(rename = "format_name")]
    pub format_name: Option<String>,
    pub duration: Option<String>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    pub size: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeStream {
    pub index: i32,
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(rename = "avg_frame_rate")]
    pub avg_frame_rate: Option<String>,
    #[serde(rename = "r_frame_rate")]
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    #[serde(rename = "sample_rate")]
    pub sample_rate: Option<String>,
    pub channels: Option<u32>,
}

/// Parse an ffprobe frame-rate expression ("30000/1001", "25/1", "30")
pub fn parse_frame_rate(fps_str: &str) -> f64 {
    if let Some((num, den)) = fps_str.split_once('/') {
        let num: f64 = num.trim().parse().unwrap_or(0.0);
        let den: f64 = den.trim().parse().unwrap_or(0.0);
        if den > 0.0 {
            return num / den;
        }
        return 0.0;
    }
    fps_str.trim().parse().unwrap_or(0.0)
}

/// Run ffprobe against a file and return its parsed metadata
pub async fn probe_media(cfg: &BatchConfig, path: &Path) -> Result<MediaMetadata, ProbeError> {
    use log::debug;

    if !path.exists() {
        return Err(ProbeError::NotFound(path.to_path_buf()));
    }

    debug!("ffprobe: probing {}", path.display());

    let output = Command::new(&cfg.ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .output()
        .await
        .map_err(|e| ProbeError::Failed(format!("failed to execute ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(ProbeError::Failed(format!(
            "ffprobe exit code {} for {}: {}",
            exit_code,
            path.display(),
            stderr.trim()
        )));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    parse_probe_output(&json_str, path, file_size)
}

/// Probe just the duration of a file (used for output-side validation)
pub async fn probe_duration(cfg: &BatchConfig, path: &Path) -> Result<f64, ProbeError> {
    let info = probe_media(cfg, path).await?;
    Ok(info.duration)
}

/// Turn raw ffprobe JSON into MediaMetadata.
///
/// Duration comes from the format section, falling back to the primary
/// stream. Inputs with neither a video nor an audio stream are rejected as
/// unsupported.
pub fn parse_probe_output(
    json_str: &str,
    path: &Path,
    file_size: u64,
) -> Result<MediaMetadata, ProbeError> {
    let data: FfprobeData = serde_json::from_str(json_str)
        .map_err(|e| ProbeError::Failed(format!("bad ffprobe JSON for {}: {}", path.display(), e)))?;

    let video = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let primary = match (video, audio) {
        (Some(v), _) => v,
        (None, Some(a)) => a,
        (None, None) => return Err(ProbeError::UnsupportedFormat(path.to_path_buf())),
    };

    let format_duration = data
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let stream_duration = primary
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok());
    let duration = format_duration.or(stream_duration).unwrap_or(0.0);

    let fps = video
        .and_then(|v| v.avg_frame_rate.as_deref().or(v.r_frame_rate.as_deref()))
        .map(parse_frame_rate)
        .unwrap_or(0.0);

    let bitrate = data
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    Ok(MediaMetadata {
        duration,
        fps,
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        codec: primary.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
        bitrate,
        file_size,
        sample_rate: audio
            .and_then(|a| a.sample_rate.as_deref())
            .and_then(|s| s.parse::<u32>().ok()),
        channels: audio.and_then(|a| a.channels),
        thumbnail: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate_fractional() {
        let fps = parse_frame_rate("30000/1001");
        assert!((fps - 29.97).abs() < 0.01, "expected ~29.97, got {}", fps);
    }

    #[test]
    fn test_parse_frame_rate_whole_fraction() {
        assert_eq!(parse_frame_rate("25/1"), 25.0);
        assert_eq!(parse_frame_rate("60/1"), 60.0);
    }

    #[test]
    fn test_parse_frame_rate_plain_and_garbage() {
        assert_eq!(parse_frame_rate("30"), 30.0);
        assert_eq!(parse_frame_rate("0/0"), 0.0);
        assert_eq!(parse_frame_rate("abc"), 0.0);
        assert_eq!(parse_frame_rate(""), 0.0);
    }

    const VIDEO_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "avg_frame_rate": "30000/1001",
                "r_frame_rate": "30000/1001"
            },
            {
                "index": 1,
                "codec_type": "audio",
                "codec_name": "aac",
                "sample_rate": "48000",
                "channels": 2
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "42.519000",
            "bit_rate": "5136000",
            "size": "27301234"
        }
    }"#;

    #[test]
    fn test_parse_probe_output_video() {
        let info = parse_probe_output(VIDEO_JSON, Path::new("/tmp/in.mp4"), 27_301_234)
            .expect("parse");
        assert!((info.duration - 42.519).abs() < 1e-9);
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.codec, "h264");
        assert_eq!(info.bitrate, Some(5_136_000));
        assert_eq!(info.file_size, 27_301_234);
        assert_eq!(info.sample_rate, Some(48_000));
        assert_eq!(info.channels, Some(2));
        assert!(info.thumbnail.is_none());
    }

    #[test]
    fn test_parse_probe_output_audio_only() {
        let json = r#"{
            "streams": [
                {
                    "index": 0,
                    "codec_type": "audio",
                    "codec_name": "mp3",
                    "sample_rate": "44100",
                    "channels": 2,
                    "duration": "183.400000"
                }
            ],
            "format": {"format_name": "mp3"}
        }"#;
        let info = parse_probe_output(json, Path::new("/tmp/song.mp3"), 123).expect("parse");
        assert_eq!(info.fps, 0.0);
        assert_eq!(info.width, 0);
        assert_eq!(info.codec, "mp3");
        // format carried no duration; stream duration is the fallback
        assert!((info.duration - 183.4).abs() < 1e-9);
    }

    #[test]
    fn test_parse_probe_output_no_streams_is_unsupported() {
        let json = r#"{"streams": [], "format": {"format_name": "bin"}}"#;
        let err = parse_probe_output(json, Path::new("/tmp/file.bin"), 0).unwrap_err();
        assert!(matches!(err, ProbeError::UnsupportedFormat(_)));
        assert!(err.to_string().starts_with("unsupported format"));
    }

    #[test]
    fn test_parse_probe_output_bad_json() {
        let err = parse_probe_output("not json at all", Path::new("/tmp/x"), 0).unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }

    #[tokio::test]
    async fn test_probe_media_missing_file() {
        let cfg = BatchConfig::default_config();
        let err = probe_media(&cfg, Path::new("/nonexistent/clip.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
        assert!(err.to_string().starts_with("not found"));
    }

    #[tokio::test]
    async fn test_probe_media_real_clip() {
        // Needs ffmpeg + ffprobe on PATH; skipped otherwise.
        let cfg = BatchConfig::default_config();
        if Command::new(&cfg.ffmpeg_bin).arg("-version").output().await.is_err()
            || Command::new(&cfg.ffprobe_bin).arg("-version").output().await.is_err()
        {
            println!("ffmpeg/ffprobe not available, skipping integration test");
            return;
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let clip = dir.path().join("clip.mp4");
        let status = Command::new(&cfg.ffmpeg_bin)
            .args([
                "-y",
                "-f",
                "lavfi",
                "-i",
                "testsrc=duration=2:size=320x240:rate=25",
            ])
            .arg(&clip)
            .output()
            .await
            .expect("run ffmpeg");
        assert!(status.status.success(), "test clip generation failed");

        let info = probe_media(&cfg, &clip).await.expect("probe");
        assert!((info.duration - 2.0).abs() < 0.2, "duration {}", info.duration);
        assert!((info.fps - 25.0).abs() < 0.5, "fps {}", info.fps);
        assert_eq!(info.width, 320);
        assert_eq!(info.height, 240);
        assert!(info.file_size > 0);
    }
}
