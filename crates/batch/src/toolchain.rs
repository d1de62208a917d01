use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::BatchConfig;

/// ffmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    /// Parse version from an ffmpeg banner line
    /// Example: "ffmpeg version 7.1.2" -> ToolVersion { major: 7, minor: 1, patch: 2 }
    pub fn parse(version_str: &str) -> Result<Self> {
        // Distro builds append suffixes like "-3ubuntu5"; take the leading
        // digit run of each dotted component
        fn leading_number(part: &str) -> Option<u32> {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }

        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        let parts: Vec<&str> = version_part.split('.').collect();

        let major = leading_number(parts[0])
            .with_context(|| format!("Failed to parse major version from: {}", parts[0]))?;
        let minor = parts.get(1).and_then(|p| leading_number(p)).unwrap_or(0);
        let patch = parts.get(2).and_then(|p| leading_number(p)).unwrap_or(0);

        Ok(ToolVersion { major, minor, patch })
    }
}

impl std::fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Snapshot of which external engines are reachable on this machine.
///
/// `available` gates the queue: without both ffmpeg and ffprobe no job can
/// run. The AI engines are optional; their absence only disables the job
/// kinds that need them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolchainStatus {
    pub available: bool,
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    pub ffmpeg_version: Option<String>,
    pub videotoolbox_available: bool,
    pub hevc_available: bool,
    pub rife_path: Option<String>,
    pub rife_model_dir: Option<PathBuf>,
    pub realesrgan_path: Option<String>,
}

impl ToolchainStatus {
    pub fn rife_available(&self) -> bool {
        self.rife_path.is_some() && self.rife_model_dir.is_some()
    }

    pub fn realesrgan_available(&self) -> bool {
        self.realesrgan_path.is_some()
    }
}

/// Resolve a configured binary: absolute paths are taken as-is when they
/// exist, bare names go through `which`
async fn locate(bin: &Path) -> Option<String> {
    if bin.is_absolute() {
        return bin.exists().then(|| bin.display().to_string());
    }

    let output = Command::new("which").arg(bin).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!found.is_empty()).then_some(found)
}

async fn banner_version(ffmpeg_bin: &str) -> Option<String> {
    let output = Command::new(ffmpeg_bin).arg("-version").output().await.ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(|l| l.to_string())
}

async fn detect_videotoolbox(ffmpeg_bin: &str) -> (bool, bool) {
    let output = Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await;
    output
        .ok()
        .map(|o| {
            let stdout = String::from_utf8_lossy(&o.stdout);
            (
                stdout.contains("h264_videotoolbox"),
                stdout.contains("hevc_videotoolbox"),
            )
        })
        .unwrap_or((false, false))
}

/// Probe every configured engine and report what this host can actually run
pub async fn inspect_toolchain(config: &BatchConfig) -> ToolchainStatus {
    let ffmpeg_path = locate(&config.ffmpeg_bin).await;
    let ffprobe_path = locate(&config.ffprobe_bin).await;

    let ffmpeg_version = match &ffmpeg_path {
        Some(bin) => banner_version(bin).await,
        None => None,
    };

    let (videotoolbox_available, hevc_available) = match &ffmpeg_path {
        Some(bin) => detect_videotoolbox(bin).await,
        None => (false, false),
    };

    let rife_path = locate(&config.rife_bin).await;
    let rife_model_dir = config.rife_model_dirs.iter().find(|d| d.exists()).cloned();
    let realesrgan_path = locate(&config.realesrgan_bin).await;

    let available = ffmpeg_path.is_some() && ffprobe_path.is_some();

    ToolchainStatus {
        available,
        ffmpeg_path,
        ffprobe_path,
        ffmpeg_version,
        videotoolbox_available,
        hevc_available,
        rife_path,
        rife_model_dir,
        realesrgan_path,
    }
}
