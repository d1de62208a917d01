use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the batch conversion queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Path to the rife-ncnn-vulkan binary (AI frame interpolation)
    pub rife_bin: PathBuf,
    /// Path to the realesrgan-ncnn-vulkan binary (AI upscaling)
    pub realesrgan_bin: PathBuf,
    /// RIFE model directories, tried in order; the first that exists wins
    pub rife_model_dirs: Vec<PathBuf>,
    /// Root for per-job scratch directories (frame pipelines); None = system temp
    pub scratch_root: Option<PathBuf>,
    /// Capacity of the queue event broadcast channel
    pub event_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl BatchConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            rife_bin: PathBuf::from("rife-ncnn-vulkan"),
            realesrgan_bin: PathBuf::from("realesrgan-ncnn-vulkan"),
            rife_model_dirs: vec![
                PathBuf::from("/usr/local/share/rife-ncnn-vulkan/rife-v4.6"),
                PathBuf::from("/usr/local/share/rife-ncnn-vulkan/rife-v4"),
                PathBuf::from("rife-v4.6"),
            ],
            scratch_root: None,
            event_capacity: 256,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: BatchConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: BatchConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }

    /// Resolve the RIFE model directory from the configured search list
    pub fn rife_model_dir(&self) -> PathBuf {
        for dir in &self.rife_model_dirs {
            if dir.exists() {
                return dir.clone();
            }
        }
        // Fall back to the last entry (relative name resolved by the binary itself)
        self.rife_model_dirs
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("rife-v4.6"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_plain_binary_names() {
        let cfg = BatchConfig::default_config();
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(cfg.ffprobe_bin, PathBuf::from("ffprobe"));
        assert!(cfg.event_capacity > 0);
    }

    #[test]
    fn test_load_config_missing_path_returns_defaults() {
        let cfg = BatchConfig::load_config(Some(Path::new("/nonexistent/batch.toml")))
            .expect("missing file should fall back to defaults");
        assert_eq!(cfg.ffmpeg_bin, BatchConfig::default_config().ffmpeg_bin);
    }

    #[test]
    fn test_load_config_toml_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("batch.toml");
        let mut cfg = BatchConfig::default_config();
        cfg.ffmpeg_bin = PathBuf::from("/opt/ffmpeg/bin/ffmpeg");
        cfg.event_capacity = 32;
        std::fs::write(&path, toml::to_string(&cfg).expect("serialize")).expect("write");

        let loaded = BatchConfig::load_config(Some(&path)).expect("load");
        assert_eq!(loaded.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(loaded.event_capacity, 32);
    }

    #[test]
    fn test_rife_model_dir_falls_back_to_last_entry() {
        let mut cfg = BatchConfig::default_config();
        cfg.rife_model_dirs = vec![
            PathBuf::from("/definitely/not/here"),
            PathBuf::from("rife-v4.6"),
        ];
        // Neither exists on a clean machine; the relative name is returned as-is.
        assert_eq!(cfg.rife_model_dir(), PathBuf::from("rife-v4.6"));
    }
}
