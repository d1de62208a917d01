use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

/// Extensions eligible for video jobs
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "mpg", "mpeg", "ts", "wmv", "flv",
];

/// Extensions eligible for audio-pad jobs
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "aac", "flac", "ogg", "opus"];

/// Which inputs a collection pass is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Video,
    Audio,
}

impl MediaClass {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            MediaClass::Video => VIDEO_EXTENSIONS,
            MediaClass::Audio => AUDIO_EXTENSIONS,
        }
    }

    /// Extension check, case-insensitive
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .map(|ext| self.extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }
}

/// Result of examining one command-line input
#[derive(Debug, Clone)]
pub enum CollectResult {
    /// File to enqueue (path, size in bytes)
    Candidate(PathBuf, u64),
    /// Input that will not be enqueued (path, reason)
    Skipped(PathBuf, String),
}

/// Expand command-line inputs into concrete media files.
///
/// Files are taken as-is when their extension matches the class and are
/// reported as skipped when it does not; directories are walked recursively
/// with non-matching entries ignored silently.
pub fn collect_inputs(inputs: &[PathBuf], class: MediaClass) -> Vec<CollectResult> {
    let mut results = Vec::new();

    for input in inputs {
        if !input.exists() {
            warn!("input does not exist: {}", input.display());
            results.push(CollectResult::Skipped(
                input.clone(),
                "does not exist".to_string(),
            ));
            continue;
        }

        if input.is_file() {
            results.push(examine_file(input, class));
            continue;
        }

        info!("scanning directory: {}", input.display());
        let mut found = 0usize;
        for entry in WalkDir::new(input).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("error reading directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || !class.matches(path) {
                continue;
            }
            found += 1;
            results.push(examine_file(path, class));
        }
        info!("found {} media files under {}", found, input.display());
    }

    results
}

fn examine_file(path: &Path, class: MediaClass) -> CollectResult {
    if !class.matches(path) {
        return CollectResult::Skipped(
            path.to_path_buf(),
            "extension not recognized".to_string(),
        );
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => {
            CollectResult::Skipped(path.to_path_buf(), "empty file".to_string())
        }
        Ok(meta) => {
            debug!("candidate: {} ({} bytes)", path.display(), meta.len());
            CollectResult::Candidate(path.to_path_buf(), meta.len())
        }
        Err(e) => CollectResult::Skipped(path.to_path_buf(), format!("stat failed: {}", e)),
    }
}

/// Just the candidate paths, in collection order
pub fn candidate_paths(results: &[CollectResult]) -> Vec<PathBuf> {
    results
        .iter()
        .filter_map(|r| match r {
            CollectResult::Candidate(path, _) => Some(path.clone()),
            CollectResult::Skipped(..) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, bytes).expect("write");
    }

    #[test]
    fn test_class_matching_is_case_insensitive() {
        assert!(MediaClass::Video.matches(Path::new("/m/CLIP.MKV")));
        assert!(MediaClass::Video.matches(Path::new("/m/clip.mp4")));
        assert!(!MediaClass::Video.matches(Path::new("/m/notes.txt")));
        assert!(!MediaClass::Video.matches(Path::new("/m/no_extension")));
        assert!(MediaClass::Audio.matches(Path::new("/m/Voice.WAV")));
        assert!(!MediaClass::Audio.matches(Path::new("/m/clip.mp4")));
    }

    #[test]
    fn test_explicit_file_with_wrong_extension_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = dir.path().join("notes.txt");
        touch(&doc, b"hello");

        let results = collect_inputs(&[doc.clone()], MediaClass::Video);
        assert_eq!(results.len(), 1);
        match &results[0] {
            CollectResult::Skipped(path, reason) => {
                assert_eq!(path, &doc);
                assert!(reason.contains("extension"));
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_directory_walk_filters_by_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("a.mp4"), b"xx");
        touch(&dir.path().join("b.wav"), b"xx");
        touch(&dir.path().join("nested/c.mkv"), b"xx");
        touch(&dir.path().join("nested/readme.md"), b"xx");

        let video = collect_inputs(&[dir.path().to_path_buf()], MediaClass::Video);
        let mut names: Vec<String> = candidate_paths(&video)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.mp4", "c.mkv"]);
        // Non-matching directory entries are ignored, not reported
        assert_eq!(video.len(), 2);

        let audio = collect_inputs(&[dir.path().to_path_buf()], MediaClass::Audio);
        assert_eq!(candidate_paths(&audio), vec![dir.path().join("b.wav")]);
    }

    #[test]
    fn test_empty_file_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = dir.path().join("clip.mp4");
        touch(&clip, b"");

        let results = collect_inputs(&[clip], MediaClass::Video);
        assert!(matches!(
            &results[0],
            CollectResult::Skipped(_, reason) if reason == "empty file"
        ));
    }

    #[test]
    fn test_missing_input_is_skipped() {
        let results = collect_inputs(
            &[PathBuf::from("/definitely/not/here.mp4")],
            MediaClass::Video,
        );
        assert!(matches!(
            &results[0],
            CollectResult::Skipped(_, reason) if reason == "does not exist"
        ));
    }
}
