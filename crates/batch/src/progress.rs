use crate::job::ProgressSample;

/// Incremental parser for ffmpeg's `-progress pipe:1 -nostats` output.
///
/// The engine writes one `key=value` pair per line and terminates each block
/// with `progress=continue` or `progress=end`. Field lines update internal
/// state and yield nothing; a block terminator yields a snapshot. Anything
/// unrecognizable is ignored, and a field whose value fails to parse keeps
/// its previous value so a flaky line never zeroes the display.
///
/// `out_time_ms` is microseconds despite the name; that quirk is ffmpeg's.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_duration: f64,
    expected_frames: Option<u64>,
    frame: u64,
    fps: f64,
    out_time_us: u64,
    speed: String,
    finished: bool,
}

impl ProgressParser {
    /// `total_duration` is the input duration in seconds; `expected_frames`
    /// (when the caller can compute it from target parameters) switches the
    /// completion fraction from time-based to frame-based.
    pub fn new(total_duration: f64, expected_frames: Option<u64>) -> Self {
        Self {
            total_duration,
            expected_frames,
            frame: 0,
            fps: 0.0,
            out_time_us: 0,
            speed: "0x".to_string(),
            finished: false,
        }
    }

    /// Feed one raw line; returns a sample when a progress block completes
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressSample> {
        let line = line.trim();

        if let Some(v) = line.strip_prefix("frame=") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.frame = n;
            }
            None
        } else if let Some(v) = line.strip_prefix("fps=") {
            if let Ok(n) = v.trim().parse::<f64>() {
                self.fps = n;
            }
            None
        } else if let Some(v) = line.strip_prefix("out_time_ms=") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.out_time_us = n;
            }
            None
        } else if let Some(v) = line.strip_prefix("speed=") {
            let v = v.trim();
            if !v.is_empty() && v != "N/A" {
                self.speed = v.to_string();
            }
            None
        } else if let Some(v) = line.strip_prefix("progress=") {
            if v.trim() == "end" {
                self.finished = true;
            }
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// Whether the engine has signalled `progress=end`
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Current state as a sample, regardless of block boundaries
    pub fn snapshot(&self) -> ProgressSample {
        let out_time_sec = self.out_time_us as f64 / 1_000_000.0;

        let completion_percent = if let Some(total) = self.expected_frames.filter(|t| *t > 0) {
            (self.frame as f64 / total as f64 * 100.0).min(100.0)
        } else if self.total_duration > 0.0 {
            (out_time_sec / self.total_duration * 100.0).min(100.0)
        } else {
            0.0
        };

        ProgressSample {
            completion_percent,
            frame_count: self.frame,
            instant_fps: self.fps,
            elapsed_display: format_clock(out_time_sec),
            speed_multiplier: self.speed.clone(),
        }
    }
}

/// Format seconds as HH:MM:SS.ss
pub fn format_clock(seconds: f64) -> String {
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = seconds % 60.0;
    format!("{:02}:{:02}:{:05.2}", hours, minutes, secs)
}
