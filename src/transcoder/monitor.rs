//! Diagnostic-stream reading: 8 KiB chunked reads (never a blocking line
//! read), a rolling tail for error diagnosis, and best-effort progress-field
//! parsing. Grounded in `ffmpeg_manager.py`'s `_monitor_process`.

use std::collections::VecDeque;

pub const CHUNK_SIZE: usize = 8192;
pub const TAIL_LINES: usize = 20;

const ERROR_MARKERS: &[&str] = &[
    "Connection refused",
    "No route to host",
    "No such file or directory",
    "Invalid data found when processing input",
    "Broken pipe",
    "Error opening input",
    "Server returned 404",
    "Server returned 401",
];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProgressMetrics {
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub dropped_frames: Option<u64>,
    pub speed: Option<f64>,
}

/// Accumulates raw bytes into complete lines and keeps only the last
/// [`TAIL_LINES`] for post-mortem error scanning.
pub struct TailBuffer {
    lines: VecDeque<String>,
    leftover: String,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::with_capacity(capacity), leftover: String::new(), capacity }
    }

    /// Feeds a raw chunk, returning any newly completed lines (progress lines
    /// typically use `\r` rather than `\n`, so both are treated as
    /// terminators).
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.leftover.push_str(&String::from_utf8_lossy(chunk));
        let mut completed = Vec::new();
        while let Some(pos) = self.leftover.find(['\n', '\r']) {
            let line: String = self.leftover.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if !line.is_empty() {
                self.record(line.clone());
                completed.push(line);
            }
        }
        completed
    }

    fn record(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn tail_text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Parses an ffmpeg-style progress line (`frame=... fps=29.7 ... bitrate=
/// 4001.2kbits/s ... drop=0 speed=1.0x`). Returns `None` if the line carries
/// no recognizable progress fields.
pub fn parse_progress(line: &str) -> Option<ProgressMetrics> {
    let mut metrics = ProgressMetrics::default();
    let mut found = false;

    for field in line.split_whitespace() {
        if let Some(v) = field.strip_prefix("fps=") {
            if let Ok(n) = v.parse() {
                metrics.fps = Some(n);
                found = true;
            }
        } else if let Some(v) = field.strip_prefix("bitrate=") {
            if let Ok(n) = v.trim_end_matches("kbits/s").parse() {
                metrics.bitrate_kbps = Some(n);
                found = true;
            }
        } else if let Some(v) = field.strip_prefix("drop=") {
            if let Ok(n) = v.parse() {
                metrics.dropped_frames = Some(n);
                found = true;
            }
        } else if let Some(v) = field.strip_prefix("speed=") {
            if let Ok(n) = v.trim_end_matches('x').parse() {
                metrics.speed = Some(n);
                found = true;
            }
        }
    }

    found.then_some(metrics)
}

/// Scans the tail for a recognizable error marker, most recent first.
pub fn find_error_marker(tail: &str) -> Option<String> {
    tail.lines()
        .rev()
        .find(|line| ERROR_MARKERS.iter().any(|m| line.contains(m)))
        .map(|l| l.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_keeps_only_last_n_lines() {
        let mut tail = TailBuffer::new(3);
        for i in 0..10 {
            tail.push_chunk(format!("line {i}\n").as_bytes());
        }
        assert_eq!(tail.tail_text(), "line 7\nline 8\nline 9");
    }

    #[test]
    fn tail_buffer_handles_chunk_boundaries_mid_line() {
        let mut tail = TailBuffer::new(5);
        tail.push_chunk(b"frame=10 fp");
        let completed = tail.push_chunk(b"s=29.7 bitrate=4001.2kbits/s\n");
        assert_eq!(completed.len(), 1);
        assert!(completed[0].contains("fps=29.7"));
    }

    #[test]
    fn parses_progress_fields() {
        let m = parse_progress("frame=100 fps=29.7 q=23.0 size=512kB time=00:00:03.33 bitrate=4001.2kbits/s drop=2 speed=1.0x").unwrap();
        assert_eq!(m.fps, Some(29.7));
        assert_eq!(m.bitrate_kbps, Some(4001.2));
        assert_eq!(m.dropped_frames, Some(2));
        assert_eq!(m.speed, Some(1.0));
    }

    #[test]
    fn finds_most_recent_error_marker() {
        let tail = "frame=1\nConnection refused\nframe=2";
        assert_eq!(find_error_marker(tail), Some("Connection refused".to_string()));
    }

    #[test]
    fn no_marker_found_returns_none() {
        assert_eq!(find_error_marker("frame=1\nframe=2"), None);
    }
}
