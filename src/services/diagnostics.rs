// Encoder Diagnostics
// Classifies FFmpeg stderr lines and turns the recent ones into a readable error

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;

/// Number of sanitized stderr lines kept for post-mortem details
pub const RECENT_LINE_CAPACITY: usize = 40;

/// What a single stderr line tells us about the encoder
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// An RTMP/network write failed; the message is the offending line
    TransportError(String),
    /// Output negotiation finished, packets are about to flow
    OutputReady,
    /// Frame counter advanced
    Progress { frame: u64, fps: Option<f64> },
}

const TRANSPORT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "connection timed out",
    "error writing",
    "i/o error",
    "failed to connect",
    "error number -10053",
    "error number -10054",
];

const OUTPUT_READY_MARKERS: &[&str] = &["Output #0", "Stream mapping:", "Press [q] to stop"];

fn frame_regex() -> &'static Regex {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    FRAME.get_or_init(|| {
        Regex::new(r"(?:^|\s)frame=\s*(\d+)").expect("static pattern")
    })
}

fn fps_regex() -> &'static Regex {
    static FPS: OnceLock<Regex> = OnceLock::new();
    FPS.get_or_init(|| {
        Regex::new(r"(?:^|\s)fps=\s*([0-9.]+)").expect("static pattern")
    })
}

/// Classify one stderr line. Lines that carry no signal return `None`.
pub fn classify_diagnostic_line(line: &str) -> Option<DiagnosticEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lower = trimmed.to_ascii_lowercase();
    if TRANSPORT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(DiagnosticEvent::TransportError(trimmed.to_string()));
    }

    if OUTPUT_READY_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
    {
        return Some(DiagnosticEvent::OutputReady);
    }

    let frame = frame_regex()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())?;
    let fps = fps_regex()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    Some(DiagnosticEvent::Progress { frame, fps })
}

/// Whether an FFmpeg line deserves to be written to the log
pub fn is_noteworthy(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error")
        || lower.contains("warning")
        || lower.contains("failed")
        || lower.contains("invalid")
        || lower.contains("unable")
}

/// Turn the tail of FFmpeg's stderr into a human-readable cause
pub fn parse_error_details(lines: &VecDeque<String>) -> Option<String> {
    for line in lines.iter().rev() {
        if line.contains("error code: -5") || line.contains("code -5") {
            return Some("I/O error (-5 - EIO): Network connection lost".to_string());
        }
        if line.contains("Connection refused") {
            return Some("RTMP server refused connection".to_string());
        }
        if line.contains("Connection timed out") {
            return Some("RTMP server connection timed out".to_string());
        }
        if line.contains("Connection reset by peer") {
            return Some("Connection reset by remote server".to_string());
        }
        if line.contains("Broken pipe") {
            return Some("Connection to RTMP server closed (broken pipe)".to_string());
        }
        if line.contains("error muxing packet") {
            return Some("Failed to send packet to server (possible network issue)".to_string());
        }
        if line.contains("Unknown encoder") || line.contains("Error initializing output stream") {
            return Some("Video encoder could not be initialized".to_string());
        }
        if line.contains("Cannot open display") {
            return Some("X display is not available for capture".to_string());
        }
    }

    lines
        .iter()
        .rev()
        .find(|line| line.to_ascii_lowercase().contains("error"))
        .cloned()
}

/// Bounded ring of the most recent sanitized lines
#[derive(Debug, Default)]
pub struct RecentLines {
    lines: VecDeque<String>,
}

impl RecentLines {
    pub fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(RECENT_LINE_CAPACITY),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == RECENT_LINE_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    /// Readable failure detail, falling back to the last line seen
    pub fn error_detail(&self) -> Option<String> {
        parse_error_details(&self.lines).or_else(|| self.lines.back().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors() {
        let cases = [
            "[rtmp @ 0x55] Connection refused",
            "[tcp @ 0x1] Connection to tcp://live.twitch.tv:1935 failed: Connection timed out",
            "av_interleaved_write_frame(): Broken pipe",
            "[flv @ 0x2] Error writing trailer: I/O error",
            "[tee @ 0x3] Slave muxer #1 failed: Connection reset by peer",
        ];
        for line in cases {
            assert!(
                matches!(classify_diagnostic_line(line), Some(DiagnosticEvent::TransportError(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn test_output_ready() {
        assert_eq!(
            classify_diagnostic_line("Output #0, flv, to 'rtmp://host/app/***':"),
            Some(DiagnosticEvent::OutputReady)
        );
        assert_eq!(
            classify_diagnostic_line("Stream mapping:"),
            Some(DiagnosticEvent::OutputReady)
        );
        assert_eq!(
            classify_diagnostic_line("Press [q] to stop, [?] for help"),
            Some(DiagnosticEvent::OutputReady)
        );
    }

    #[test]
    fn test_progress_from_stats_and_progress_lines() {
        assert_eq!(
            classify_diagnostic_line("frame= 1234 fps= 30 q=28.0 size= 100kB time=00:00:41.13 bitrate=1000.0kbits/s speed=1x"),
            Some(DiagnosticEvent::Progress { frame: 1234, fps: Some(30.0) })
        );
        assert_eq!(
            classify_diagnostic_line("frame=88"),
            Some(DiagnosticEvent::Progress { frame: 88, fps: None })
        );
    }

    #[test]
    fn test_noise_is_ignored() {
        assert_eq!(classify_diagnostic_line(""), None);
        assert_eq!(classify_diagnostic_line("  libavutil      58. 29.100 / 58. 29.100"), None);
        assert_eq!(classify_diagnostic_line("drop_frames=0"), None);
    }

    #[test]
    fn test_error_details_prefer_latest_known_cause() {
        let mut recent = RecentLines::new();
        recent.push("Input #0, image2pipe, from 'pipe:0':".to_string());
        recent.push("[rtmp @ 0x1] Connection refused".to_string());
        recent.push("Conversion failed!".to_string());
        assert_eq!(recent.error_detail().as_deref(), Some("RTMP server refused connection"));

        let mut unknown = RecentLines::new();
        unknown.push("something odd".to_string());
        assert_eq!(unknown.error_detail().as_deref(), Some("something odd"));
    }

    #[test]
    fn test_recent_lines_are_bounded() {
        let mut recent = RecentLines::new();
        for i in 0..100 {
            recent.push(format!("line {i}"));
        }
        assert_eq!(recent.lines().len(), RECENT_LINE_CAPACITY);
        assert_eq!(recent.lines().front().map(String::as_str), Some("line 60"));
    }
}
