// StreamStats Model
// Encoder telemetry used by supervision and the health endpoint

use serde::Serialize;

/// Frame/transport state derived from encoder diagnostics.
/// Only supervision reads this; it is never authoritative elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Last frame number reported by the encoder
    pub frame_count: u64,

    /// Milliseconds since the frame counter last advanced
    pub millis_since_last_frame: Option<u64>,

    pub rtmp_connected: bool,
}

/// Result of comparing frame progress with the previous check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameProgress {
    pub healthy: bool,
    pub frames_since_last_check: u64,
    pub seconds_since_last_frame: f64,
}

/// Rate figures parsed from FFmpeg stats output
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Frames per second
    pub fps: f64,

    /// Current bitrate in kbps
    pub bitrate: f64,

    /// Encoding speed (1.0 = real-time)
    pub speed: f64,

    /// Number of dropped frames
    pub dropped_frames: u64,

    /// Number of duplicate frames
    pub dup_frames: u64,
}

impl StreamStats {
    /// Parse one FFmpeg stderr line for rate statistics.
    /// Handles both the stats line
    /// (`frame= 1234 fps= 30 q=28.0 size= 12345kB time=00:01:23.45 bitrate=1234.5kbits/s dup=0 drop=3 speed=1.0x`)
    /// and `-progress` key=value lines.
    pub fn parse_line(&mut self, line: &str) -> bool {
        let mut parsed = false;

        if let Some(fps) = Self::extract_value(line, "fps=") {
            if let Ok(f) = fps.parse::<f64>() {
                self.fps = f;
                parsed = true;
            }
        }

        if let Some(bitrate_str) = Self::extract_value(line, "bitrate=") {
            if let Some(b) = Self::parse_bitrate_kbps(&bitrate_str) {
                self.bitrate = b;
                parsed = true;
            }
        }

        if let Some(speed_str) = Self::extract_value(line, "speed=") {
            let speed = speed_str.replace('x', "");
            if let Ok(s) = speed.trim().parse::<f64>() {
                self.speed = s;
                parsed = true;
            }
        }

        for key in ["drop=", "drop_frames="] {
            if let Some(drop_str) = Self::extract_value(line, key) {
                if let Ok(d) = drop_str.parse::<u64>() {
                    self.dropped_frames = d;
                    parsed = true;
                }
            }
        }

        for key in ["dup=", "dup_frames="] {
            if let Some(dup_str) = Self::extract_value(line, key) {
                if let Ok(d) = dup_str.parse::<u64>() {
                    self.dup_frames = d;
                    parsed = true;
                }
            }
        }

        parsed
    }

    /// Extract value after a key from FFmpeg output
    fn extract_value(line: &str, key: &str) -> Option<String> {
        let start = Self::find_key(line, key)?;
        let value_start = start + key.len();
        let rest = line[value_start..].trim_start();

        let end = rest.find(|c: char| c.is_whitespace()).unwrap_or(rest.len());
        Some(rest[..end].trim().to_string())
    }

    /// Find `key` at a word boundary so "drop=" does not match inside "drop_frames="
    /// and "fps=" does not match inside other keys.
    fn find_key(line: &str, key: &str) -> Option<usize> {
        let mut search_from = 0;
        while let Some(pos) = line[search_from..].find(key) {
            let absolute = search_from + pos;
            let at_boundary = absolute == 0
                || line[..absolute]
                    .chars()
                    .next_back()
                    .map(|c| c.is_whitespace())
                    .unwrap_or(true);
            if at_boundary {
                return Some(absolute);
            }
            search_from = absolute + key.len();
        }
        None
    }

    /// Parse bitrate string to kbps.
    fn parse_bitrate_kbps(value: &str) -> Option<f64> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("N/A") {
            return None;
        }

        let lower = trimmed.to_ascii_lowercase();
        let (num_str, scale) = if let Some(v) = lower.strip_suffix("kbits/s") {
            (v, 1.0)
        } else if let Some(v) = lower.strip_suffix("mbits/s") {
            (v, 1000.0)
        } else if let Some(v) = lower.strip_suffix("bits/s") {
            (v, 1.0 / 1000.0)
        } else {
            (trimmed, 1.0)
        };

        num_str.trim().parse::<f64>().ok().map(|v| v * scale)
    }
}
