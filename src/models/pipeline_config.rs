// Pipeline Configuration Model
// Value objects describing what is captured and how it is encoded

use serde::{Deserialize, Serialize};

/// How pixels get from the browser into the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureModeKind {
    /// FFmpeg grabs the X display the browser window is shown on
    Display,
    /// The browser screencasts JPEG frames that are piped into FFmpeg
    Push,
}

impl CaptureModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureModeKind::Display => "display",
            CaptureModeKind::Push => "push",
        }
    }
}

/// Browser-side capture configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Page loaded when capture starts
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// JPEG quality for screencast frames (1-100)
    pub quality: u8,
    pub mode: CaptureModeKind,
    /// X display used in display mode (e.g. ":99")
    pub display: String,
}

/// Encoder-side configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Video bitrate with unit (e.g. "2500k")
    pub video_bitrate: String,
    /// Audio bitrate with unit (e.g. "128k")
    pub audio_bitrate: String,
    /// Requested encoder: "auto" or an FFmpeg encoder name
    pub video_encoder: String,
    pub mode: CaptureModeKind,
    pub display: String,
}

impl PipelineConfig {
    /// Get resolution as "WIDTHxHEIGHT" string for FFmpeg
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Keyframe interval in frames: two seconds of video
    pub fn gop_size(&self) -> u32 {
        self.fps.max(1).saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fps: u32) -> PipelineConfig {
        PipelineConfig {
            width: 1280,
            height: 720,
            fps,
            video_bitrate: "2500k".to_string(),
            audio_bitrate: "128k".to_string(),
            video_encoder: "auto".to_string(),
            mode: CaptureModeKind::Push,
            display: ":99".to_string(),
        }
    }

    #[test]
    fn test_gop_is_twice_fps() {
        assert_eq!(config(30).gop_size(), 60);
        assert_eq!(config(0).gop_size(), 2);
        assert_eq!(config(30).resolution(), "1280x720");
    }
}
