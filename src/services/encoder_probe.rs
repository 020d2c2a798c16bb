// Encoder Probe Service
// OBS-style hardware encoder detection: a candidate counts as available only if
// FFmpeg can actually initialise it and encode a frame, not merely because it
// was compiled in.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Hardware H.264 encoders in preference order
pub const HARDWARE_CANDIDATES: &[&str] = &["h264_nvenc", "h264_qsv", "h264_vaapi"];

/// Software fallback, always assumed present
pub const SOFTWARE_ENCODER: &str = "libx264";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default VA-API render node
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Output markers of an encoder that is compiled in but cannot run here
const PROBE_FAILURE_MARKERS: &[&str] = &[
    "Cannot load",
    "No capable devices found",
    "Driver does not support",
    "not found",
    "Codec not currently supported",
    "Failed to initialise VAAPI",
    "Error initializing output stream",
    "Unknown encoder",
];

pub fn is_hardware_encoder(encoder: &str) -> bool {
    HARDWARE_CANDIDATES.contains(&encoder)
}

/// Probe result: the encoder name plus whether it runs on dedicated hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedEncoder {
    pub name: String,
    pub hardware: bool,
}

impl ProbedEncoder {
    pub fn software() -> Self {
        Self {
            name: SOFTWARE_ENCODER.to_string(),
            hardware: false,
        }
    }
}

/// True when probe output shows the encoder failed to initialise
pub fn probe_output_failed(output: &str) -> bool {
    PROBE_FAILURE_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Arguments for a one-frame test encode with `encoder`
pub fn probe_args(encoder: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    if encoder == "h264_vaapi" {
        args.extend(["-vaapi_device".into(), VAAPI_DEVICE.into()]);
    }

    args.extend([
        "-f".into(), "lavfi".into(),
        "-i".into(), "color=black:s=256x256:d=0.1".into(),
        "-frames:v".into(), "1".into(),
    ]);

    if encoder == "h264_vaapi" {
        args.extend(["-vf".into(), "format=nv12,hwupload".into()]);
    }

    args.extend(["-c:v".into(), encoder.into(), "-f".into(), "null".into(), "-".into()]);
    args
}

/// Choose the encoder for `requested` ("auto" or a specific FFmpeg encoder name).
/// A specific request is honoured as-is; "auto" probes the hardware candidates in order.
pub async fn select_encoder(ffmpeg_path: &Path, requested: &str) -> ProbedEncoder {
    let requested = requested.trim();
    if !requested.is_empty() && !requested.eq_ignore_ascii_case("auto") {
        return ProbedEncoder {
            name: requested.to_string(),
            hardware: is_hardware_encoder(requested),
        };
    }

    log::info!("Probing hardware encoders...");
    for candidate in HARDWARE_CANDIDATES {
        if probe_encoder(ffmpeg_path, candidate).await {
            log::info!("Hardware encoder available: {candidate}");
            return ProbedEncoder {
                name: candidate.to_string(),
                hardware: true,
            };
        }
        log::debug!("  {candidate}: not usable");
    }

    log::info!("No hardware encoder available, using {SOFTWARE_ENCODER}");
    ProbedEncoder::software()
}

/// Try to encode one frame with `encoder`
async fn probe_encoder(ffmpeg_path: &Path, encoder: &str) -> bool {
    let mut command = Command::new(PathBuf::from(ffmpeg_path));
    command
        .args(probe_args(encoder))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            log::debug!("  {encoder}: failed to run FFmpeg test encode: {e}");
            return false;
        }
        Err(_) => {
            log::debug!("  {encoder}: test encode timed out");
            return false;
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() || probe_output_failed(&stderr) {
        log::trace!("  {encoder} probe output: {}", stderr.trim());
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_args_encode_one_frame() {
        let args = probe_args("h264_nvenc");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "h264_nvenc"));
        assert!(args.windows(2).any(|w| w[0] == "-frames:v" && w[1] == "1"));
        assert!(!args.contains(&"-vaapi_device".to_string()));

        let vaapi = probe_args("h264_vaapi");
        assert!(vaapi.contains(&"-vaapi_device".to_string()));
        assert!(vaapi.contains(&"format=nv12,hwupload".to_string()));
    }

    #[test]
    fn test_failure_markers() {
        assert!(probe_output_failed("[h264_nvenc @ 0x1] Cannot load libnvidia-encode.so.1"));
        assert!(probe_output_failed("[h264_qsv @ 0x2] Error initializing output stream 0:0"));
        assert!(!probe_output_failed(""));
    }

    #[tokio::test]
    async fn test_explicit_encoder_skips_probe() {
        let chosen = select_encoder(Path::new("/nonexistent/ffmpeg"), "h264_qsv").await;
        assert_eq!(chosen.name, "h264_qsv");
        assert!(chosen.hardware);

        let chosen = select_encoder(Path::new("/nonexistent/ffmpeg"), "libx264").await;
        assert!(!chosen.hardware);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_software() {
        let chosen = select_encoder(Path::new("/nonexistent/ffmpeg"), "auto").await;
        assert_eq!(chosen, ProbedEncoder::software());
    }
}
