// AudioSource Model
// The audio track muxed under the captured page

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Resolved audio input for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Expiring network stream URL
    Live {
        url: String,
        resolved_at: Instant,
        ttl: Duration,
    },
    /// Local file played in a loop
    LocalLoop(PathBuf),
    /// Synthesized silent track (some ingests reject video-only streams)
    Silent,
}

/// Serializable kind of an `AudioSource`, without URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioKind {
    Live,
    LocalLoop,
    Silent,
}

impl AudioSource {
    pub fn kind(&self) -> AudioKind {
        match self {
            AudioSource::Live { .. } => AudioKind::Live,
            AudioSource::LocalLoop(_) => AudioKind::LocalLoop,
            AudioSource::Silent => AudioKind::Silent,
        }
    }

    /// Point after which a live source must have been replaced
    pub fn expires_at(&self) -> Option<Instant> {
        match self {
            AudioSource::Live { resolved_at, ttl, .. } => Some(*resolved_at + *ttl),
            _ => None,
        }
    }

    /// True once `now` is inside the refresh margin before expiry.
    /// Only live sources ever need refreshing.
    pub fn needs_refresh(&self, now: Instant, margin: Duration) -> bool {
        match self.expires_at() {
            Some(expires_at) => now + margin > expires_at,
            None => false,
        }
    }

    /// FFmpeg input arguments for this source
    pub fn input_args(&self) -> Vec<String> {
        match self {
            AudioSource::Live { url, .. } => vec![
                "-thread_queue_size".to_string(), "1024".to_string(),
                "-reconnect".to_string(), "1".to_string(),
                "-reconnect_streamed".to_string(), "1".to_string(),
                "-reconnect_at_eof".to_string(), "1".to_string(),
                "-reconnect_delay_max".to_string(), "5".to_string(),
                "-i".to_string(), url.clone(),
            ],
            AudioSource::LocalLoop(path) => vec![
                "-thread_queue_size".to_string(), "1024".to_string(),
                "-stream_loop".to_string(), "-1".to_string(),
                "-re".to_string(),
                "-i".to_string(), path.to_string_lossy().to_string(),
            ],
            AudioSource::Silent => vec![
                "-f".to_string(), "lavfi".to_string(),
                "-i".to_string(), "anullsrc=channel_layout=stereo:sample_rate=44100".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_refresh_only_inside_margin() {
        let resolved_at = Instant::now();
        let source = AudioSource::Live {
            url: "https://example.com/audio".to_string(),
            resolved_at,
            ttl: Duration::from_secs(3600),
        };
        let margin = Duration::from_secs(600);

        assert!(!source.needs_refresh(resolved_at, margin));
        assert!(!source.needs_refresh(resolved_at + Duration::from_secs(2999), margin));
        assert!(source.needs_refresh(resolved_at + Duration::from_secs(3001), margin));
    }

    #[test]
    fn test_non_live_sources_never_expire() {
        let now = Instant::now();
        assert!(!AudioSource::Silent.needs_refresh(now, Duration::from_secs(600)));
        assert!(!AudioSource::LocalLoop(PathBuf::from("/tmp/loop.mp3"))
            .needs_refresh(now + Duration::from_secs(86_400), Duration::from_secs(600)));
    }

    #[test]
    fn test_silent_still_produces_an_input() {
        let args = AudioSource::Silent.input_args();
        assert!(args.iter().any(|a| a.starts_with("anullsrc")));
        assert_eq!(AudioSource::Silent.kind(), AudioKind::Silent);
    }

    #[test]
    fn test_live_input_reconnects() {
        let source = AudioSource::Live {
            url: "https://example.com/a".to_string(),
            resolved_at: Instant::now(),
            ttl: Duration::from_secs(60),
        };
        let args = source.input_args();
        assert!(args.windows(2).any(|w| w[0] == "-reconnect" && w[1] == "1"));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/a"));
    }
}
