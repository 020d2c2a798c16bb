// Settings Model
// Process-wide configuration read from the environment

use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;

use crate::models::{CaptureConfig, CaptureModeKind, PipelineConfig, Scene};

/// Shortest accepted timer period
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_primary_url() -> String {
    "http://127.0.0.1:8080/".to_string()
}

fn default_display() -> String {
    ":99".to_string()
}

/// Parse the usual truthy/falsy spellings
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Requested capture mode before host detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureModeSetting {
    Auto,
    Fixed(CaptureModeKind),
}

/// Target pages for each scene
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneUrls {
    pub primary: String,
    pub secondary: String,
}

impl SceneUrls {
    pub fn url_for(&self, scene: Scene) -> &str {
        match scene {
            Scene::Primary => &self.primary,
            Scene::Secondary => &self.secondary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectorSettings {
    pub enabled: bool,
    /// Control plane base URL; `/status` is appended
    pub brain_url: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    /// Screencast JPEG quality
    pub quality: u8,
    pub encoder: String,
    pub capture_mode: CaptureModeSetting,
    /// X display, when one is available to this process
    pub display: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub disabled: bool,
    /// Page handed to the live provider (e.g. a 24/7 radio stream)
    pub source_url: Option<String>,
    pub fallback_file: Option<PathBuf>,
    /// Lifetime assumed for a resolved live URL; kept below the provider's real expiry
    pub ttl: Duration,
    pub refresh_margin: Duration,
    pub resolve_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BinarySettings {
    pub ffmpeg: Option<PathBuf>,
    pub chromium: Option<PathBuf>,
    pub ytdlp: Option<PathBuf>,
}

/// Restart and timer tuning
#[derive(Debug, Clone)]
pub struct SupervisionSettings {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub restart_cooldown: Duration,
    pub stability_window: Duration,
    pub health_check_interval: Duration,
    /// Longest acceptable gap since the last frame at a health check
    pub stale_frame_threshold: Duration,
    pub watchdog_interval: Duration,
    pub watchdog_timeout: Duration,
    pub audio_refresh_interval: Duration,
    pub page_health_interval: Duration,
    pub startup_timeout: Duration,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_delay: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(60),
            stability_window: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(3 * 60),
            stale_frame_threshold: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(60),
            audio_refresh_interval: Duration::from_secs(10 * 60),
            page_health_interval: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
    pub log_level: LevelFilter,
    /// Begin broadcasting as soon as the server is up
    pub auto_start: bool,
    pub scenes: SceneUrls,
    pub initial_scene: Scene,
    pub director: DirectorSettings,
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub binaries: BinarySettings,
    pub supervision: SupervisionSettings,
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let get_bool = |key: &str, default: bool| {
            get(key).and_then(|v| parse_bool(&v)).unwrap_or(default)
        };
        let get_num = |key: &str, default: u64| {
            get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
        };
        let get_dimension = |key: &str, default: u32| {
            get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let get_millis = |key: &str, default: Duration| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        // Timer periods; tokio intervals reject a zero period
        let get_period = |key: &str, default: Duration| {
            get_millis(key, default).max(MIN_TIMER_PERIOD)
        };
        let get_secs = |key: &str, default: Duration| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let primary = get("PRIMARY_URL").unwrap_or_else(default_primary_url);
        let secondary = get("SECONDARY_URL").unwrap_or_else(|| primary.clone());

        let brain_url = get("BRAIN_URL").map(|url| url.trim_end_matches('/').to_string());
        let director_enabled = get_bool("DIRECTOR_ENABLED", brain_url.is_some()) && brain_url.is_some();

        let capture_mode = match get("CAPTURE_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("display") | Some("x11grab") => CaptureModeSetting::Fixed(CaptureModeKind::Display),
            Some("push") | Some("screencast") => CaptureModeSetting::Fixed(CaptureModeKind::Push),
            _ => CaptureModeSetting::Auto,
        };

        let log_level = get("LOG_LEVEL")
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Info);

        let defaults = SupervisionSettings::default();

        Self {
            host: get("HOST").unwrap_or_else(default_host),
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or_else(default_port),
            log_dir: get("LOG_DIR").map(PathBuf::from),
            log_level,
            auto_start: get_bool("AUTO_START", true),
            scenes: SceneUrls { primary, secondary },
            initial_scene: get("INITIAL_SCENE")
                .and_then(|v| Scene::parse(&v))
                .unwrap_or_default(),
            director: DirectorSettings {
                enabled: director_enabled,
                brain_url,
                poll_interval: get_period("DIRECTOR_POLL_MS", Duration::from_secs(5)),
                request_timeout: Duration::from_secs(5),
            },
            video: VideoSettings {
                width: get_dimension("STREAM_WIDTH", 1280),
                height: get_dimension("STREAM_HEIGHT", 720),
                fps: get_num("STREAM_FPS", 30).clamp(1, 60) as u32,
                video_bitrate: get("VIDEO_BITRATE").unwrap_or_else(|| "2500k".to_string()),
                audio_bitrate: get("AUDIO_BITRATE").unwrap_or_else(|| "128k".to_string()),
                quality: get_num("CAPTURE_QUALITY", 80).clamp(1, 100) as u8,
                encoder: get("VIDEO_ENCODER").unwrap_or_else(|| "auto".to_string()),
                capture_mode,
                display: get("DISPLAY"),
            },
            audio: AudioSettings {
                disabled: get_bool("AUDIO_DISABLED", false),
                source_url: get("AUDIO_SOURCE_URL"),
                fallback_file: get("AUDIO_FALLBACK_FILE").map(PathBuf::from),
                ttl: get_secs("AUDIO_TTL_SECS", Duration::from_secs(4 * 60 * 60)),
                refresh_margin: get_secs("AUDIO_REFRESH_MARGIN_SECS", Duration::from_secs(10 * 60)),
                resolve_timeout: get_secs("AUDIO_RESOLVE_TIMEOUT_SECS", Duration::from_secs(30)),
            },
            binaries: BinarySettings {
                ffmpeg: get("FFMPEG_PATH").map(PathBuf::from),
                chromium: get("CHROMIUM_PATH").map(PathBuf::from),
                ytdlp: get("YTDLP_PATH").map(PathBuf::from),
            },
            supervision: SupervisionSettings {
                max_restarts: get_num("MAX_RESTARTS", defaults.max_restarts as u64).max(1) as u32,
                restart_delay: get_millis("RESTART_DELAY_MS", defaults.restart_delay),
                restart_cooldown: get_millis("RESTART_COOLDOWN_MS", defaults.restart_cooldown),
                stability_window: get_millis("STABILITY_WINDOW_MS", defaults.stability_window),
                health_check_interval: get_period("HEALTH_CHECK_INTERVAL_MS", defaults.health_check_interval),
                stale_frame_threshold: get_millis("STALE_FRAME_MS", defaults.stale_frame_threshold),
                watchdog_interval: get_period("WATCHDOG_INTERVAL_MS", defaults.watchdog_interval),
                watchdog_timeout: get_millis("WATCHDOG_TIMEOUT_MS", defaults.watchdog_timeout),
                audio_refresh_interval: get_period("AUDIO_REFRESH_INTERVAL_MS", defaults.audio_refresh_interval),
                page_health_interval: get_period("PAGE_HEALTH_INTERVAL_MS", defaults.page_health_interval),
                startup_timeout: get_millis("STARTUP_TIMEOUT_MS", defaults.startup_timeout),
            },
        }
    }

    /// Capture mode after host detection: display capture needs an X display
    pub fn capture_mode(&self) -> CaptureModeKind {
        match self.video.capture_mode {
            CaptureModeSetting::Fixed(mode) => mode,
            CaptureModeSetting::Auto if self.video.display.is_some() => CaptureModeKind::Display,
            CaptureModeSetting::Auto => CaptureModeKind::Push,
        }
    }

    pub fn capture_config(&self, scene: Scene) -> CaptureConfig {
        CaptureConfig {
            url: self.scenes.url_for(scene).to_string(),
            width: self.video.width,
            height: self.video.height,
            fps: self.video.fps,
            quality: self.video.quality,
            mode: self.capture_mode(),
            display: self.video.display.clone().unwrap_or_else(default_display),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            width: self.video.width,
            height: self.video.height,
            fps: self.video.fps,
            video_bitrate: self.video.video_bitrate.clone(),
            audio_bitrate: self.video.audio_bitrate.clone(),
            video_encoder: self.video.encoder.clone(),
            mode: self.capture_mode(),
            display: self.video.display.clone().unwrap_or_else(default_display),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(&|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(&move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.video.fps, 30);
        assert!(!settings.director.enabled);
        assert_eq!(settings.scenes.secondary, settings.scenes.primary);
        assert_eq!(settings.capture_mode(), CaptureModeKind::Push);
        assert_eq!(settings.supervision.max_restarts, 10);
    }

    #[test]
    fn test_director_requires_brain_url() {
        let settings = settings_from(&[("DIRECTOR_ENABLED", "true")]);
        assert!(!settings.director.enabled);

        let settings = settings_from(&[("BRAIN_URL", "http://brain:4000/")]);
        assert!(settings.director.enabled);
        assert_eq!(settings.director.brain_url.as_deref(), Some("http://brain:4000"));

        let settings = settings_from(&[("BRAIN_URL", "http://brain:4000"), ("DIRECTOR_ENABLED", "off")]);
        assert!(!settings.director.enabled);
    }

    #[test]
    fn test_capture_mode_detection() {
        let settings = settings_from(&[("DISPLAY", ":0")]);
        assert_eq!(settings.capture_mode(), CaptureModeKind::Display);
        assert_eq!(settings.capture_config(Scene::Primary).display, ":0");

        let settings = settings_from(&[("DISPLAY", ":0"), ("CAPTURE_MODE", "push")]);
        assert_eq!(settings.capture_mode(), CaptureModeKind::Push);
    }

    #[test]
    fn test_tuning_overrides() {
        let settings = settings_from(&[
            ("MAX_RESTARTS", "3"),
            ("RESTART_DELAY_MS", "250"),
            ("WATCHDOG_TIMEOUT_MS", "90000"),
            ("STREAM_FPS", "240"),
        ]);
        assert_eq!(settings.supervision.max_restarts, 3);
        assert_eq!(settings.supervision.restart_delay, Duration::from_millis(250));
        assert_eq!(settings.supervision.watchdog_timeout, Duration::from_secs(90));
        assert_eq!(settings.video.fps, 60);
    }

    #[test]
    fn test_zero_timer_periods_are_floored() {
        let settings = settings_from(&[
            ("WATCHDOG_INTERVAL_MS", "0"),
            ("HEALTH_CHECK_INTERVAL_MS", "0"),
            ("AUDIO_REFRESH_INTERVAL_MS", "0"),
            ("PAGE_HEALTH_INTERVAL_MS", "0"),
            ("DIRECTOR_POLL_MS", "0"),
        ]);
        let supervision = &settings.supervision;
        assert_eq!(supervision.watchdog_interval, MIN_TIMER_PERIOD);
        assert_eq!(supervision.health_check_interval, MIN_TIMER_PERIOD);
        assert_eq!(supervision.audio_refresh_interval, MIN_TIMER_PERIOD);
        assert_eq!(supervision.page_health_interval, MIN_TIMER_PERIOD);
        assert_eq!(settings.director.poll_interval, MIN_TIMER_PERIOD);
    }

    #[test]
    fn test_oversized_dimensions_fall_back() {
        let settings = settings_from(&[("STREAM_WIDTH", "99999999999"), ("STREAM_HEIGHT", "0")]);
        assert_eq!(settings.video.width, 1280);
        assert_eq!(settings.video.height, 720);

        let settings = settings_from(&[("STREAM_WIDTH", "1920"), ("STREAM_HEIGHT", "1080")]);
        assert_eq!(settings.video.width, 1920);
        assert_eq!(settings.video.height, 1080);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("disabled"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
