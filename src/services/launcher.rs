// Process Launcher
// Builds the real FFmpeg, Chromium and director components for each pipeline generation

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::models::{CaptureConfig, CaptureModeKind, Scene, Settings};
use crate::services::capture::{CaptureMode, CaptureOptions, CaptureSource, DisplayCapture, FramePushCapture};
use crate::services::director::{Director, DirectorOptions};
use crate::services::encoder_probe::{select_encoder, ProbedEncoder};
use crate::services::ffmpeg_pipeline::{FfmpegPipeline, PipelineOptions};
use crate::services::{
    CaptureStage, DirectorStage, EncoderStage, FrameSink, PageHandle, PipelineError, PipelinePlan,
    StageEvents, StageLauncher, StreamerError,
};

/// Executable names tried for Chromium, in order
const CHROMIUM_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

const FFMPEG_STOP_GRACE: Duration = Duration::from_secs(5);
const CDP_CALL_TIMEOUT: Duration = Duration::from_secs(15);
const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Find an executable: an explicit path wins if it exists, otherwise search PATH
pub fn resolve_binary(explicit: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        log::warn!("Configured binary {} does not exist, searching PATH", path.display());
    }

    candidates.iter().find_map(|name| which::which(name).ok())
}

pub struct ProcessLauncher {
    settings: Settings,
    ffmpeg: Option<PathBuf>,
    chromium: Option<PathBuf>,
    /// Probed once, reused by every restart
    encoder: OnceCell<ProbedEncoder>,
}

impl ProcessLauncher {
    pub fn new(settings: Settings) -> Self {
        let ffmpeg = resolve_binary(settings.binaries.ffmpeg.as_deref(), &["ffmpeg"]);
        let chromium = resolve_binary(settings.binaries.chromium.as_deref(), CHROMIUM_CANDIDATES);

        match &ffmpeg {
            Some(path) => log::info!("Using FFmpeg at {}", path.display()),
            None => log::warn!("FFmpeg not found; set FFMPEG_PATH"),
        }
        match &chromium {
            Some(path) => log::info!("Using Chromium at {}", path.display()),
            None => log::warn!("Chromium not found; set CHROMIUM_PATH"),
        }

        Self {
            settings,
            ffmpeg,
            chromium,
            encoder: OnceCell::new(),
        }
    }

    async fn encoder(&self, ffmpeg: &Path) -> &ProbedEncoder {
        self.encoder
            .get_or_init(|| select_encoder(ffmpeg, &self.settings.video.encoder))
            .await
    }
}

#[async_trait]
impl StageLauncher for ProcessLauncher {
    async fn start_encoder(
        &self,
        plan: PipelinePlan,
        events: StageEvents,
    ) -> Result<Box<dyn EncoderStage>, StreamerError> {
        let ffmpeg = self.ffmpeg.as_deref().ok_or(PipelineError::FfmpegNotFound)?;
        let encoder = self.encoder(ffmpeg).await.clone();
        let options = PipelineOptions {
            stop_grace: FFMPEG_STOP_GRACE,
            stale_frame_threshold: self.settings.supervision.stale_frame_threshold,
        };

        let pipeline = FfmpegPipeline::start(ffmpeg, plan, &encoder, events, options).await?;
        Ok(Box::new(pipeline))
    }

    async fn start_capture(
        &self,
        config: CaptureConfig,
        frames: FrameSink,
        events: StageEvents,
    ) -> Result<Box<dyn CaptureStage>, StreamerError> {
        let chromium = self.chromium.clone().ok_or_else(|| {
            StreamerError::Config("Chromium not found (set CHROMIUM_PATH)".to_string())
        })?;

        let mode: Box<dyn CaptureMode> = match config.mode {
            CaptureModeKind::Display => Box::new(DisplayCapture::new(config.display.clone())),
            CaptureModeKind::Push => Box::new(FramePushCapture::new(frames)),
        };
        let options = CaptureOptions {
            chromium,
            launch_timeout: self.settings.supervision.startup_timeout,
            call_timeout: CDP_CALL_TIMEOUT,
            load_timeout: PAGE_LOAD_TIMEOUT,
            page_health_interval: self.settings.supervision.page_health_interval,
        };

        let mut source = CaptureSource::new(mode, options);
        source.start(&config, events).await?;
        Ok(Box::new(source))
    }

    async fn start_director(
        &self,
        page: PageHandle,
        initial: Scene,
        events: StageEvents,
    ) -> Result<Box<dyn DirectorStage>, StreamerError> {
        let director_settings = &self.settings.director;
        let brain_url = director_settings
            .brain_url
            .clone()
            .ok_or(StreamerError::NoDirector)?;

        let mut director = Director::new(page, self.settings.scenes.clone(), initial, events);
        director.start(DirectorOptions {
            brain_url,
            poll_interval: director_settings.poll_interval,
            request_timeout: director_settings.request_timeout,
        })?;
        Ok(Box::new(director))
    }
}
