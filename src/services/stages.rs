// Pipeline Stages
// Seams between the supervisor and the components it owns

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::models::{
    AudioSource, CaptureConfig, DestinationSet, FrameProgress, HealthSnapshot, PipelineConfig,
    Scene, StreamStats,
};
use crate::services::{CaptureError, PipelineError, StageEvents};

/// Supervisor-level error taxonomy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamerError {
    /// Unrecoverable setup problem; never retried
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Stream stalled: {0}")]
    Stall(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("No director is running")]
    NoDirector,

    #[error("Another scene switch is in progress")]
    SceneSwitchInProgress,
}

impl StreamerError {
    pub fn is_config(&self) -> bool {
        matches!(self, StreamerError::Config(_))
    }
}

impl From<CaptureError> for StreamerError {
    fn from(err: CaptureError) -> Self {
        StreamerError::Process(err.to_string())
    }
}

impl From<PipelineError> for StreamerError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NoDestinations | PipelineError::FfmpegNotFound => {
                StreamerError::Config(err.to_string())
            }
            other => StreamerError::Process(other.to_string()),
        }
    }
}

/// Everything the encoder needs to start
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub config: PipelineConfig,
    pub destinations: DestinationSet,
    pub audio: AudioSource,
}

/// Where captured JPEG frames go. Writing never blocks: a full queue drops the frame.
#[derive(Debug, Clone, Default)]
pub struct FrameSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink for encoders that read pixels themselves (display capture)
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue one frame; false when it was dropped
    pub fn write_frame(&self, frame: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }
}

/// In-place control of the live page
#[async_trait]
pub trait PageNavigator: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), CaptureError>;

    /// Hide scrollbars and page chrome after a load
    async fn normalize(&self) -> Result<(), CaptureError>;
}

/// Non-owning page reference shared with the director
pub type PageHandle = Arc<dyn PageNavigator>;

/// A running encoder process
#[async_trait]
pub trait EncoderStage: Send + Sync {
    fn is_active(&self) -> bool;

    fn is_rtmp_connected(&self) -> bool;

    fn snapshot(&self) -> HealthSnapshot;

    /// Compare against the previous call; a check with no new frames is unhealthy
    fn check_frame_progress(&mut self) -> FrameProgress;

    fn stats(&self) -> StreamStats;

    fn frame_sink(&self) -> FrameSink;

    async fn stop(&mut self);
}

/// A running browser capture
#[async_trait]
pub trait CaptureStage: Send + Sync {
    fn is_running(&self) -> bool;

    fn page_handle(&self) -> Option<PageHandle>;

    async fn stop(&mut self);
}

/// A running scene director
#[async_trait]
pub trait DirectorStage: Send + Sync {
    fn scene(&self) -> Scene;

    async fn force_scene(&self, scene: Scene) -> Result<(), StreamerError>;

    async fn stop(&mut self);
}

/// Builds fresh components for every pipeline generation
#[async_trait]
pub trait StageLauncher: Send + Sync {
    async fn start_encoder(
        &self,
        plan: PipelinePlan,
        events: StageEvents,
    ) -> Result<Box<dyn EncoderStage>, StreamerError>;

    async fn start_capture(
        &self,
        config: CaptureConfig,
        frames: FrameSink,
        events: StageEvents,
    ) -> Result<Box<dyn CaptureStage>, StreamerError>;

    async fn start_director(
        &self,
        page: PageHandle,
        initial: Scene,
        events: StageEvents,
    ) -> Result<Box<dyn DirectorStage>, StreamerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sink_drops_when_full() {
        let (sink, mut rx) = FrameSink::channel(1);
        assert!(sink.write_frame(Bytes::from_static(b"a")));
        assert!(!sink.write_frame(Bytes::from_static(b"b")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_detached_sink_rejects_frames() {
        let sink = FrameSink::detached();
        assert!(!sink.write_frame(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_no_destinations_is_config_error() {
        let err: StreamerError = PipelineError::NoDestinations.into();
        assert!(err.is_config());
    }
}
