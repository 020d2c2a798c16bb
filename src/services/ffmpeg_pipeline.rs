// FFmpeg Pipeline Service
// One long-lived FFmpeg process: captured video + audio in, RTMP fan-out out

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{
    CaptureModeKind, DestinationSet, FrameProgress, HealthSnapshot, StreamStats,
};
use crate::services::diagnostics::{classify_diagnostic_line, is_noteworthy, DiagnosticEvent, RecentLines};
use crate::services::encoder_probe::{ProbedEncoder, SOFTWARE_ENCODER};
use crate::services::{EncoderStage, FrameSink, PipelinePlan, StageEventKind, StageEvents};

/// Frames buffered between capture and FFmpeg's stdin
const FRAME_QUEUE_CAPACITY: usize = 8;

/// How long the exit path waits for the stderr reader to drain
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No enabled RTMP destinations configured")]
    NoDestinations,

    #[error("FFmpeg not found")]
    FfmpegNotFound,

    #[error("Failed to start FFmpeg: {0}")]
    Spawn(String),
}

/// Runtime tuning for a pipeline process
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Wait for a graceful quit before killing
    pub stop_grace: Duration,
    /// A health check fails when the last frame is older than this
    pub stale_frame_threshold: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            stale_frame_threshold: Duration::from_secs(30),
        }
    }
}

fn double_bitrate_value(bitrate: &str) -> Option<String> {
    let trimmed = bitrate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (value_str, suffix) = trimmed.split_at(split_at);
    if value_str.is_empty() {
        return None;
    }

    let value: f64 = value_str.parse().ok()?;
    Some(format!("{}{suffix}", value * 2.0))
}

/// Constant-bitrate rate control; RTMP ingests reject bursty streams
fn append_cbr_args(args: &mut Vec<String>, encoder: &str, bitrate: &str) {
    let bufsize = double_bitrate_value(bitrate).unwrap_or_else(|| bitrate.to_string());

    args.push("-b:v".to_string()); args.push(bitrate.to_string());
    args.push("-minrate".to_string()); args.push(bitrate.to_string());
    args.push("-maxrate".to_string()); args.push(bitrate.to_string());
    args.push("-bufsize".to_string()); args.push(bufsize);

    if encoder.contains("nvenc") || encoder.contains("qsv") {
        args.push("-rc".to_string()); args.push("cbr".to_string());
    } else if encoder.contains("vaapi") {
        args.push("-rc_mode".to_string()); args.push("CBR".to_string());
    }

    if encoder == SOFTWARE_ENCODER {
        args.push("-x264-params".to_string());
        args.push("nal-hrd=cbr:force-cfr=1".to_string());
    }
}

fn append_encoder_preset(args: &mut Vec<String>, encoder: &str) {
    match encoder {
        SOFTWARE_ENCODER => {
            args.extend(["-preset".into(), "veryfast".into(), "-tune".into(), "zerolatency".into()]);
        }
        "h264_nvenc" => {
            args.extend(["-preset".into(), "p4".into(), "-tune".into(), "ll".into()]);
        }
        "h264_qsv" => {
            args.extend(["-preset".into(), "veryfast".into()]);
        }
        _ => {}
    }
}

/// Build the full FFmpeg argument list for one pipeline run
pub fn build_args(plan: &PipelinePlan, encoder: &ProbedEncoder) -> Result<Vec<String>, PipelineError> {
    if plan.destinations.is_empty() {
        return Err(PipelineError::NoDestinations);
    }

    let config = &plan.config;
    let fps = config.fps.max(1).to_string();
    let gop = config.gop_size().to_string();
    let is_vaapi = encoder.name == "h264_vaapi";
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "info".into()];

    if is_vaapi {
        args.extend(["-vaapi_device".into(), VAAPI_DEVICE.into()]);
    }

    // Input 0: video
    match config.mode {
        CaptureModeKind::Display => {
            args.extend([
                "-f".into(), "x11grab".into(),
                "-draw_mouse".into(), "0".into(),
                "-video_size".into(), config.resolution(),
                "-framerate".into(), fps.clone(),
                "-thread_queue_size".into(), "512".into(),
                "-i".into(), format!("{}+0,0", config.display),
            ]);
        }
        CaptureModeKind::Push => {
            args.extend([
                "-f".into(), "image2pipe".into(),
                "-framerate".into(), fps.clone(),
                "-c:v".into(), "mjpeg".into(),
                "-thread_queue_size".into(), "512".into(),
                "-i".into(), "pipe:0".into(),
            ]);
        }
    }

    // Input 1: audio
    args.extend(plan.audio.input_args());

    args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "1:a:0".into()]);

    // Video encoding
    args.extend(["-c:v".into(), encoder.name.clone()]);
    append_encoder_preset(&mut args, &encoder.name);
    append_cbr_args(&mut args, &encoder.name, &config.video_bitrate);

    if is_vaapi {
        args.extend([
            "-vf".into(),
            format!("scale={}:{},format=nv12,hwupload", config.width, config.height),
        ]);
    } else {
        args.extend([
            "-vf".into(), format!("scale={}:{}", config.width, config.height),
            "-pix_fmt".into(), "yuv420p".into(),
        ]);
    }

    args.extend([
        "-r".into(), fps,
        "-g".into(), gop.clone(),
        "-keyint_min".into(), gop,
        "-sc_threshold".into(), "0".into(),
    ]);

    // Audio encoding
    args.extend([
        "-c:a".into(), "aac".into(),
        "-b:a".into(), config.audio_bitrate.clone(),
        "-ar".into(), "44100".into(),
        "-ac".into(), "2".into(),
    ]);

    args.extend(["-progress".into(), "pipe:2".into(), "-stats".into()]);

    // Output: direct for one destination, tee for several
    if let Some(destination) = plan.destinations.single() {
        args.extend([
            "-f".into(), "flv".into(),
            "-flvflags".into(), "no_duration_filesize".into(),
            destination.target_url(),
        ]);
    } else {
        args.extend([
            "-flags".into(), "+global_header".into(),
            "-f".into(), "tee".into(),
            plan.destinations.muxer_descriptor(),
        ]);
    }

    Ok(args)
}

/// Mask every stream key in an argument list
pub fn sanitize_args(args: &[String], destinations: &DestinationSet) -> Vec<String> {
    args.iter().map(|arg| destinations.redact(arg)).collect()
}

/// Shared telemetry written by the stderr reader
struct PipelineShared {
    frame_count: AtomicU64,
    last_frame_at: Mutex<Instant>,
    rtmp_connected: AtomicBool,
    active: AtomicBool,
    stopping: AtomicBool,
    stats: Mutex<StreamStats>,
    recent_lines: Mutex<RecentLines>,
}

impl PipelineShared {
    fn new() -> Self {
        Self {
            frame_count: AtomicU64::new(0),
            last_frame_at: Mutex::new(Instant::now()),
            rtmp_connected: AtomicBool::new(false),
            active: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            stats: Mutex::new(StreamStats::default()),
            recent_lines: Mutex::new(RecentLines::new()),
        }
    }

    fn millis_since_last_frame(&self) -> u64 {
        self.last_frame_at
            .lock()
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Apply one stderr line; returns a transport error message when one was seen
    fn observe_line(&self, line: &str) -> Option<String> {
        if let Ok(mut stats) = self.stats.lock() {
            stats.parse_line(line);
        }

        match classify_diagnostic_line(line)? {
            DiagnosticEvent::TransportError(message) => {
                self.rtmp_connected.store(false, Ordering::Relaxed);
                Some(message)
            }
            DiagnosticEvent::OutputReady => {
                self.rtmp_connected.store(true, Ordering::Relaxed);
                None
            }
            DiagnosticEvent::Progress { frame, .. } => {
                let previous = self.frame_count.load(Ordering::Relaxed);
                if frame > previous {
                    self.frame_count.store(frame, Ordering::Relaxed);
                    if let Ok(mut at) = self.last_frame_at.lock() {
                        *at = Instant::now();
                    }
                }
                None
            }
        }
    }
}

/// A running FFmpeg process plus the tasks that feed and watch it
pub struct FfmpegPipeline {
    shared: Arc<PipelineShared>,
    frame_sink: FrameSink,
    options: PipelineOptions,
    last_checked_frame: u64,
    quit_tx: Option<oneshot::Sender<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl FfmpegPipeline {
    /// Spawn FFmpeg for `plan`. Fails fast when there is nowhere to send the stream.
    pub async fn start(
        ffmpeg_path: &Path,
        plan: PipelinePlan,
        encoder: &ProbedEncoder,
        events: StageEvents,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let args = build_args(&plan, encoder)?;
        let destinations = plan.destinations.clone();

        log::info!(
            "Starting FFmpeg ({} -> {} destination(s), encoder {}, audio {:?})",
            plan.config.mode.as_str(),
            destinations.len(),
            encoder.name,
            plan.audio.kind()
        );
        log::info!("Publishing to {}", destinations.redacted_descriptor());
        log::debug!("FFmpeg args: {:?}", sanitize_args(&args, &destinations));

        let mut child = Command::new(PathBuf::from(ffmpeg_path))
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        let shared = Arc::new(PipelineShared::new());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Spawn("stdin not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Spawn("stderr not captured".to_string()))?;

        let (frame_sink, frames) = match plan.config.mode {
            CaptureModeKind::Push => {
                let (sink, rx) = FrameSink::channel(FRAME_QUEUE_CAPACITY);
                (sink, Some(rx))
            }
            CaptureModeKind::Display => (FrameSink::detached(), None),
        };
        let quit_with_q = plan.config.mode == CaptureModeKind::Display;

        let (quit_tx, quit_rx) = oneshot::channel();
        tokio::spawn(stdin_writer(stdin, frames, quit_rx, quit_with_q));

        let stderr_task = tokio::spawn(stderr_reader(
            stderr,
            shared.clone(),
            destinations,
            events.clone(),
        ));

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_process(
            child,
            shared.clone(),
            stderr_task,
            stop_rx,
            events,
            options.stop_grace,
        ));

        Ok(Self {
            shared,
            frame_sink,
            options,
            last_checked_frame: 0,
            quit_tx: Some(quit_tx),
            stop_tx: Some(stop_tx),
            monitor: Some(monitor),
        })
    }
}

#[async_trait]
impl EncoderStage for FfmpegPipeline {
    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    fn is_rtmp_connected(&self) -> bool {
        self.shared.rtmp_connected.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            frame_count: self.shared.frame_count.load(Ordering::Relaxed),
            millis_since_last_frame: Some(self.shared.millis_since_last_frame()),
            rtmp_connected: self.is_rtmp_connected(),
        }
    }

    fn check_frame_progress(&mut self) -> FrameProgress {
        let current = self.shared.frame_count.load(Ordering::Relaxed);
        let frames_since_last_check = current.saturating_sub(self.last_checked_frame);
        self.last_checked_frame = current;

        let seconds_since_last_frame = self.shared.millis_since_last_frame() as f64 / 1000.0;
        let healthy = frames_since_last_check > 0
            && seconds_since_last_frame < self.options.stale_frame_threshold.as_secs_f64();

        FrameProgress {
            healthy,
            frames_since_last_check,
            seconds_since_last_frame,
        }
    }

    fn stats(&self) -> StreamStats {
        self.shared
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn frame_sink(&self) -> FrameSink {
        self.frame_sink.clone()
    }

    async fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Relaxed);

        if let Some(quit) = self.quit_tx.take() {
            let _ = quit.send(());
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }

        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.rtmp_connected.store(false, Ordering::Relaxed);
        log::info!("FFmpeg stopped");
    }
}

/// Feed frames to FFmpeg until told to quit, then ask it to finish
async fn stdin_writer(
    mut stdin: ChildStdin,
    mut frames: Option<mpsc::Receiver<Bytes>>,
    mut quit: oneshot::Receiver<()>,
    quit_with_q: bool,
) {
    loop {
        let next_frame = async {
            match frames.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut quit => break,
            frame = next_frame => match frame {
                Some(frame) => {
                    if let Err(e) = stdin.write_all(&frame).await {
                        log::debug!("FFmpeg stdin closed: {e}");
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Display mode: 'q' asks FFmpeg to finish; push mode: EOF on the pipe does
    if quit_with_q {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }
    drop(stdin);
}

/// Split FFmpeg's stderr on both `\r` (stats updates) and `\n`
async fn stderr_reader<R: AsyncRead + Unpin>(
    mut stderr: R,
    shared: Arc<PipelineShared>,
    destinations: DestinationSet,
    events: StageEvents,
) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(1024);

    loop {
        let read = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &byte in &buf[..read] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).to_string();
                    pending.clear();
                    handle_line(&line, &shared, &destinations, &events);
                }
            } else {
                pending.push(byte);
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).to_string();
        handle_line(&line, &shared, &destinations, &events);
    }
}

fn handle_line(line: &str, shared: &PipelineShared, destinations: &DestinationSet, events: &StageEvents) {
    let sanitized = destinations.redact(line);
    if let Ok(mut recent) = shared.recent_lines.lock() {
        recent.push(sanitized.clone());
    }

    if is_noteworthy(&sanitized) {
        log::warn!("[ffmpeg] {sanitized}");
    }

    if let Some(message) = shared.observe_line(line) {
        if !shared.stopping.load(Ordering::Relaxed) {
            events.emit(StageEventKind::EncoderTransport(destinations.redact(&message)));
        }
    }
}

/// Own the child: report unexpected exits, or stop it gracefully on request
async fn monitor_process(
    mut child: Child,
    shared: Arc<PipelineShared>,
    stderr_task: JoinHandle<()>,
    stop_rx: oneshot::Receiver<()>,
    events: StageEvents,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            shared.active.store(false, Ordering::Relaxed);
            shared.rtmp_connected.store(false, Ordering::Relaxed);
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_task).await;

            if shared.stopping.load(Ordering::Relaxed) {
                return;
            }

            let code = status.ok().and_then(|s| s.code());
            let detail = shared
                .recent_lines
                .lock()
                .ok()
                .and_then(|recent| recent.error_detail());
            log::error!(
                "FFmpeg exited unexpectedly (code {:?}): {}",
                code,
                detail.as_deref().unwrap_or("no details")
            );
            events.emit(StageEventKind::EncoderExited { code, detail });
        }
        _ = stop_rx => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => log::debug!("FFmpeg exited gracefully"),
                Err(_) => {
                    log::warn!("FFmpeg did not exit within {}s, killing", grace.as_secs());
                    let _ = child.kill().await;
                }
            }
            shared.active.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AudioSource, Destination, PipelineConfig};

    fn plan(mode: CaptureModeKind, destinations: Vec<Destination>) -> PipelinePlan {
        PipelinePlan {
            config: PipelineConfig {
                width: 1280,
                height: 720,
                fps: 30,
                video_bitrate: "2500k".to_string(),
                audio_bitrate: "128k".to_string(),
                video_encoder: "auto".to_string(),
                mode,
                display: ":99".to_string(),
            },
            destinations: DestinationSet::new(destinations),
            audio: AudioSource::Silent,
        }
    }

    fn dest(name: &str, url: &str, key: &str) -> Destination {
        Destination::new(name, url, key).unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_no_destinations_is_rejected() {
        let result = build_args(&plan(CaptureModeKind::Push, vec![]), &ProbedEncoder::software());
        assert!(matches!(result, Err(PipelineError::NoDestinations)));
    }

    #[test]
    fn test_push_mode_single_destination() {
        let args = build_args(
            &plan(CaptureModeKind::Push, vec![dest("twitch", "rtmp://live.twitch.tv/app", "key1")]),
            &ProbedEncoder::software(),
        )
        .unwrap();

        assert!(has_pair(&args, "-f", "image2pipe"));
        assert!(has_pair(&args, "-i", "pipe:0"));
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-preset", "veryfast"));
        assert!(has_pair(&args, "-tune", "zerolatency"));
        assert!(has_pair(&args, "-g", "60"));
        assert!(has_pair(&args, "-keyint_min", "60"));
        assert!(has_pair(&args, "-bufsize", "5000k"));
        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-f", "flv"));
        assert!(!args.contains(&"tee".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("rtmp://live.twitch.tv/app/key1"));
    }

    #[test]
    fn test_display_mode_with_tee_output() {
        let args = build_args(
            &plan(
                CaptureModeKind::Display,
                vec![
                    dest("youtube", "rtmp://a.rtmp.youtube.com/live2", "yt"),
                    dest("twitch", "rtmp://live.twitch.tv/app", "tw"),
                ],
            ),
            &ProbedEncoder { name: "h264_nvenc".to_string(), hardware: true },
        )
        .unwrap();

        assert!(has_pair(&args, "-f", "x11grab"));
        assert!(has_pair(&args, "-i", ":99+0,0"));
        assert!(has_pair(&args, "-video_size", "1280x720"));
        assert!(has_pair(&args, "-rc", "cbr"));
        assert!(has_pair(&args, "-f", "tee"));
        assert!(has_pair(&args, "-flags", "+global_header"));
        assert!(!args.contains(&"-x264-params".to_string()));

        let descriptor = args.last().unwrap();
        assert_eq!(descriptor.matches("[f=flv:onfail=ignore]").count(), 2);
        assert!(descriptor.contains("rtmp://a.rtmp.youtube.com/live2/yt|"));
    }

    #[test]
    fn test_audio_is_second_input() {
        let mut p = plan(CaptureModeKind::Push, vec![dest("x", "rtmp://x/app", "k")]);
        p.audio = AudioSource::LocalLoop(PathBuf::from("/srv/loop.mp3"));
        let args = build_args(&p, &ProbedEncoder::software()).unwrap();

        let inputs: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "-i")
            .map(|w| &w[1])
            .collect();
        assert_eq!(inputs, vec!["pipe:0", "/srv/loop.mp3"]);
        assert!(has_pair(&args, "-stream_loop", "-1"));
        assert!(has_pair(&args, "-map", "1:a:0"));
    }

    #[test]
    fn test_vaapi_uploads_frames() {
        let args = build_args(
            &plan(CaptureModeKind::Push, vec![dest("x", "rtmp://x/app", "k")]),
            &ProbedEncoder { name: "h264_vaapi".to_string(), hardware: true },
        )
        .unwrap();
        assert_eq!(args[3], "-vaapi_device");
        assert!(args.iter().any(|a| a.ends_with("format=nv12,hwupload")));
        assert!(!args.contains(&"-pix_fmt".to_string()));
    }

    #[test]
    fn test_sanitize_args_masks_keys() {
        let p = plan(
            CaptureModeKind::Push,
            vec![
                dest("youtube", "rtmp://yt/live2", "secret-yt"),
                dest("twitch", "rtmp://tw/app", "secret-tw"),
            ],
        );
        let args = build_args(&p, &ProbedEncoder::software()).unwrap();
        let sanitized = sanitize_args(&args, &p.destinations);
        assert!(sanitized.iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn test_double_bitrate() {
        assert_eq!(double_bitrate_value("2500k").as_deref(), Some("5000k"));
        assert_eq!(double_bitrate_value("1.5M").as_deref(), Some("3M"));
        assert_eq!(double_bitrate_value("k"), None);
    }

    #[tokio::test]
    async fn test_stderr_reader_tracks_progress_and_transport() {
        let shared = Arc::new(PipelineShared::new());
        let (events, mut rx) = StageEvents::channel();
        let destinations = DestinationSet::new(vec![dest("twitch", "rtmp://tw/app", "secret")]);

        let input: &[u8] = b"Output #0, flv, to 'rtmp://tw/app/secret':\nframe=  10 fps=30\rframe=  42 fps=29.5\r[rtmp @ 0x1] Connection reset by peer at rtmp://tw/app/secret\n";
        stderr_reader(input, shared.clone(), destinations, events).await;

        assert_eq!(shared.frame_count.load(Ordering::Relaxed), 42);
        assert!(!shared.rtmp_connected.load(Ordering::Relaxed));

        let event = rx.recv().await.unwrap();
        match event.kind {
            StageEventKind::EncoderTransport(message) => {
                assert!(message.contains("Connection reset"));
                assert!(!message.contains("secret"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let recent = shared.recent_lines.lock().unwrap();
        assert_eq!(recent.lines().len(), 4);
        assert!(recent.lines().iter().all(|l| !l.contains("secret")));
    }

    #[tokio::test]
    async fn test_progress_never_goes_backwards() {
        let shared = PipelineShared::new();
        shared.observe_line("frame=100");
        shared.observe_line("frame=90");
        assert_eq!(shared.frame_count.load(Ordering::Relaxed), 100);

        assert!(shared.observe_line("Stream mapping:").is_none());
        assert!(shared.rtmp_connected.load(Ordering::Relaxed));
    }
}
