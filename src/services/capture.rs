// Capture Source Service
// Drives a Chromium page and turns it into video frames for the encoder

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{CaptureConfig, CaptureModeKind};
use crate::services::cdp::{Browser, BrowserOptions, CdpError, CdpSession};
use crate::services::{CaptureStage, FrameSink, PageHandle, PageNavigator, StageEventKind, StageEvents};

/// Text that only shows up on Chromium's error and crash pages
const CRASH_SIGNATURES: &[&str] = &["Aw, Snap!", "He's dead, Jim", "isn't working", "ERR_"];

/// Bodies shorter than this are treated as blank
const MIN_BODY_TEXT_CHARS: usize = 10;

const NORMALIZE_SCRIPT: &str = r#"(() => {
    const id = '__pagecast_normalize';
    let style = document.getElementById(id);
    if (!style) {
        style = document.createElement('style');
        style.id = id;
        (document.head || document.documentElement).appendChild(style);
    }
    style.textContent = 'html, body { overflow: hidden !important; cursor: none !important; } ::-webkit-scrollbar { display: none !important; }';
    window.scrollTo(0, 0);
    return true;
})()"#;

const HEALTH_SCRIPT: &str = r#"(() => ({
    title: document.title || '',
    text: (document.body && document.body.innerText) ? document.body.innerText.slice(0, 2000) : ''
}))()"#;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Capture not running")]
    NotRunning,

    #[error(transparent)]
    Browser(#[from] CdpError),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
}

/// Inspect the page's title and visible text for signs of a crash or blank render
pub fn detect_page_crash(title: &str, body_text: &str) -> Option<String> {
    for signature in CRASH_SIGNATURES {
        if title.contains(signature) || body_text.contains(signature) {
            return Some(format!("Page shows crash signature \"{signature}\""));
        }
    }

    let visible = body_text.trim().chars().count();
    if visible < MIN_BODY_TEXT_CHARS {
        return Some(format!("Page body looks blank ({visible} chars of text)"));
    }

    None
}

/// Page driven over DevTools; the director navigates it in place
pub struct CdpPage {
    session: Arc<CdpSession>,
    load_timeout: Duration,
}

impl CdpPage {
    pub fn new(session: Arc<CdpSession>, load_timeout: Duration) -> Self {
        Self { session, load_timeout }
    }

    /// Title and visible text, for crash detection
    pub async fn health_probe(&self) -> Result<(String, String), CdpError> {
        let value = self.session.evaluate(HEALTH_SCRIPT).await?;
        let title = value.get("title").and_then(Value::as_str).unwrap_or_default();
        let text = value.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok((title.to_string(), text.to_string()))
    }
}

#[async_trait]
impl PageNavigator for CdpPage {
    async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
        let mut events = self.session.subscribe();

        let result = self.session.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            if !error.is_empty() {
                return Err(CaptureError::Navigation {
                    url: url.to_string(),
                    reason: error.to_string(),
                });
            }
        }

        let loaded = tokio::time::timeout(self.load_timeout, async {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == "Page.loadEventFired" => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match loaded {
            Ok(true) => log::info!("Loaded {url}"),
            Ok(false) => return Err(CaptureError::Browser(CdpError::Closed)),
            Err(_) => log::warn!(
                "{url} did not finish loading within {}s, continuing",
                self.load_timeout.as_secs()
            ),
        }
        Ok(())
    }

    async fn normalize(&self) -> Result<(), CaptureError> {
        self.session.evaluate(NORMALIZE_SCRIPT).await?;
        Ok(())
    }
}

/// How pixels leave the browser
#[async_trait]
pub trait CaptureMode: Send + Sync {
    fn kind(&self) -> CaptureModeKind;

    /// X display the browser window must be shown on; None runs headless
    fn browser_display(&self) -> Option<String>;

    /// Start producing frames from a loaded page
    async fn begin(&mut self, session: Arc<CdpSession>, config: &CaptureConfig) -> Result<(), CaptureError>;

    async fn end(&mut self, session: &CdpSession);
}

/// FFmpeg grabs the X display directly; the browser only has to stay up
pub struct DisplayCapture {
    display: String,
}

impl DisplayCapture {
    pub fn new(display: impl Into<String>) -> Self {
        Self { display: display.into() }
    }
}

#[async_trait]
impl CaptureMode for DisplayCapture {
    fn kind(&self) -> CaptureModeKind {
        CaptureModeKind::Display
    }

    fn browser_display(&self) -> Option<String> {
        Some(self.display.clone())
    }

    async fn begin(&mut self, _session: Arc<CdpSession>, config: &CaptureConfig) -> Result<(), CaptureError> {
        log::info!("Display capture on {} at {}x{}", self.display, config.width, config.height);
        Ok(())
    }

    async fn end(&mut self, _session: &CdpSession) {}
}

/// Screencast JPEG frames, re-sent at a fixed rate into the encoder's stdin
pub struct FramePushCapture {
    frames: FrameSink,
    tasks: Vec<JoinHandle<()>>,
}

impl FramePushCapture {
    pub fn new(frames: FrameSink) -> Self {
        Self {
            frames,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl CaptureMode for FramePushCapture {
    fn kind(&self) -> CaptureModeKind {
        CaptureModeKind::Push
    }

    fn browser_display(&self) -> Option<String> {
        None
    }

    async fn begin(&mut self, session: Arc<CdpSession>, config: &CaptureConfig) -> Result<(), CaptureError> {
        session
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": config.width,
                    "height": config.height,
                    "deviceScaleFactor": 1,
                    "mobile": false
                }),
            )
            .await?;

        let latest: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let mut events = session.subscribe();

        session
            .call(
                "Page.startScreencast",
                json!({
                    "format": "jpeg",
                    "quality": config.quality,
                    "maxWidth": config.width,
                    "maxHeight": config.height,
                    "everyNthFrame": 1
                }),
            )
            .await?;

        let receiver_session = session.clone();
        let receiver_latest = latest.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Screencast receiver lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if event.method != "Page.screencastFrame" {
                    continue;
                }

                if let Some(session_id) = event.params.get("sessionId").and_then(Value::as_u64) {
                    receiver_session.notify("Page.screencastFrameAck", json!({ "sessionId": session_id }));
                }

                let Some(data) = event.params.get("data").and_then(Value::as_str) else {
                    continue;
                };
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(jpeg) => {
                        if let Ok(mut slot) = receiver_latest.lock() {
                            *slot = Some(Bytes::from(jpeg));
                        }
                    }
                    Err(e) => log::debug!("Dropping undecodable screencast frame: {e}"),
                }
            }
        }));

        // The screencast only emits on repaint; repeat the last frame to hold the rate
        let frames = self.frames.clone();
        let period = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let dropped = AtomicU64::new(0);
            loop {
                ticker.tick().await;
                let frame = latest.lock().ok().and_then(|slot| slot.clone());
                if let Some(frame) = frame {
                    if !frames.write_frame(frame) {
                        let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if count % 300 == 0 {
                            log::warn!("Encoder not keeping up, {count} frames dropped");
                        }
                    }
                }
            }
        }));

        log::info!(
            "Frame push capture at {}x{} {} fps (jpeg q{})",
            config.width,
            config.height,
            config.fps,
            config.quality
        );
        Ok(())
    }

    async fn end(&mut self, session: &CdpSession) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if !session.is_closed() {
            let _ = session.call("Page.stopScreencast", json!({})).await;
        }
    }
}

/// Browser/timeout settings for a capture source
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub chromium: PathBuf,
    pub launch_timeout: Duration,
    pub call_timeout: Duration,
    pub load_timeout: Duration,
    pub page_health_interval: Duration,
}

/// One browser instance plus the capture mode feeding the encoder
pub struct CaptureSource {
    mode: Box<dyn CaptureMode>,
    options: CaptureOptions,
    browser: Option<Browser>,
    page: Option<Arc<CdpPage>>,
    tasks: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl CaptureSource {
    pub fn new(mode: Box<dyn CaptureMode>, options: CaptureOptions) -> Self {
        Self {
            mode,
            options,
            browser: None,
            page: None,
            tasks: Vec::new(),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&mut self, config: &CaptureConfig, events: StageEvents) -> Result<(), CaptureError> {
        if self.browser.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        self.stopping.store(false, Ordering::SeqCst);
        log::info!(
            "Starting {} capture at {}x{}",
            self.mode.kind().as_str(),
            config.width,
            config.height
        );

        let browser_options = BrowserOptions {
            chromium: self.options.chromium.clone(),
            width: config.width,
            height: config.height,
            display: self.mode.browser_display(),
            launch_timeout: self.options.launch_timeout,
            call_timeout: self.options.call_timeout,
        };
        let browser = Browser::launch(&browser_options).await?;
        let session = browser.session();
        self.browser = Some(browser);

        if let Err(e) = self.prepare(session, config).await {
            log::error!("Capture setup failed: {e}");
            self.stop().await;
            return Err(e);
        }

        self.spawn_watchers(events);
        Ok(())
    }

    async fn prepare(&mut self, session: Arc<CdpSession>, config: &CaptureConfig) -> Result<(), CaptureError> {
        session.call("Page.enable", json!({})).await?;
        session.call("Runtime.enable", json!({})).await?;

        let page = Arc::new(CdpPage::new(session.clone(), self.options.load_timeout));
        page.navigate(&config.url).await?;
        page.normalize().await?;
        self.page = Some(page);

        self.mode.begin(session, config).await
    }

    fn spawn_watchers(&mut self, events: StageEvents) {
        if let Some(browser) = self.browser.as_ref() {
            let mut disconnected = browser.disconnected();
            let stopping = self.stopping.clone();
            let events = events.clone();
            self.tasks.push(tokio::spawn(async move {
                while disconnected.changed().await.is_ok() {
                    let reason = disconnected.borrow().clone();
                    if let Some(reason) = reason {
                        if !stopping.load(Ordering::SeqCst) {
                            log::error!("Browser disconnected: {reason}");
                            events.emit(StageEventKind::BrowserDisconnected(reason));
                        }
                        break;
                    }
                }
            }));
        }

        if let Some(page) = self.page.clone() {
            let stopping = self.stopping.clone();
            let interval = self.options.page_health_interval;
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    match page.health_probe().await {
                        Ok((title, text)) => {
                            if let Some(problem) = detect_page_crash(&title, &text) {
                                log::error!("Page health check failed: {problem}");
                                events.emit(StageEventKind::CaptureError(problem));
                            }
                        }
                        Err(CdpError::Closed) => break,
                        Err(e) => log::warn!("Page health check could not run: {e}"),
                    }
                }
            }));
        }
    }

    /// Tear everything down; safe to call when not running
    pub async fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(mut browser) = self.browser.take() {
            let session = browser.session();
            self.mode.end(&session).await;
            browser.close().await;
        }
        self.page = None;
    }
}

#[async_trait]
impl CaptureStage for CaptureSource {
    fn is_running(&self) -> bool {
        self.browser.as_ref().map(|b| b.is_connected()).unwrap_or(false)
    }

    fn page_handle(&self) -> Option<PageHandle> {
        self.page.clone().map(|page| page as PageHandle)
    }

    async fn stop(&mut self) {
        CaptureSource::stop(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_signatures() {
        assert!(detect_page_crash("Aw, Snap!", "Something went wrong while displaying this webpage.").is_some());
        assert!(detect_page_crash("localhost", "This site can't be reached ERR_CONNECTION_REFUSED").is_some());
        assert!(detect_page_crash("Status", "This page isn't working right now").is_some());
        assert!(detect_page_crash("He's dead, Jim!", "").is_some());
    }

    #[test]
    fn test_blank_body() {
        let problem = detect_page_crash("Dashboard", "  \n ").unwrap();
        assert!(problem.contains("blank"));
        assert!(detect_page_crash("Dashboard", "short").is_some());
    }

    #[test]
    fn test_healthy_page() {
        assert_eq!(
            detect_page_crash("Build status", "Cycle 42: compiling the next release, 3 jobs running"),
            None
        );
    }

    #[test]
    fn test_mode_kinds() {
        let display = DisplayCapture::new(":99");
        assert_eq!(display.kind(), CaptureModeKind::Display);
        assert_eq!(display.browser_display().as_deref(), Some(":99"));

        let push = FramePushCapture::new(FrameSink::detached());
        assert_eq!(push.kind(), CaptureModeKind::Push);
        assert!(push.browser_display().is_none());
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_source_stopped() {
        let mut source = CaptureSource::new(
            Box::new(FramePushCapture::new(FrameSink::detached())),
            CaptureOptions {
                chromium: PathBuf::from("/nonexistent/chromium"),
                launch_timeout: Duration::from_secs(1),
                call_timeout: Duration::from_secs(1),
                load_timeout: Duration::from_secs(1),
                page_health_interval: Duration::from_secs(30),
            },
        );
        let (events, _rx) = StageEvents::channel();
        let config = CaptureConfig {
            url: "http://127.0.0.1:9/".to_string(),
            width: 640,
            height: 360,
            fps: 10,
            quality: 70,
            mode: CaptureModeKind::Push,
            display: ":99".to_string(),
        };

        let result = source.start(&config, events).await;
        assert!(matches!(result, Err(CaptureError::Browser(CdpError::Launch(_)))));
        assert!(!source.is_running());
        assert!(source.page_handle().is_none());
        source.stop().await;
    }
}
