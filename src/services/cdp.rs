// Chromium DevTools Client
// Launches Chromium with remote debugging and speaks the DevTools protocol over a websocket

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DISCOVERY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CdpError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("DevTools endpoint unavailable: {0}")]
    Discovery(String),

    #[error("DevTools connection failed: {0}")]
    Connect(String),

    #[error("DevTools call {0} timed out")]
    Timeout(String),

    #[error("DevTools error: {0}")]
    Protocol(String),

    #[error("DevTools connection closed")]
    Closed,
}

/// Protocol event pushed by the browser
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>>>;

/// One websocket session attached to a page target
pub struct CdpSession {
    next_id: AtomicU64,
    pending: PendingCalls,
    outgoing: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CdpEvent>,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl CdpSession {
    /// Connect to a target's `webSocketDebuggerUrl`.
    /// `on_close` receives a reason when the socket drops.
    pub async fn connect(
        ws_url: &str,
        call_timeout: Duration,
        on_close: Arc<watch::Sender<Option<String>>>,
    ) -> Result<Arc<Self>, CdpError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || is_close {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_message(&text, &reader_pending, &reader_events);
                    }
                    Some(Ok(Message::Close(_))) | None => break "DevTools socket closed".to_string(),
                    Some(Err(e)) => break format!("DevTools socket error: {e}"),
                    Some(Ok(_)) => {}
                }
            };

            reader_closed.store(true, Ordering::SeqCst);
            if let Ok(mut pending) = reader_pending.lock() {
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(CdpError::Closed));
                }
            }
            let _ = on_close.send(Some(reason));
        });

        Ok(Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            events,
            closed,
            call_timeout,
        }))
    }

    /// Send a command and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let request = json!({ "id": id, "method": method, "params": params });
        if self.outgoing.send(Message::Text(request.to_string())).is_err() {
            self.forget(id);
            return Err(CdpError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.forget(id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }

    /// Send a command without waiting for the reply
    pub fn notify(&self, method: &str, params: Value) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "id": id, "method": method, "params": params });
        let _ = self.outgoing.send(Message::Text(request.to_string()));
    }

    /// Evaluate an expression in the page and return its value
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation failed");
            return Err(CdpError::Protocol(text.to_string()));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the websocket
    pub fn disconnect(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// Route a websocket text frame: replies go to their caller, events to subscribers
fn dispatch_message(text: &str, pending: &PendingCalls, events: &broadcast::Sender<CdpEvent>) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        log::debug!("Ignoring malformed DevTools message");
        return;
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let sender = pending.lock().ok().and_then(|mut p| p.remove(&id));
        if let Some(sender) = sender {
            let result = match message.get("error") {
                Some(error) => Err(CdpError::Protocol(
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                )),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = sender.send(result);
        }
        return;
    }

    if let Some(method) = message.get("method").and_then(Value::as_str) {
        let _ = events.send(CdpEvent {
            method: method.to_string(),
            params: message.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}

/// Entry of the DevTools `/json/list` endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    #[serde(rename = "type")]
    pub target_type: String,
    pub web_socket_debugger_url: Option<String>,
}

/// First page target that can be attached to
pub fn select_page_target(targets: &[TargetInfo]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.target_type == "page")
        .find_map(|t| t.web_socket_debugger_url.clone())
}

/// Browser launch parameters
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub chromium: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Kiosk window on an X display instead of headless
    pub display: Option<String>,
    pub launch_timeout: Duration,
    pub call_timeout: Duration,
}

/// Command line for a fresh, locked-down Chromium instance
pub fn chromium_args(options: &BrowserOptions, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={port}"),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-infobars".to_string(),
        "--disable-session-crashed-bubble".to_string(),
        "--disable-features=Translate".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        format!("--window-size={},{}", options.width, options.height),
    ];

    if options.display.is_some() {
        args.push("--kiosk".to_string());
        args.push("--window-position=0,0".to_string());
    } else {
        args.push("--headless=new".to_string());
    }

    args.push("about:blank".to_string());
    args
}

/// Ask the OS for an unused local port
pub fn find_free_port() -> Result<u16, CdpError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|e| CdpError::Launch(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| CdpError::Launch(e.to_string()))?
        .port();
    Ok(port)
}

/// A running Chromium process with one attached page session
pub struct Browser {
    session: Arc<CdpSession>,
    disconnected: watch::Receiver<Option<String>>,
    stopping: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    _profile: TempDir,
}

impl Browser {
    pub async fn launch(options: &BrowserOptions) -> Result<Self, CdpError> {
        let profile = tempfile::Builder::new()
            .prefix("pagecast-chromium-")
            .tempdir()
            .map_err(|e| CdpError::Launch(format!("Failed to create profile dir: {e}")))?;
        let port = find_free_port()?;

        let mut command = Command::new(&options.chromium);
        command
            .args(chromium_args(options, port, profile.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(display) = options.display.as_deref() {
            command.env("DISPLAY", display);
        }

        let child = command
            .spawn()
            .map_err(|e| CdpError::Launch(format!("{}: {e}", options.chromium.display())))?;
        log::info!("Chromium started (pid {:?}, devtools port {port})", child.id());

        let (disconnect_tx, disconnected) = watch::channel(None);
        let disconnect_tx = Arc::new(disconnect_tx);
        let stopping = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_browser(
            child,
            kill_rx,
            stopping.clone(),
            disconnect_tx.clone(),
        ));

        let ws_url = match wait_for_page_target(port, options.launch_timeout).await {
            Ok(url) => url,
            Err(e) => {
                let _ = kill_tx.send(());
                let _ = monitor.await;
                return Err(e);
            }
        };

        let session = match CdpSession::connect(&ws_url, options.call_timeout, disconnect_tx).await {
            Ok(session) => session,
            Err(e) => {
                let _ = kill_tx.send(());
                let _ = monitor.await;
                return Err(e);
            }
        };

        Ok(Self {
            session,
            disconnected,
            stopping,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
            _profile: profile,
        })
    }

    pub fn session(&self) -> Arc<CdpSession> {
        self.session.clone()
    }

    /// Fires with a reason when the process exits or the socket drops
    pub fn disconnected(&self) -> watch::Receiver<Option<String>> {
        self.disconnected.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected.borrow().is_none()
    }

    /// Close the page, then the browser; close errors are ignored
    pub async fn close(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        if !self.session.is_closed() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.session.call("Page.close", json!({}))).await;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.session.call("Browser.close", json!({}))).await;
            self.session.disconnect();
        }

        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        log::info!("Chromium closed");
    }
}

/// Poll `/json/list` until a page target with a websocket URL shows up
async fn wait_for_page_target(port: u16, timeout: Duration) -> Result<String, CdpError> {
    let client = Client::builder()
        .timeout(DISCOVERY_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CdpError::Discovery(format!("Failed to build HTTP client: {e}")))?;
    let url = format!("http://127.0.0.1:{port}/json/list");

    let start_time = tokio::time::Instant::now();
    loop {
        if start_time.elapsed() > timeout {
            return Err(CdpError::Discovery(format!(
                "no page target after {}s",
                timeout.as_secs()
            )));
        }

        if let Ok(response) = client.get(&url).send().await {
            if let Ok(targets) = response.json::<Vec<TargetInfo>>().await {
                if let Some(ws_url) = select_page_target(&targets) {
                    return Ok(ws_url);
                }
            }
        }

        tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
    }
}

/// Own the Chromium child until it exits or is told to die
async fn monitor_browser(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stopping: Arc<AtomicBool>,
    disconnect_tx: Arc<watch::Sender<Option<String>>>,
) {
    tokio::select! {
        status = child.wait() => {
            if !stopping.load(Ordering::SeqCst) {
                let reason = match status {
                    Ok(status) => format!("Chromium exited ({status})"),
                    Err(e) => format!("Chromium wait failed: {e}"),
                };
                log::error!("{reason}");
                let _ = disconnect_tx.send(Some(reason));
            }
        }
        _ = kill_rx => {
            match tokio::time::timeout(CLOSE_TIMEOUT, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(display: Option<&str>) -> BrowserOptions {
        BrowserOptions {
            chromium: PathBuf::from("/usr/bin/chromium"),
            width: 1280,
            height: 720,
            display: display.map(str::to_string),
            launch_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_headless_args() {
        let args = chromium_args(&options(None), 9333, Path::new("/tmp/profile"));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-dev-shm-usage".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(!args.contains(&"--kiosk".to_string()));
    }

    #[test]
    fn test_kiosk_args_on_display() {
        let args = chromium_args(&options(Some(":99")), 9333, Path::new("/tmp/p"));
        assert!(args.contains(&"--kiosk".to_string()));
        assert!(args.contains(&"--window-position=0,0".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn test_select_page_target() {
        let targets: Vec<TargetInfo> = serde_json::from_value(json!([
            { "type": "service_worker", "url": "x", "webSocketDebuggerUrl": "ws://sw" },
            { "type": "page", "url": "about:blank", "webSocketDebuggerUrl": "ws://127.0.0.1:9333/devtools/page/ABC" }
        ]))
        .unwrap();
        assert_eq!(
            select_page_target(&targets).as_deref(),
            Some("ws://127.0.0.1:9333/devtools/page/ABC")
        );
        assert!(select_page_target(&targets[..1]).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_routes_replies_and_events() {
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (events, mut events_rx) = broadcast::channel(8);

        let (ok_tx, ok_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, ok_tx);
        pending.lock().unwrap().insert(2, err_tx);

        dispatch_message(r#"{"id":1,"result":{"frameId":"F"}}"#, &pending, &events);
        dispatch_message(r#"{"id":2,"error":{"code":-32000,"message":"Cannot navigate"}}"#, &pending, &events);
        dispatch_message(r#"{"method":"Page.loadEventFired","params":{"timestamp":1.0}}"#, &pending, &events);
        dispatch_message("not json", &pending, &events);

        assert_eq!(ok_rx.await.unwrap().unwrap()["frameId"], "F");
        assert!(matches!(err_rx.await.unwrap(), Err(CdpError::Protocol(m)) if m == "Cannot navigate"));
        assert_eq!(events_rx.recv().await.unwrap().method, "Page.loadEventFired");
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(find_free_port().unwrap(), 0);
    }
}
