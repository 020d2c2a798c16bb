// Director Service
// Follows the control plane's status and switches the live page between scenes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{Scene, SceneUrls};
use crate::services::{CaptureError, DirectorStage, PageHandle, StageEventKind, StageEvents, StreamerError};

/// Response of `GET {brain}/status`
#[derive(Debug, Clone, Deserialize)]
pub struct BrainStatus {
    pub mode: String,
    #[serde(default)]
    pub cycle: Option<Value>,
}

/// Scene a control-plane mode calls for; unknown modes leave the scene alone
pub fn scene_for_mode(mode: &str) -> Option<Scene> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "building" => Some(Scene::Primary),
        "resting" | "idle" => Some(Scene::Secondary),
        _ => None,
    }
}

/// Polling settings
#[derive(Debug, Clone)]
pub struct DirectorOptions {
    pub brain_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

struct DirectorCore {
    page: PageHandle,
    scenes: SceneUrls,
    scene: RwLock<Scene>,
    navigating: AtomicBool,
    events: StageEvents,
}

impl DirectorCore {
    fn scene(&self) -> Scene {
        self.scene.read().map(|s| *s).unwrap_or_default()
    }

    /// Navigate to `target` unless already there or another switch is running.
    /// Returns whether a navigation happened.
    async fn switch_to(&self, target: Scene) -> Result<bool, CaptureError> {
        if self.scene() == target {
            return Ok(false);
        }
        if self
            .navigating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Scene switch already in progress, skipping");
            return Ok(false);
        }

        let url = self.scenes.url_for(target);
        log::info!("Switching scene to {} ({url})", target.as_str());
        let result = async {
            self.page.navigate(url).await?;
            self.page.normalize().await
        }
        .await;

        if result.is_ok() {
            if let Ok(mut scene) = self.scene.write() {
                *scene = target;
            }
            self.events.emit(StageEventKind::SceneChanged(target));
        }
        self.navigating.store(false, Ordering::SeqCst);

        result.map(|_| true)
    }

    async fn apply_status(&self, status: &BrainStatus) -> bool {
        let Some(target) = scene_for_mode(&status.mode) else {
            log::debug!("Ignoring unknown control-plane mode {:?}", status.mode);
            return false;
        };

        match self.switch_to(target).await {
            Ok(navigated) => navigated,
            Err(e) => {
                log::warn!("Scene switch to {} failed: {e}", target.as_str());
                false
            }
        }
    }
}

async fn fetch_status(client: &Client, url: &str) -> Result<BrainStatus, String> {
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("status endpoint returned {}", response.status()));
    }

    response
        .json::<BrainStatus>()
        .await
        .map_err(|e| format!("invalid status response: {e}"))
}

/// Scene director bound to one page for one pipeline generation
pub struct Director {
    core: Arc<DirectorCore>,
    task: Option<JoinHandle<()>>,
}

impl Director {
    pub fn new(page: PageHandle, scenes: SceneUrls, initial: Scene, events: StageEvents) -> Self {
        Self {
            core: Arc::new(DirectorCore {
                page,
                scenes,
                scene: RwLock::new(initial),
                navigating: AtomicBool::new(false),
                events,
            }),
            task: None,
        }
    }

    /// Begin polling the control plane
    pub fn start(&mut self, options: DirectorOptions) -> Result<(), StreamerError> {
        if self.task.is_some() {
            return Err(StreamerError::AlreadyRunning);
        }

        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| StreamerError::Config(format!("Failed to build HTTP client: {e}")))?;
        let url = format!("{}/status", options.brain_url.trim_end_matches('/'));
        let core = self.core.clone();

        log::info!(
            "Director polling {url} every {}ms",
            options.poll_interval.as_millis()
        );
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if core.navigating.load(Ordering::SeqCst) {
                    continue;
                }
                match fetch_status(&client, &url).await {
                    Ok(status) => {
                        core.apply_status(&status).await;
                    }
                    Err(e) => log::warn!("Director status poll failed: {e}"),
                }
            }
        }));
        Ok(())
    }

    /// Apply one status response; true when it caused a navigation
    pub async fn apply_status(&self, status: &BrainStatus) -> bool {
        self.core.apply_status(status).await
    }
}

#[async_trait]
impl DirectorStage for Director {
    fn scene(&self) -> Scene {
        self.core.scene()
    }

    async fn force_scene(&self, scene: Scene) -> Result<(), StreamerError> {
        let navigated = self.core.switch_to(scene).await?;
        if !navigated && self.core.scene() != scene {
            return Err(StreamerError::SceneSwitchInProgress);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::info!("Director stopped");
        }
    }
}

impl Drop for Director {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::PageNavigator;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePage {
        visited: Mutex<Vec<String>>,
        normalized: std::sync::atomic::AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PageNavigator for FakePage {
        async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CaptureError::Navigation {
                    url: url.to_string(),
                    reason: "net::ERR_TIMED_OUT".to_string(),
                });
            }
            self.visited.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn normalize(&self) -> Result<(), CaptureError> {
            self.normalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scenes() -> SceneUrls {
        SceneUrls {
            primary: "http://page/status".to_string(),
            secondary: "http://page/ambient".to_string(),
        }
    }

    fn status(mode: &str) -> BrainStatus {
        BrainStatus { mode: mode.to_string(), cycle: None }
    }

    #[test]
    fn test_scene_for_mode() {
        assert_eq!(scene_for_mode("building"), Some(Scene::Primary));
        assert_eq!(scene_for_mode("Resting"), Some(Scene::Secondary));
        assert_eq!(scene_for_mode("idle"), Some(Scene::Secondary));
        assert_eq!(scene_for_mode("deploying"), None);
    }

    #[tokio::test]
    async fn test_status_sequence_navigates_twice() {
        let page = Arc::new(FakePage::default());
        let (events, mut rx) = StageEvents::channel();
        let director = Director::new(page.clone(), scenes(), Scene::Secondary, events);

        let mut navigations = 0;
        for mode in ["idle", "building", "building", "resting"] {
            if director.apply_status(&status(mode)).await {
                navigations += 1;
            }
        }

        assert_eq!(navigations, 2);
        assert_eq!(page.normalized.load(Ordering::SeqCst), 2);
        assert_eq!(
            *page.visited.lock().unwrap(),
            vec!["http://page/status".to_string(), "http://page/ambient".to_string()]
        );
        assert_eq!(director.scene(), Scene::Secondary);
        assert_eq!(rx.recv().await.unwrap().kind, StageEventKind::SceneChanged(Scene::Primary));
        assert_eq!(rx.recv().await.unwrap().kind, StageEventKind::SceneChanged(Scene::Secondary));
    }

    #[tokio::test]
    async fn test_failed_navigation_keeps_scene() {
        let page = Arc::new(FakePage::default());
        page.fail.store(true, Ordering::SeqCst);
        let (events, _rx) = StageEvents::channel();
        let director = Director::new(page.clone(), scenes(), Scene::Secondary, events);

        assert!(!director.apply_status(&status("building")).await);
        assert_eq!(director.scene(), Scene::Secondary);
        assert!(director.force_scene(Scene::Primary).await.is_err());
    }

    #[tokio::test]
    async fn test_force_scene_during_switch_is_rejected() {
        let page = Arc::new(FakePage::default());
        let (events, _rx) = StageEvents::channel();
        let director = Director::new(page.clone(), scenes(), Scene::Secondary, events);

        director.core.navigating.store(true, Ordering::SeqCst);
        assert_eq!(
            director.force_scene(Scene::Primary).await,
            Err(StreamerError::SceneSwitchInProgress)
        );
        assert_eq!(director.scene(), Scene::Secondary);
        assert!(page.visited.lock().unwrap().is_empty());

        // Already on the requested scene
        assert_eq!(director.force_scene(Scene::Secondary).await, Ok(()));

        director.core.navigating.store(false, Ordering::SeqCst);
        assert_eq!(director.force_scene(Scene::Primary).await, Ok(()));
        assert_eq!(director.scene(), Scene::Primary);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_ignored() {
        let page = Arc::new(FakePage::default());
        let (events, _rx) = StageEvents::channel();
        let director = Director::new(page.clone(), scenes(), Scene::Primary, events);

        assert!(!director.apply_status(&status("maintenance")).await);
        assert!(page.visited.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_polls_status_endpoint() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/status",
            get(|| async { Json(serde_json::json!({ "mode": "building", "cycle": { "id": 7 } })) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let page = Arc::new(FakePage::default());
        let (events, mut rx) = StageEvents::channel();
        let mut director = Director::new(page.clone(), scenes(), Scene::Secondary, events);
        director
            .start(DirectorOptions {
                brain_url: format!("http://{addr}/"),
                poll_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(2),
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, StageEventKind::SceneChanged(Scene::Primary));
        director.stop().await;
        assert_eq!(page.visited.lock().unwrap().len(), 1);
    }
}
