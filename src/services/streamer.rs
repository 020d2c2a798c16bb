// Streamer Service
// Supervisor that owns the pipeline components, runs the health timers and
// rebuilds everything when a component fails

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::models::{AudioSource, DestinationSet, Scene, Settings, StreamerState, StreamerStatus};
use crate::services::{
    AudioResolver, CaptureStage, DestinationRegistry, DirectorStage, EncoderStage, PipelinePlan,
    StageEvent, StageEventKind, StageEventReceiver, StageEvents, StageLauncher, StreamerError,
};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// How often live encoder figures are copied into the status snapshot
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the supervisor needs to build pipelines
pub struct StreamerContext {
    pub settings: Settings,
    pub registry: DestinationRegistry,
    pub audio: AudioResolver,
    pub launcher: Arc<dyn StageLauncher>,
}

enum Command {
    Start(oneshot::Sender<Result<(), StreamerError>>),
    Stop(oneshot::Sender<Result<(), StreamerError>>),
    ForceScene(Scene, oneshot::Sender<Result<(), StreamerError>>),
}

struct Shared {
    status: RwLock<StreamerStatus>,
    shutting_down: AtomicBool,
    streaming_since: Mutex<Option<Instant>>,
}

/// Cloneable handle to the supervisor task
#[derive(Clone)]
pub struct Streamer {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

impl Streamer {
    /// Spawn the supervisor. It runs until every handle is dropped.
    pub fn spawn(context: StreamerContext) -> Self {
        let shared = Arc::new(Shared {
            status: RwLock::new(StreamerStatus::default()),
            shutting_down: AtomicBool::new(false),
            streaming_since: Mutex::new(None),
        });
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let scene = context.settings.initial_scene;
        let supervisor = Supervisor {
            events: StageEvents::new(0, events_tx),
            context,
            shared: shared.clone(),
            commands: commands_rx,
            events_rx,
            generation: 0,
            pipeline: None,
            scene,
            restart_count: 0,
            total_restarts: 0,
            timers: Timers::default(),
        };
        tokio::spawn(supervisor.run());

        Self { shared, commands }
    }

    pub async fn start(&self) -> Result<(), StreamerError> {
        self.request(Command::Start).await
    }

    /// Flag shutdown first so a restart in flight sees it, then stop
    pub async fn stop(&self) -> Result<(), StreamerError> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.request(Command::Stop).await
    }

    pub async fn force_scene(&self, scene: Scene) -> Result<(), StreamerError> {
        self.request(|reply| Command::ForceScene(scene, reply)).await
    }

    pub fn state(&self) -> StreamerState {
        self.shared
            .status
            .read()
            .map(|status| status.state)
            .unwrap_or_default()
    }

    pub fn status(&self) -> StreamerStatus {
        let mut status = self
            .shared
            .status
            .read()
            .map(|status| status.clone())
            .unwrap_or_default();
        status.uptime_secs = self
            .shared
            .streaming_since
            .lock()
            .ok()
            .and_then(|since| *since)
            .map(|since| since.elapsed().as_secs())
            .unwrap_or(0);
        status
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), StreamerError>>) -> Command,
    ) -> Result<(), StreamerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| StreamerError::Process("supervisor is gone".to_string()))?;
        response
            .await
            .map_err(|_| StreamerError::Process("supervisor dropped the request".to_string()))?
    }
}

/// Components of one pipeline generation
struct Pipeline {
    encoder: Box<dyn EncoderStage>,
    capture: Box<dyn CaptureStage>,
    director: Option<Box<dyn DirectorStage>>,
    destinations: DestinationSet,
    audio: AudioSource,
}

/// Timers armed while streaming; dropping one cancels it
#[derive(Default)]
struct Timers {
    health: Option<Interval>,
    watchdog: Option<Interval>,
    audio_refresh: Option<Interval>,
    telemetry: Option<Interval>,
    stable_at: Option<Instant>,
}

fn timer(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Supervisor {
    context: StreamerContext,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    events: StageEvents,
    events_rx: StageEventReceiver,
    generation: u64,
    pipeline: Option<Pipeline>,
    scene: Scene,
    restart_count: u32,
    total_restarts: u64,
    timers: Timers,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = tick(&mut self.timers.watchdog) => self.on_watchdog().await,
                _ = tick(&mut self.timers.health) => self.on_health_check().await,
                _ = tick(&mut self.timers.audio_refresh) => self.on_audio_refresh().await,
                _ = tick(&mut self.timers.telemetry) => self.publish_telemetry(),
                _ = deadline(self.timers.stable_at) => self.on_stable(),
            }
        }

        self.teardown().await;
        log::info!("Streamer supervisor exited");
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    fn state(&self) -> StreamerState {
        self.shared
            .status
            .read()
            .map(|status| status.state)
            .unwrap_or_default()
    }

    fn update_status(&self, update: impl FnOnce(&mut StreamerStatus)) {
        if let Ok(mut status) = self.shared.status.write() {
            update(&mut status);
        }
    }

    fn set_state(&self, state: StreamerState, error: Option<String>) {
        log::info!("Streamer state: {state:?}");
        self.update_status(|status| {
            status.state = state;
            if error.is_some() {
                status.last_error = error;
            }
        });
    }

    fn publish_counters(&self) {
        let (restart_count, total_restarts) = (self.restart_count, self.total_restarts);
        self.update_status(|status| {
            status.restart_count = restart_count;
            status.total_restarts = total_restarts;
        });
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                if self.state().is_active() {
                    let _ = reply.send(Err(StreamerError::AlreadyRunning));
                    return;
                }

                self.shared.shutting_down.store(false, Ordering::SeqCst);
                self.restart_count = 0;
                self.publish_counters();
                self.update_status(|status| status.last_error = None);
                self.set_state(StreamerState::Starting, None);

                match self.launch().await {
                    Ok(()) => {
                        self.on_streaming();
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) if e.is_config() => {
                        log::error!("Cannot start: {e}");
                        self.set_state(StreamerState::Error, Some(e.to_string()));
                        let _ = reply.send(Err(e));
                    }
                    Err(e) => {
                        // Accepted; the restart loop keeps trying
                        let _ = reply.send(Ok(()));
                        self.restart(e).await;
                    }
                }
            }
            Command::Stop(reply) => {
                if self.state() == StreamerState::Stopped && self.pipeline.is_none() {
                    let _ = reply.send(Err(StreamerError::NotRunning));
                    return;
                }
                self.shared.shutting_down.store(true, Ordering::SeqCst);
                self.teardown().await;
                self.set_state(StreamerState::Stopped, None);
                let _ = reply.send(Ok(()));
            }
            Command::ForceScene(scene, reply) => {
                let result = match self.pipeline.as_ref().and_then(|p| p.director.as_ref()) {
                    Some(director) => director.force_scene(scene).await,
                    None => Err(StreamerError::NoDirector),
                };
                if result.is_ok() {
                    self.scene = scene;
                    self.update_status(|status| status.scene = Some(scene));
                }
                let _ = reply.send(result);
            }
        }
    }

    // ========================================================================
    // Component events
    // ========================================================================

    async fn handle_event(&mut self, event: StageEvent) {
        if event.generation != self.generation || self.pipeline.is_none() {
            log::debug!(
                "Ignoring stale event from generation {} (current {}): {:?}",
                event.generation,
                self.generation,
                event.kind
            );
            return;
        }

        match event.kind {
            StageEventKind::SceneChanged(scene) => {
                self.scene = scene;
                self.update_status(|status| status.scene = Some(scene));
            }
            StageEventKind::EncoderTransport(message) => {
                let direct = self
                    .pipeline
                    .as_ref()
                    .map(|p| p.destinations.len() == 1)
                    .unwrap_or(false);
                if direct {
                    self.restart(StreamerError::Transport(message)).await;
                } else {
                    // Tee slaves fail independently (onfail=ignore)
                    log::warn!("Destination transport error: {message}");
                }
            }
            StageEventKind::EncoderExited { code, detail } => {
                let message = match (code, detail) {
                    (Some(code), Some(detail)) => format!("Encoder exited with code {code}: {detail}"),
                    (Some(code), None) => format!("Encoder exited with code {code}"),
                    (None, Some(detail)) => format!("Encoder exited: {detail}"),
                    (None, None) => "Encoder exited".to_string(),
                };
                self.restart(StreamerError::Process(message)).await;
            }
            StageEventKind::CaptureError(message) => {
                self.restart(StreamerError::Process(message)).await;
            }
            StageEventKind::BrowserDisconnected(reason) => {
                self.restart(StreamerError::Process(reason)).await;
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    async fn on_health_check(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };

        let progress = pipeline.encoder.check_frame_progress();
        let encoder_active = pipeline.encoder.is_active();
        let capture_running = pipeline.capture.is_running();
        log::info!(
            "Health check: {} new frames, last frame {:.1}s ago, encoder active: {encoder_active}, capture running: {capture_running}",
            progress.frames_since_last_check,
            progress.seconds_since_last_frame
        );

        if !progress.healthy || !encoder_active {
            self.restart(StreamerError::Stall(format!(
                "{} frames since last check, last frame {:.0}s ago",
                progress.frames_since_last_check, progress.seconds_since_last_frame
            )))
            .await;
        } else if !capture_running {
            self.restart(StreamerError::Process("capture is no longer running".to_string()))
                .await;
        }
    }

    async fn on_watchdog(&mut self) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };

        let timeout = self.context.settings.supervision.watchdog_timeout;
        let snapshot = pipeline.encoder.snapshot();
        let silent_for = snapshot.millis_since_last_frame.unwrap_or(0);
        if silent_for > timeout.as_millis() as u64 {
            self.restart(StreamerError::Stall(format!(
                "no new frames for {}s (frame {})",
                silent_for / 1000,
                snapshot.frame_count
            )))
            .await;
        }
    }

    async fn on_audio_refresh(&mut self) {
        let due = self
            .pipeline
            .as_ref()
            .map(|p| self.context.audio.refresh_if_needed(&p.audio))
            .unwrap_or(false);
        if !due {
            return;
        }

        log::info!("Live audio URL is about to expire, rebuilding pipeline with a fresh one");
        self.set_state(
            StreamerState::Restarting,
            Some("Refreshing live audio source".to_string()),
        );
        self.teardown().await;
        self.total_restarts += 1;
        self.publish_counters();
        if self.shutting_down() {
            return;
        }
        match self.launch().await {
            Ok(()) => self.on_streaming(),
            Err(e) if e.is_config() => self.set_state(StreamerState::Error, Some(e.to_string())),
            Err(e) => self.restart(e).await,
        }
    }

    fn on_stable(&mut self) {
        self.timers.stable_at = None;
        if self.restart_count > 0 {
            log::info!(
                "Streaming stable for {}s, resetting restart counter",
                self.context.settings.supervision.stability_window.as_secs()
            );
        }
        self.restart_count = 0;
        self.publish_counters();
    }

    fn publish_telemetry(&self) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };

        let snapshot = pipeline.encoder.snapshot();
        let stats = pipeline.encoder.stats();
        let rtmp_connected = pipeline.encoder.is_rtmp_connected();
        let scene = pipeline.director.as_ref().map(|d| d.scene()).unwrap_or(self.scene);
        self.update_status(|status| {
            status.frame_count = snapshot.frame_count;
            status.rtmp_connected = rtmp_connected;
            status.stats = stats;
            status.scene = Some(scene);
        });
    }

    fn arm_timers(&mut self) {
        let supervision = &self.context.settings.supervision;
        let live_audio = self
            .pipeline
            .as_ref()
            .map(|p| matches!(p.audio, AudioSource::Live { .. }))
            .unwrap_or(false);

        self.timers = Timers {
            health: Some(timer(supervision.health_check_interval)),
            watchdog: Some(timer(supervision.watchdog_interval)),
            audio_refresh: live_audio.then(|| timer(supervision.audio_refresh_interval)),
            telemetry: Some(timer(TELEMETRY_INTERVAL)),
            stable_at: Some(Instant::now() + supervision.stability_window),
        };
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Build a fresh pipeline: encoder, then capture bound to it, then director
    async fn launch(&mut self) -> Result<(), StreamerError> {
        let destinations = self.context.registry.load();
        if destinations.is_empty() {
            return Err(StreamerError::Config(
                "No enabled RTMP destinations configured".to_string(),
            ));
        }

        let audio = self.context.audio.resolve().await;

        self.generation += 1;
        let events = self.events.for_generation(self.generation);
        let settings = &self.context.settings;
        let launcher = self.context.launcher.clone();
        log::info!(
            "Launching pipeline generation {} ({} destination(s): {})",
            self.generation,
            destinations.len(),
            destinations.names().join(", ")
        );

        let plan = PipelinePlan {
            config: settings.pipeline_config(),
            destinations: destinations.clone(),
            audio: audio.clone(),
        };
        let mut encoder = launcher.start_encoder(plan, events.clone()).await?;

        let capture_config = settings.capture_config(self.scene);
        let capture_mode = capture_config.mode;
        let mut capture = match launcher
            .start_capture(capture_config, encoder.frame_sink(), events.clone())
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                encoder.stop().await;
                return Err(e);
            }
        };

        let mut director = None;
        if settings.director.enabled {
            match capture.page_handle() {
                Some(page) => match launcher.start_director(page, self.scene, events).await {
                    Ok(started) => director = Some(started),
                    Err(e) => log::warn!("Director not started: {e}"),
                },
                None => log::warn!("Director not started: capture exposes no page"),
            }
        }

        if self.shutting_down() {
            log::info!("Shutdown requested during launch, discarding new pipeline");
            if let Some(mut director) = director {
                director.stop().await;
            }
            capture.stop().await;
            encoder.stop().await;
            return Ok(());
        }

        let names = destinations.names();
        let audio_kind = audio.kind();
        let scene = self.scene;
        self.update_status(|status| {
            status.destinations = names;
            status.audio = Some(audio_kind);
            status.capture_mode = Some(capture_mode);
            status.scene = Some(scene);
            status.frame_count = 0;
            status.rtmp_connected = false;
        });

        self.pipeline = Some(Pipeline {
            encoder,
            capture,
            director,
            destinations,
            audio,
        });
        Ok(())
    }

    fn on_streaming(&mut self) {
        if self.pipeline.is_none() {
            return;
        }
        self.arm_timers();
        if let Ok(mut since) = self.shared.streaming_since.lock() {
            *since = Some(Instant::now());
        }
        self.set_state(StreamerState::Streaming, None);
    }

    /// Stop director, capture and encoder, in that order
    async fn teardown(&mut self) {
        self.timers = Timers::default();
        if let Ok(mut since) = self.shared.streaming_since.lock() {
            *since = None;
        }

        if let Some(mut pipeline) = self.pipeline.take() {
            log::info!("Tearing down pipeline generation {}", self.generation);
            if let Some(mut director) = pipeline.director.take() {
                director.stop().await;
            }
            pipeline.capture.stop().await;
            pipeline.encoder.stop().await;
        }

        self.update_status(|status| status.rtmp_connected = false);
    }

    /// Tear down and rebuild until a pipeline is up, a stop arrives, or setup hits a config error
    async fn restart(&mut self, cause: StreamerError) {
        let mut cause = cause;
        loop {
            if self.shutting_down() {
                log::info!("Not restarting during shutdown ({cause})");
                return;
            }

            log::warn!("Restarting pipeline: {cause}");
            self.set_state(StreamerState::Restarting, Some(cause.to_string()));
            self.teardown().await;

            self.restart_count += 1;
            self.total_restarts += 1;
            let supervision = &self.context.settings.supervision;
            let delay = if self.restart_count >= supervision.max_restarts {
                log::warn!(
                    "Reached {} restart attempts, cooling down for {}s",
                    self.restart_count,
                    supervision.restart_cooldown.as_secs()
                );
                self.restart_count = 0;
                supervision.restart_cooldown
            } else {
                supervision.restart_delay
            };
            self.publish_counters();

            if !self.wait_before_restart(delay).await || self.shutting_down() {
                return;
            }

            match self.launch().await {
                Ok(()) => {
                    self.on_streaming();
                    return;
                }
                Err(e) if e.is_config() => {
                    log::error!("Restart aborted: {e}");
                    self.set_state(StreamerState::Error, Some(e.to_string()));
                    return;
                }
                Err(e) => cause = e,
            }
        }
    }

    /// Sleep out the restart delay while still answering commands. False when stopped.
    async fn wait_before_restart(&mut self, delay: Duration) -> bool {
        let until = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(until) => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        log::info!("Stop requested during restart delay");
                        self.shared.shutting_down.store(true, Ordering::SeqCst);
                        self.set_state(StreamerState::Stopped, None);
                        let _ = reply.send(Ok(()));
                        return false;
                    }
                    Some(Command::Start(reply)) => {
                        let _ = reply.send(Err(StreamerError::AlreadyRunning));
                    }
                    Some(Command::ForceScene(_, reply)) => {
                        let _ = reply.send(Err(StreamerError::NoDirector));
                    }
                    None => return false,
                },
            }
        }
    }
}
