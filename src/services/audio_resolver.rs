// Audio Source Resolver
// Picks the audio track for each pipeline run: live stream, looping file, or silence

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;

use crate::models::{AudioSettings, AudioSource};

/// Resolves a page URL into a directly playable (and expiring) audio URL
#[async_trait]
pub trait LiveAudioProvider: Send + Sync {
    async fn fetch(&self, page_url: &str) -> Result<String, String>;
}

/// Live provider backed by the yt-dlp CLI
pub struct YtDlpProvider {
    binary: PathBuf,
}

impl YtDlpProvider {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Use an explicit path, else look for `yt-dlp` on PATH
    pub fn discover(explicit: Option<&Path>) -> Option<Self> {
        if let Some(path) = explicit {
            return Some(Self::new(path.to_path_buf()));
        }
        which::which("yt-dlp").ok().map(Self::new)
    }
}

#[async_trait]
impl LiveAudioProvider for YtDlpProvider {
    async fn fetch(&self, page_url: &str) -> Result<String, String> {
        let output = Command::new(&self.binary)
            .args(["-g", "-f", "bestaudio", "--no-playlist", "--no-warnings", page_url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to run yt-dlp: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("http"))
            .map(str::to_string)
            .ok_or_else(|| "yt-dlp returned no stream URL".to_string())
    }
}

/// Produces the `AudioSource` for each pipeline start. Never fails: problems degrade.
pub struct AudioResolver {
    settings: AudioSettings,
    provider: Option<Arc<dyn LiveAudioProvider>>,
}

impl AudioResolver {
    pub fn new(settings: AudioSettings, provider: Option<Arc<dyn LiveAudioProvider>>) -> Self {
        Self { settings, provider }
    }

    pub async fn resolve(&self) -> AudioSource {
        if self.settings.disabled {
            log::info!("Audio disabled, using silent track");
            return AudioSource::Silent;
        }

        if let Some(page_url) = self.settings.source_url.as_deref() {
            match self.fetch_live(page_url).await {
                Ok(url) => {
                    log::info!(
                        "Resolved live audio (refresh in {}s)",
                        self.settings.ttl.saturating_sub(self.settings.refresh_margin).as_secs()
                    );
                    return AudioSource::Live {
                        url,
                        resolved_at: Instant::now(),
                        ttl: self.settings.ttl,
                    };
                }
                Err(e) => log::warn!("Live audio unavailable: {e}"),
            }
        }

        self.fallback().await
    }

    /// True when `current` should be replaced before it expires
    pub fn refresh_if_needed(&self, current: &AudioSource) -> bool {
        current.needs_refresh(Instant::now(), self.settings.refresh_margin)
    }

    async fn fetch_live(&self, page_url: &str) -> Result<String, String> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| "no live audio provider installed".to_string())?;

        match tokio::time::timeout(self.settings.resolve_timeout, provider.fetch(page_url)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "provider timed out after {}s",
                self.settings.resolve_timeout.as_secs()
            )),
        }
    }

    async fn fallback(&self) -> AudioSource {
        if let Some(path) = self.settings.fallback_file.as_ref() {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                log::info!("Using looping audio file {}", path.display());
                return AudioSource::LocalLoop(path.clone());
            }
            log::warn!("Fallback audio file {} not found", path.display());
        }

        log::info!("Using silent audio track");
        AudioSource::Silent
    }
}

/// Default TTL applied to live URLs
pub const DEFAULT_AUDIO_TTL: Duration = Duration::from_secs(4 * 60 * 60);
