// Streamer State Model
// Broadcast lifecycle state and the status snapshot served over HTTP

use serde::{Deserialize, Serialize};

use crate::models::{AudioKind, CaptureModeKind, StreamStats};

/// Lifecycle of the broadcast. The single source of truth for "is it live".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamerState {
    #[default]
    Stopped,
    Starting,
    Streaming,
    Restarting,
    Error,
}

impl StreamerState {
    /// Any state in which the orchestrator owns live components
    /// or is about to build them.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamerState::Starting | StreamerState::Streaming | StreamerState::Restarting
        )
    }
}

/// Which target page is currently shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scene {
    /// Status view, shown while the control plane is doing work
    #[default]
    Primary,
    /// Idle/ambient view
    Secondary,
}

impl Scene {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Scene::Primary),
            "secondary" => Some(Scene::Secondary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scene::Primary => "primary",
            Scene::Secondary => "secondary",
        }
    }
}

/// Everything `/health` reports
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatus {
    pub state: StreamerState,
    pub scene: Option<Scene>,
    pub frame_count: u64,
    pub rtmp_connected: bool,
    /// Seconds since the current pipeline reached `streaming`
    pub uptime_secs: u64,
    /// Attempts in the current restart burst
    pub restart_count: u32,
    /// Restarts since the process started
    pub total_restarts: u64,
    pub destinations: Vec<String>,
    pub last_error: Option<String>,
    pub audio: Option<AudioKind>,
    pub capture_mode: Option<CaptureModeKind>,
    pub stats: StreamStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_parse() {
        assert_eq!(Scene::parse("Primary"), Some(Scene::Primary));
        assert_eq!(Scene::parse(" secondary "), Some(Scene::Secondary));
        assert_eq!(Scene::parse("tertiary"), None);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&StreamerState::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
        assert!(StreamerState::Restarting.is_active());
        assert!(!StreamerState::Error.is_active());
    }
}
