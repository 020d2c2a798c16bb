// Destination Registry
// Loads RTMP destinations from configuration and normalizes their URLs

use crate::models::{parse_bool, Destination, DestinationSet};

/// Platform-specific configuration
#[derive(Debug, Clone, Copy)]
pub struct PlatformConfig {
    /// Destination name and env var infix (`RTMP_<PREFIX>_URL`)
    pub prefix: &'static str,

    /// Display name
    pub name: &'static str,

    /// App path the ingest expects (e.g. "app", "live2", "rtmp")
    pub default_app_path: Option<&'static str>,
}

/// Known platforms, in output order
pub const PLATFORMS: &[PlatformConfig] = &[
    PlatformConfig { prefix: "YOUTUBE", name: "youtube", default_app_path: Some("live2") },
    PlatformConfig { prefix: "TWITCH", name: "twitch", default_app_path: Some("app") },
    PlatformConfig { prefix: "KICK", name: "kick", default_app_path: Some("app") },
    PlatformConfig { prefix: "FACEBOOK", name: "facebook", default_app_path: Some("rtmp") },
    PlatformConfig { prefix: "X", name: "x", default_app_path: None },
    PlatformConfig { prefix: "CUSTOM", name: "custom", default_app_path: None },
];

impl PlatformConfig {
    /// Ensure a scheme, drop trailing slashes and add the app path when the URL has none
    pub fn normalize_url(&self, url: &str) -> String {
        let url = normalize_rtmp_url(url);

        let Some(app_path) = self.default_app_path else {
            return url;
        };

        let Some((scheme, rest)) = url.split_once("://") else {
            return url;
        };

        match rest.split_once('/') {
            None => format!("{scheme}://{rest}/{app_path}"),
            Some((host, "")) => format!("{scheme}://{host}/{app_path}"),
            Some(_) => url,
        }
    }
}

/// Trim, strip trailing slashes and add `rtmp://` (or `rtmps://` for port 443) when no scheme is given
pub fn normalize_rtmp_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    while url.ends_with('/') {
        url.pop();
    }

    if !url.contains("://") {
        if url.contains(":443") {
            url = format!("rtmps://{url}");
        } else {
            url = format!("rtmp://{url}");
        }
    }

    url
}

/// Resolve a stream key, following `${ENV_VAR}` indirection through `lookup`
pub fn resolve_stream_key(key: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let key = key.trim();
    if key.starts_with("${") && key.ends_with('}') && key.len() > 3 {
        let var_name = &key[2..key.len() - 1];
        match lookup(var_name) {
            Some(value) => {
                // Do not log the variable name
                log::debug!("Resolved stream key from environment variable");
                value.trim().to_string()
            }
            None => {
                log::warn!("Environment variable not found for stream key, check your configuration");
                String::new()
            }
        }
    } else {
        key.to_string()
    }
}

/// Reads destinations from a key lookup (the process environment in production)
pub struct DestinationRegistry {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl DestinationRegistry {
    pub fn from_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Load the current destination set. Read on every call so restarts pick up changes.
    pub fn load(&self) -> DestinationSet {
        let lookup = |key: &str| (self.lookup)(key);
        let mut destinations = Vec::new();

        for platform in PLATFORMS {
            let url = lookup(&format!("RTMP_{}_URL", platform.prefix)).unwrap_or_default();
            let raw_key = lookup(&format!("RTMP_{}_KEY", platform.prefix)).unwrap_or_default();
            let enabled = lookup(&format!("RTMP_{}_ENABLED", platform.prefix))
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true);

            if url.trim().is_empty() || raw_key.trim().is_empty() {
                continue;
            }

            let key = resolve_stream_key(&raw_key, &lookup);
            match Destination::new(platform.name, &platform.normalize_url(&url), &key) {
                Some(mut destination) => {
                    destination.enabled = enabled;
                    if enabled {
                        log::info!(
                            "Destination {}: {}",
                            platform.name,
                            destination.redacted_url()
                        );
                    } else {
                        log::info!("Destination {} disabled", platform.name);
                    }
                    destinations.push(destination);
                }
                None => {
                    log::warn!("Destination {} skipped: empty stream key", platform.name);
                }
            }
        }

        DestinationSet::new(destinations)
    }
}
