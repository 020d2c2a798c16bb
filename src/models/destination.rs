// Destination Model
// RTMP destinations and the tee muxer descriptor derived from them

use serde::Serialize;

/// Tee muxer slave options applied to every destination.
/// `onfail=ignore` keeps the other outputs alive when one destination drops.
pub const TEE_SEGMENT_OPTIONS: &str = "[f=flv:onfail=ignore]";

/// Separator understood by FFmpeg's tee muxer
pub const TEE_SEPARATOR: &str = "|";

/// A single RTMP destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Platform name (identity)
    pub name: String,

    /// RTMP ingest base URL
    #[serde(skip_serializing)]
    pub url: String,

    /// Stream key
    #[serde(skip_serializing)]
    pub key: String,

    pub enabled: bool,
}

impl Destination {
    /// Build a destination, returning None unless both url and key are present
    pub fn new(name: impl Into<String>, url: &str, key: &str) -> Option<Self> {
        let url = url.trim();
        let key = key.trim();
        if url.is_empty() || key.is_empty() {
            return None;
        }

        Some(Self {
            name: name.into(),
            url: url.to_string(),
            key: key.to_string(),
            enabled: true,
        })
    }

    /// Full publish URL: base URL joined with the stream key
    pub fn target_url(&self) -> String {
        if self.url.ends_with('/') {
            format!("{}{}", self.url, self.key)
        } else {
            format!("{}/{}", self.url, self.key)
        }
    }

    /// Publish URL with the stream key masked, for logs and API output
    pub fn redacted_url(&self) -> String {
        if self.url.ends_with('/') {
            format!("{}***", self.url)
        } else {
            format!("{}/***", self.url)
        }
    }
}

/// Ordered set of enabled destinations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSet {
    destinations: Vec<Destination>,
}

impl DestinationSet {
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self {
            destinations: destinations.into_iter().filter(|d| d.enabled).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.name.clone()).collect()
    }

    /// The only destination, when exactly one is enabled.
    /// Callers write straight to it instead of going through a one-slave tee.
    pub fn single(&self) -> Option<&Destination> {
        match self.destinations.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Tee muxer descriptor, recomputed from the current set on every call
    pub fn muxer_descriptor(&self) -> String {
        self.destinations
            .iter()
            .map(|d| format!("{TEE_SEGMENT_OPTIONS}{}", d.target_url()))
            .collect::<Vec<_>>()
            .join(TEE_SEPARATOR)
    }

    /// Same shape as `muxer_descriptor` with every stream key masked
    pub fn redacted_descriptor(&self) -> String {
        self.destinations
            .iter()
            .map(|d| format!("{TEE_SEGMENT_OPTIONS}{}", d.redacted_url()))
            .collect::<Vec<_>>()
            .join(TEE_SEPARATOR)
    }

    /// Mask every stream key of this set that appears as a whole path segment in `text`
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for destination in &self.destinations {
            out = mask_segment(&out, &destination.key);
        }
        out
    }
}

/// Replace `/{key}` with `/***` where the key is not the prefix of a longer segment
fn mask_segment(text: &str, key: &str) -> String {
    let needle = format!("/{key}");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(&needle) {
        let end = pos + needle.len();
        let continues = rest[end..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        out.push_str(&rest[..pos]);
        out.push_str(if continues { &needle } else { "/***" });
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(name: &str, url: &str, key: &str) -> Destination {
        Destination::new(name, url, key).unwrap()
    }

    #[test]
    fn test_missing_url_or_key_is_omitted() {
        assert!(Destination::new("twitch", "", "abc").is_none());
        assert!(Destination::new("twitch", "rtmp://live.twitch.tv/app", "  ").is_none());
        assert!(Destination::new("twitch", "rtmp://live.twitch.tv/app", "abc").is_some());
    }

    #[test]
    fn test_target_url_joins_with_single_slash() {
        assert_eq!(
            dest("a", "rtmp://host/app/", "k1").target_url(),
            "rtmp://host/app/k1"
        );
        assert_eq!(
            dest("a", "rtmp://host/app", "k1").target_url(),
            "rtmp://host/app/k1"
        );
    }

    #[test]
    fn test_descriptor_has_one_tagged_segment_per_destination() {
        let set = DestinationSet::new(vec![
            dest("youtube", "rtmp://a.rtmp.youtube.com/live2/", "yt-key"),
            dest("twitch", "rtmp://live.twitch.tv/app/", "tw-key"),
            dest("kick", "rtmps://fa723fc1b171.global-contribute.live-video.net/app/", "kk-key"),
        ]);

        let descriptor = set.muxer_descriptor();
        let segments: Vec<&str> = descriptor.split(TEE_SEPARATOR).collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(descriptor.matches("onfail=ignore").count(), 3);
        assert_eq!(
            segments[0],
            "[f=flv:onfail=ignore]rtmp://a.rtmp.youtube.com/live2/yt-key"
        );
        assert_eq!(segments[1], "[f=flv:onfail=ignore]rtmp://live.twitch.tv/app/tw-key");
        assert!(segments[2].ends_with("/app/kk-key"));
    }

    #[test]
    fn test_single_destination() {
        let one = DestinationSet::new(vec![dest("twitch", "rtmp://live.twitch.tv/app", "k")]);
        assert_eq!(one.single().map(|d| d.name.as_str()), Some("twitch"));

        let two = DestinationSet::new(vec![
            dest("twitch", "rtmp://live.twitch.tv/app", "k"),
            dest("youtube", "rtmp://a.rtmp.youtube.com/live2", "y"),
        ]);
        assert!(two.single().is_none());
    }

    #[test]
    fn test_disabled_destinations_are_not_in_set() {
        let mut off = dest("kick", "rtmp://kick/app", "k");
        off.enabled = false;
        let set = DestinationSet::new(vec![off, dest("twitch", "rtmp://tw/app", "t")]);
        assert_eq!(set.names(), vec!["twitch".to_string()]);
        assert!(!set.muxer_descriptor().contains("kick"));
    }

    #[test]
    fn test_redaction_masks_keys() {
        let set = DestinationSet::new(vec![
            dest("youtube", "rtmp://yt/live2", "secret-1"),
            dest("twitch", "rtmp://tw/app", "secret-2"),
        ]);
        let redacted = set.redacted_descriptor();
        assert!(!redacted.contains("secret"));
        assert_eq!(redacted.matches("***").count(), 2);

        let line = "[tee @ 0x1] Slave 'rtmp://tw/app/secret-2': error";
        assert_eq!(set.redact(line), "[tee @ 0x1] Slave 'rtmp://tw/app/***': error");
    }

    #[test]
    fn test_short_key_only_masks_its_own_segment() {
        let set = DestinationSet::new(vec![dest("kick", "rtmp://ingest.kick.com/app", "k")]);
        let line = "Opening rtmp://ingest.kick.com/app/k for kick, keyframe interval 2";
        assert_eq!(
            set.redact(line),
            "Opening rtmp://ingest.kick.com/app/*** for kick, keyframe interval 2"
        );
        assert_eq!(set.redact("/kick/k"), "/kick/***");
        assert_eq!(set.redact("no keys here"), "no keys here");
    }
}
