use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle of a tracked browsing context. Stable for the context's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of the window that contains a source, used to focus it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

/// Dominant color of a source's artwork as `[r, g, b, a]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccentColor(pub [u8; 4]);

/// Static description of a source, captured once at registration.
/// Only `title` changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: String,
    pub hostname: String,
    pub favicon_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub accent_color: Option<AccentColor>,
}

/// Playback state reported by the agent running inside a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub paused: bool,
    pub muted: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: SourceId,
    pub window: WindowId,
    pub url: Option<String>,
    pub metadata: SourceMetadata,
    /// `None` until the agent's handshake arrives.
    pub media: Option<MediaState>,
}

impl Source {
    pub fn is_playing(&self) -> bool {
        matches!(&self.media, Some(media) if !media.paused)
    }
}

/// Load status of a context as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loading,
    #[default]
    Complete,
}

/// What the host currently knows about a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub id: SourceId,
    pub window: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon_url: Option<String>,
    /// Artwork advertised by the page itself (e.g. `og:image`).
    #[serde(default)]
    pub page_image: Option<String>,
    #[serde(default)]
    pub accent_color: Option<AccentColor>,
    #[serde(default)]
    pub audible: bool,
    #[serde(default)]
    pub discarded: bool,
    #[serde(default)]
    pub status: LoadStatus,
}

/// Playback actions a view can ask a source to perform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MediaCommand {
    Play,
    Pause,
    Seek { seconds: f64 },
    ToggleMute,
}

/// A control as requested by the user, before it is resolved against the
/// source's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackControl {
    PlayPause,
    SeekBackward,
    SeekForward,
    ToggleMute,
}

pub const SEEK_STEP_SECS: f64 = 5.0;

impl PlaybackControl {
    pub fn resolve(self, media: &MediaState) -> MediaCommand {
        match self {
            PlaybackControl::PlayPause if media.paused => MediaCommand::Play,
            PlaybackControl::PlayPause => MediaCommand::Pause,
            PlaybackControl::SeekBackward => MediaCommand::Seek {
                seconds: -SEEK_STEP_SECS,
            },
            PlaybackControl::SeekForward => MediaCommand::Seek {
                seconds: SEEK_STEP_SECS,
            },
            PlaybackControl::ToggleMute => MediaCommand::ToggleMute,
        }
    }
}
