use serde::{Deserialize, Serialize};

use crate::state::SourceRegistry;
use crate::types::{MediaState, Source, SourceId};

/// Messages sent by the content agent running inside a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Handshake carrying the first media snapshot.
    #[serde(alias = "@hook")]
    Hook { media: MediaState },
    Play,
    Pause,
    /// `volume` is null when the element is muted.
    VolumeChange {
        #[serde(default)]
        volume: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

/// Messages sent by the controller to the content agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentCommand {
    /// Detach listeners and drop the media handle. Idempotent on the agent side.
    Unhook,
}

/// Result of applying one agent message to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The source changed; views must be told.
    Updated {
        source: Source,
        /// The handshake completed and the observer script should follow.
        handshake: bool,
    },
    /// No registry entry for the sender. Unregistration raced ahead of an
    /// in-flight message.
    Stale,
    /// A delta arrived before the handshake.
    NotHooked,
    Ignored,
}

pub fn apply(registry: &SourceRegistry, id: SourceId, message: &RelayMessage) -> Applied {
    if matches!(message, RelayMessage::Unknown) {
        return Applied::Ignored;
    }

    let mut hooked = true;
    let updated = registry.update(id, |source| match message {
        RelayMessage::Hook { media } => {
            source.media = Some(media.clone());
        }
        RelayMessage::Play | RelayMessage::Pause | RelayMessage::VolumeChange { .. } => {
            let Some(media) = source.media.as_mut() else {
                hooked = false;
                return;
            };
            match message {
                RelayMessage::Play => media.paused = false,
                RelayMessage::Pause => media.paused = true,
                RelayMessage::VolumeChange { volume } => media.muted = volume.is_none(),
                _ => {}
            }
        }
        RelayMessage::Unknown => {}
    });

    match updated {
        None => Applied::Stale,
        Some(_) if !hooked => Applied::NotHooked,
        Some(source) => Applied::Updated {
            source,
            handshake: matches!(message, RelayMessage::Hook { .. }),
        },
    }
}
