//! Tracks media playback across browsing contexts and mirrors the "now
//! playing" state to views and to a device on a serial line.

pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod metadata;
pub mod observer;
pub mod relay;
pub mod serial;
pub mod state;
pub mod stdio;
pub mod tty;
pub mod types;

pub use error::{BridgeError, HostError, MetadataError};
pub use host::{Host, HostEvent, MetadataExtractor};
pub use lifecycle::{LifecycleController, LifecycleSettings, Phase};
pub use observer::ViewObserver;
pub use relay::{AgentCommand, RelayMessage};
pub use serial::{SerialBridge, Snapshot};
pub use state::SourceRegistry;
pub use types::{MediaState, Source, SourceId, SourceMetadata, WindowId};
