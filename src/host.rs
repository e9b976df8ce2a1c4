use async_trait::async_trait;

use crate::error::{HostError, MetadataError};
use crate::relay::{AgentCommand, RelayMessage};
use crate::types::{ContextInfo, MediaCommand, SourceId, SourceMetadata, WindowId};

/// The platform hosting the browsing contexts.
///
/// Every call returns a `Result`; the controller handles both branches at each
/// call site, usually by logging and moving on.
#[async_trait]
pub trait Host: Send + Sync {
    /// Contexts that are audible and finished loading.
    async fn audible_contexts(&self) -> Result<Vec<ContextInfo>, HostError>;

    /// Current state of one context, `None` once it is gone.
    async fn context(&self, id: SourceId) -> Result<Option<ContextInfo>, HostError>;

    /// Inject the content agent that observes the context's media element.
    async fn inject_agent(&self, id: SourceId) -> Result<(), HostError>;

    /// Inject the secondary observer script once the agent has shaken hands.
    async fn inject_observer(&self, id: SourceId) -> Result<(), HostError>;

    async fn send_to_agent(&self, id: SourceId, command: AgentCommand) -> Result<(), HostError>;

    /// `None` clears the badge.
    async fn set_badge(&self, count: Option<usize>) -> Result<(), HostError>;

    async fn set_entry_point_enabled(&self, enabled: bool) -> Result<(), HostError>;

    async fn run_media_command(&self, id: SourceId, command: MediaCommand) -> Result<(), HostError>;

    async fn focus(&self, id: SourceId, window: WindowId) -> Result<(), HostError>;

    async fn close_context(&self, id: SourceId) -> Result<(), HostError>;
}

/// Produces the static description of a source when it becomes active.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn describe(&self, context: &ContextInfo) -> Result<SourceMetadata, MetadataError>;
}

/// Lifecycle-relevant notifications from the host, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    AudibleChanged { id: SourceId, audible: bool },
    /// URL or load status changed.
    Navigated { id: SourceId },
    TitleChanged { id: SourceId, title: String },
    Discarded { id: SourceId },
    Removed { id: SourceId },
    Message { id: SourceId, message: RelayMessage },
}

impl HostEvent {
    pub fn id(&self) -> SourceId {
        match self {
            HostEvent::AudibleChanged { id, .. }
            | HostEvent::Navigated { id }
            | HostEvent::TitleChanged { id, .. }
            | HostEvent::Discarded { id }
            | HostEvent::Removed { id }
            | HostEvent::Message { id, .. } => *id,
        }
    }
}
