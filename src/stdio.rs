use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::HostError;
use crate::host::{Host, HostEvent};
use crate::lifecycle::LifecycleController;
use crate::observer::ViewObserver;
use crate::relay::{AgentCommand, RelayMessage};
use crate::serial::{LinkStatus, PortFilter, PortInfo};
use crate::types::{
    ContextInfo, LoadStatus, MediaCommand, PlaybackControl, Source, SourceId, WindowId,
};

/// One line read from the host process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inbound {
    /// Everything the host knows about a context. Must precede lifecycle
    /// events for that context.
    Context { context: ContextInfo },
    /// Initial contexts have been sent.
    Ready,
    Audible { id: SourceId, audible: bool },
    Navigated {
        id: SourceId,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        status: Option<LoadStatus>,
    },
    Title { id: SourceId, title: String },
    Discarded { id: SourceId },
    Removed { id: SourceId },
    Message { id: SourceId, message: RelayMessage },
    List,
    Dismiss { id: SourceId },
    Control { id: SourceId, control: PlaybackControl },
    Focus { id: SourceId },
    Close { id: SourceId },
    SerialRequest {
        #[serde(default)]
        filters: Vec<PortFilter>,
    },
    SerialConnect { index: usize },
    SerialDisconnect,
    SerialQuery,
}

impl Inbound {
    fn into_event(self) -> Option<HostEvent> {
        Some(match self {
            Inbound::Audible { id, audible } => HostEvent::AudibleChanged { id, audible },
            Inbound::Navigated { id, .. } => HostEvent::Navigated { id },
            Inbound::Title { id, title } => HostEvent::TitleChanged { id, title },
            Inbound::Discarded { id } => HostEvent::Discarded { id },
            Inbound::Removed { id } => HostEvent::Removed { id },
            Inbound::Message { id, message } => HostEvent::Message { id, message },
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewOp {
    Add,
    Del,
    Update,
}

/// One line written to the host process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    InjectAgent { id: SourceId },
    InjectObserver { id: SourceId },
    Relay { id: SourceId, message: AgentCommand },
    Badge { count: Option<usize> },
    EntryPoint { enabled: bool },
    Media { id: SourceId, media: MediaCommand },
    Focus { id: SourceId, window: WindowId },
    Close { id: SourceId },
    View {
        op: ViewOp,
        id: SourceId,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<Source>,
    },
    Sources { sources: Vec<Source> },
    SerialState { connected: bool, info: Option<PortInfo> },
    Error { message: String },
}

impl From<LinkStatus> for HostCommand {
    fn from(status: LinkStatus) -> Self {
        HostCommand::SerialState {
            connected: status.connected,
            info: status.info,
        }
    }
}

/// A host reached over newline-delimited JSON, typically the stdin/stdout of
/// this process. Context state is mirrored from the lines the host sends, so
/// lookups never wait on the other side.
pub struct StdioHost {
    contexts: RwLock<HashMap<SourceId, ContextInfo>>,
    outbound: mpsc::UnboundedSender<HostCommand>,
}

impl StdioHost {
    /// Start writing commands to `writer`. The writer task ends once every
    /// handle to the host is dropped.
    pub fn new<W>(writer: W) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_lines(writer, receiver));
        let host = Arc::new(Self {
            contexts: RwLock::new(HashMap::new()),
            outbound,
        });
        (host, task)
    }

    pub fn emit(&self, command: HostCommand) -> Result<(), HostError> {
        self.outbound
            .send(command)
            .map_err(|_| HostError::Disconnected)
    }

    /// Keep the context mirror in step with an inbound line.
    pub fn observe(&self, inbound: &Inbound) {
        let mut contexts = self.contexts.write();
        match inbound {
            Inbound::Context { context } => {
                contexts.insert(context.id, context.clone());
            }
            Inbound::Audible { id, audible } => {
                if let Some(context) = contexts.get_mut(id) {
                    context.audible = *audible;
                }
            }
            Inbound::Navigated { id, url, status } => {
                if let Some(context) = contexts.get_mut(id) {
                    if url.is_some() {
                        context.url = url.clone();
                    }
                    if let Some(status) = status {
                        context.status = *status;
                    }
                    context.discarded = false;
                }
            }
            Inbound::Title { id, title } => {
                if let Some(context) = contexts.get_mut(id) {
                    context.title = title.clone();
                }
            }
            Inbound::Discarded { id } => {
                if let Some(context) = contexts.get_mut(id) {
                    context.discarded = true;
                    context.audible = false;
                }
            }
            Inbound::Removed { id } => {
                contexts.remove(id);
            }
            _ => {}
        }
    }
}

async fn write_lines<W>(mut writer: W, mut commands: mpsc::UnboundedReceiver<HostCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        let mut line = match serde_json::to_vec(&command) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to encode host command {:?}: {}", command, e);
                continue;
            }
        };
        line.push(b'\n');

        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::error!("Host output closed: {}", e);
            break;
        }
    }
    log::debug!("Host writer stopped");
}

#[async_trait]
impl Host for StdioHost {
    async fn audible_contexts(&self) -> Result<Vec<ContextInfo>, HostError> {
        let contexts = self.contexts.read();
        Ok(contexts
            .values()
            .filter(|c| c.audible && !c.discarded)
            .cloned()
            .collect())
    }

    async fn context(&self, id: SourceId) -> Result<Option<ContextInfo>, HostError> {
        Ok(self.contexts.read().get(&id).cloned())
    }

    async fn inject_agent(&self, id: SourceId) -> Result<(), HostError> {
        self.emit(HostCommand::InjectAgent { id })
    }

    async fn inject_observer(&self, id: SourceId) -> Result<(), HostError> {
        self.emit(HostCommand::InjectObserver { id })
    }

    async fn send_to_agent(&self, id: SourceId, message: AgentCommand) -> Result<(), HostError> {
        self.emit(HostCommand::Relay { id, message })
    }

    async fn set_badge(&self, count: Option<usize>) -> Result<(), HostError> {
        self.emit(HostCommand::Badge { count })
    }

    async fn set_entry_point_enabled(&self, enabled: bool) -> Result<(), HostError> {
        self.emit(HostCommand::EntryPoint { enabled })
    }

    async fn run_media_command(&self, id: SourceId, media: MediaCommand) -> Result<(), HostError> {
        self.emit(HostCommand::Media { id, media })
    }

    async fn focus(&self, id: SourceId, window: WindowId) -> Result<(), HostError> {
        self.emit(HostCommand::Focus { id, window })
    }

    async fn close_context(&self, id: SourceId) -> Result<(), HostError> {
        self.emit(HostCommand::Close { id })
    }
}

impl ViewObserver for StdioHost {
    fn add(&self, source: &Source) {
        self.view(ViewOp::Add, source.id, Some(source.clone()));
    }

    fn del(&self, id: SourceId) {
        self.view(ViewOp::Del, id, None);
    }

    fn update(&self, source: &Source) {
        self.view(ViewOp::Update, source.id, Some(source.clone()));
    }
}

impl StdioHost {
    fn view(&self, op: ViewOp, id: SourceId, source: Option<Source>) {
        if let Err(e) = self.emit(HostCommand::View { op, id, source }) {
            log::debug!("View notification for source {} lost: {}", id, e);
        }
    }
}

/// Read inbound lines until the host closes its end.
pub async fn run<R>(reader: R, host: Arc<StdioHost>, controller: Arc<LifecycleController>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from host")?
    {
        if line.trim().is_empty() {
            continue;
        }
        log::trace!("Host line: {}", line);

        match serde_json::from_str::<Inbound>(&line) {
            Ok(inbound) => dispatch(&host, &controller, inbound).await,
            Err(e) => log::error!("Failed to parse host line: {} - {}", e, line),
        }
    }

    log::info!("Host input closed");
    Ok(())
}

pub async fn dispatch(host: &StdioHost, controller: &Arc<LifecycleController>, inbound: Inbound) {
    host.observe(&inbound);

    let reply = match inbound {
        Inbound::Context { .. } => None,
        Inbound::Ready => {
            controller.start().await;
            None
        }
        Inbound::List => Some(HostCommand::Sources {
            sources: controller.sources(),
        }),
        Inbound::Dismiss { id } => {
            controller.dismiss(id).await;
            None
        }
        Inbound::Control { id, control } => match controller.control(id, control).await {
            Ok(true) => None,
            Ok(false) => {
                log::debug!("Source {} cannot be controlled yet", id);
                None
            }
            Err(e) => Some(error_reply(format!("control of source {} failed: {}", id, e))),
        },
        Inbound::Focus { id } => match controller.focus(id).await {
            Ok(_) => None,
            Err(e) => Some(error_reply(format!("focus of source {} failed: {}", id, e))),
        },
        Inbound::Close { id } => match controller.close(id).await {
            Ok(()) => None,
            Err(e) => Some(error_reply(format!("closing source {} failed: {}", id, e))),
        },
        Inbound::SerialRequest { filters } => Some(serial_reply(
            controller.serial_request(&filters).await,
            controller,
        )),
        Inbound::SerialConnect { index } => Some(serial_reply(
            controller.serial_connect(index).await,
            controller,
        )),
        Inbound::SerialDisconnect => Some(controller.serial_disconnect().await.into()),
        Inbound::SerialQuery => Some(controller.serial_status().into()),
        event => {
            if let Some(event) = event.into_event() {
                controller.handle_event(event).await;
            }
            None
        }
    };

    if let Some(reply) = reply {
        if let Err(e) = host.emit(reply) {
            log::warn!("Could not reply to host: {}", e);
        }
    }
}

fn error_reply(message: String) -> HostCommand {
    log::warn!("{}", message);
    HostCommand::Error { message }
}

fn serial_reply(
    result: Result<LinkStatus, crate::error::BridgeError>,
    controller: &LifecycleController,
) -> HostCommand {
    match result {
        Ok(status) => status.into(),
        Err(e) => {
            log::error!("Serial connection failed: {}", e);
            controller.serial_status().into()
        }
    }
}
