#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mcx_bridge::host::{Host, MetadataExtractor};
use mcx_bridge::metadata::BasicExtractor;
use mcx_bridge::serial::{PortFilter, PortInfo, PortOptions, PortPicker, PortWriter, SerialPort};
use mcx_bridge::types::{ContextInfo, MediaCommand};
use mcx_bridge::{
    AgentCommand, BridgeError, HostError, LifecycleController, LifecycleSettings, MetadataError,
    SerialBridge, Source, SourceId, SourceMetadata, ViewObserver, WindowId,
};

pub const GRACE: Duration = Duration::from_millis(4500);

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    InjectAgent(SourceId),
    InjectObserver(SourceId),
    Unhook(SourceId),
    Media(SourceId, MediaCommand),
    Focus(SourceId, WindowId),
    Close(SourceId),
}

/// In-memory host: contexts are set by the test, calls are recorded.
#[derive(Default)]
pub struct FakeHost {
    contexts: Mutex<HashMap<SourceId, ContextInfo>>,
    calls: Mutex<Vec<Call>>,
    badge: Mutex<Option<usize>>,
    entry_enabled: Mutex<bool>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_context(&self, id: i64, audible: bool) {
        let context = ContextInfo {
            id: SourceId(id),
            window: WindowId(100),
            url: Some(format!("https://site{}.example/watch", id)),
            title: format!("Page {}", id),
            favicon_url: None,
            page_image: None,
            accent_color: None,
            audible,
            discarded: false,
            status: Default::default(),
        };
        self.contexts.lock().insert(SourceId(id), context);
    }

    pub fn set_audible(&self, id: i64, audible: bool) {
        if let Some(context) = self.contexts.lock().get_mut(&SourceId(id)) {
            context.audible = audible;
        }
    }

    pub fn set_title(&self, id: i64, title: &str) {
        if let Some(context) = self.contexts.lock().get_mut(&SourceId(id)) {
            context.title = title.to_string();
        }
    }

    pub fn remove_context(&self, id: i64) {
        self.contexts.lock().remove(&SourceId(id));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn badge(&self) -> Option<usize> {
        *self.badge.lock()
    }

    pub fn entry_enabled(&self) -> bool {
        *self.entry_enabled.lock()
    }

    fn record(&self, call: Call) -> Result<(), HostError> {
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn audible_contexts(&self) -> Result<Vec<ContextInfo>, HostError> {
        Ok(self
            .contexts
            .lock()
            .values()
            .filter(|c| c.audible)
            .cloned()
            .collect())
    }

    async fn context(&self, id: SourceId) -> Result<Option<ContextInfo>, HostError> {
        Ok(self.contexts.lock().get(&id).cloned())
    }

    async fn inject_agent(&self, id: SourceId) -> Result<(), HostError> {
        self.record(Call::InjectAgent(id))
    }

    async fn inject_observer(&self, id: SourceId) -> Result<(), HostError> {
        self.record(Call::InjectObserver(id))
    }

    async fn send_to_agent(&self, id: SourceId, command: AgentCommand) -> Result<(), HostError> {
        match command {
            AgentCommand::Unhook => self.record(Call::Unhook(id)),
        }
    }

    async fn set_badge(&self, count: Option<usize>) -> Result<(), HostError> {
        *self.badge.lock() = count;
        Ok(())
    }

    async fn set_entry_point_enabled(&self, enabled: bool) -> Result<(), HostError> {
        *self.entry_enabled.lock() = enabled;
        Ok(())
    }

    async fn run_media_command(&self, id: SourceId, command: MediaCommand) -> Result<(), HostError> {
        self.record(Call::Media(id, command))
    }

    async fn focus(&self, id: SourceId, window: WindowId) -> Result<(), HostError> {
        self.record(Call::Focus(id, window))
    }

    async fn close_context(&self, id: SourceId) -> Result<(), HostError> {
        self.record(Call::Close(id))
    }
}

/// Extractor that never answers.
pub struct HangingExtractor;

#[async_trait]
impl MetadataExtractor for HangingExtractor {
    async fn describe(&self, _context: &ContextInfo) -> Result<SourceMetadata, MetadataError> {
        std::future::pending().await
    }
}

/// Extractor that always fails.
pub struct FailingExtractor;

#[async_trait]
impl MetadataExtractor for FailingExtractor {
    async fn describe(&self, _context: &ContextInfo) -> Result<SourceMetadata, MetadataError> {
        Err(MetadataError::Unavailable("no artwork".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Add(Source),
    Del(SourceId),
    Update(Source),
}

#[derive(Default)]
pub struct RecordingView {
    events: Mutex<Vec<ViewEvent>>,
}

impl RecordingView {
    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    pub fn adds(&self, id: i64) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ViewEvent::Add(s) if s.id == SourceId(id)))
            .count()
    }
}

impl ViewObserver for RecordingView {
    fn add(&self, source: &Source) {
        self.events.lock().push(ViewEvent::Add(source.clone()));
    }

    fn del(&self, id: SourceId) {
        self.events.lock().push(ViewEvent::Del(id));
    }

    fn update(&self, source: &Source) {
        self.events.lock().push(ViewEvent::Update(source.clone()));
    }
}

/// One port whose writers are queued up front.
pub struct MemoryPort {
    writers: Arc<Mutex<Vec<io::Result<PortWriter>>>>,
}

#[async_trait]
impl SerialPort for MemoryPort {
    fn info(&self) -> PortInfo {
        PortInfo {
            name: "memory".to_string(),
            usb_vendor_id: None,
            usb_product_id: None,
        }
    }

    async fn open(&mut self, _options: &PortOptions) -> io::Result<PortWriter> {
        let mut writers = self.writers.lock();
        if writers.is_empty() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        }
        writers.remove(0)
    }
}

pub struct MemoryPicker {
    writers: Arc<Mutex<Vec<io::Result<PortWriter>>>>,
}

impl MemoryPicker {
    pub fn new(writers: Vec<io::Result<PortWriter>>) -> Self {
        Self {
            writers: Arc::new(Mutex::new(writers)),
        }
    }
}

#[async_trait]
impl PortPicker for MemoryPicker {
    async fn request_port(&self, _filters: &[PortFilter]) -> Result<Box<dyn SerialPort>, BridgeError> {
        Ok(Box::new(MemoryPort {
            writers: self.writers.clone(),
        }))
    }

    async fn known_ports(&self) -> Result<Vec<Box<dyn SerialPort>>, BridgeError> {
        Ok(vec![Box::new(MemoryPort {
            writers: self.writers.clone(),
        })])
    }
}

pub struct Fixture {
    pub host: Arc<FakeHost>,
    pub view: Arc<RecordingView>,
    // keeps the weakly held view alive
    _view_handle: Arc<dyn ViewObserver>,
    pub controller: Arc<LifecycleController>,
}

pub fn fixture() -> Fixture {
    fixture_with(Arc::new(BasicExtractor), SerialBridge::unavailable())
}

pub fn fixture_with(extractor: Arc<dyn MetadataExtractor>, bridge: SerialBridge) -> Fixture {
    let host = FakeHost::new();
    let controller = LifecycleController::new(
        host.clone(),
        extractor,
        Arc::new(bridge),
        LifecycleSettings {
            grace_period: GRACE,
            metadata_timeout: Duration::from_secs(1),
            ..LifecycleSettings::default()
        },
    );
    let view = Arc::new(RecordingView::default());
    let view_handle: Arc<dyn ViewObserver> = view.clone();
    controller.subscribe(&view_handle);
    Fixture {
        host,
        view,
        _view_handle: view_handle,
        controller,
    }
}

/// Writer that fails every write, like an unplugged device.
pub struct UnpluggedWriter;

impl tokio::io::AsyncWrite for UnpluggedWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
