use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::types::Source;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// How long a single line may take to reach the device.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);
const INTERRUPT_RETRY: Duration = Duration::from_millis(50);

/// Exclusive write handle of an open port.
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Narrows which devices the picker offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFilter {
    #[serde(default)]
    pub usb_vendor_id: Option<u16>,
    #[serde(default)]
    pub usb_product_id: Option<u16>,
}

impl PortFilter {
    pub fn matches(&self, info: &PortInfo) -> bool {
        let vendor = self
            .usb_vendor_id
            .map_or(true, |v| info.usb_vendor_id == Some(v));
        let product = self
            .usb_product_id
            .map_or(true, |p| info.usb_product_id == Some(p));
        vendor && product
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub usb_vendor_id: Option<u16>,
    pub usb_product_id: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortOptions {
    pub baud_rate: u32,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// One hardware port as handed out by a [`PortPicker`].
#[async_trait]
pub trait SerialPort: Send {
    fn info(&self) -> PortInfo;

    /// Open the transport and hand back its exclusive writer.
    async fn open(&mut self, options: &PortOptions) -> io::Result<PortWriter>;

    /// Transports without an explicit close operation keep the default.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// User-facing port selection. Only call in response to a user action.
#[async_trait]
pub trait PortPicker: Send + Sync {
    async fn request_port(&self, filters: &[PortFilter]) -> Result<Box<dyn SerialPort>, BridgeError>;

    async fn known_ports(&self) -> Result<Vec<Box<dyn SerialPort>>, BridgeError>;
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub url: Option<String>,
    pub paused: bool,
    pub muted: bool,
    /// Capture time in milliseconds since the Unix epoch.
    pub ts: u64,
}

impl Snapshot {
    /// Capture `source` now. `None` yields the idle snapshot.
    pub fn capture(source: Option<&Source>) -> Self {
        let ts = now_millis();
        let Some(source) = source else {
            return Self {
                title: None,
                artist: None,
                album: None,
                url: None,
                paused: true,
                muted: false,
                ts,
            };
        };

        let media = source.media.clone().unwrap_or_default();
        let page_title = Some(source.metadata.title.clone()).filter(|t| !t.is_empty());
        Self {
            title: media.title.or(page_title),
            artist: media.artist,
            album: media.album,
            url: source.url.clone(),
            paused: source.media.as_ref().map_or(true, |m| m.paused),
            muted: media.muted,
            ts,
        }
    }

    /// Equal apart from the capture time.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        Snapshot { ts: other.ts, ..self.clone() } == *other
    }

    pub fn encode_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Connection state as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub info: Option<PortInfo>,
}

#[derive(Default)]
struct Link {
    port: Option<Box<dyn SerialPort>>,
    writer: Option<PortWriter>,
}

impl Link {
    fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.writer.is_some(),
            info: self.port.as_ref().map(|p| p.info()),
        }
    }

    /// Drop the writer and close the port, logging rather than returning errors.
    /// Each step is bounded so a hung device cannot hold the link forever.
    async fn teardown(&mut self, forget_port: bool) {
        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(RELEASE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Error releasing serial writer: {}", e),
                Err(_) => log::warn!("Serial writer did not release in time, dropping it"),
            }
        }
        if let Some(port) = self.port.as_mut() {
            match tokio::time::timeout(RELEASE_TIMEOUT, port.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Error closing serial port {}: {}", port.info().name, e),
                Err(_) => log::warn!("Serial port {} did not close in time", port.info().name),
            }
        }
        if forget_port {
            self.port = None;
        }
    }
}

/// Zero-or-one hardware link carrying newline-delimited JSON snapshots.
///
/// The link sits behind an async mutex so that one `send` finishes before the
/// next one touches the writer. Writes are bounded by a timeout and can be
/// interrupted by `close`; the published status never waits on either.
pub struct SerialBridge {
    picker: Option<Arc<dyn PortPicker>>,
    link: Mutex<Link>,
    status: RwLock<LinkStatus>,
    interrupt: Notify,
    write_timeout: Duration,
    last_ts: AtomicU64,
}

impl SerialBridge {
    pub fn new(picker: Arc<dyn PortPicker>) -> Self {
        Self::with_picker(Some(picker))
    }

    /// A bridge for hosts without any serial transport.
    pub fn unavailable() -> Self {
        Self::with_picker(None)
    }

    fn with_picker(picker: Option<Arc<dyn PortPicker>>) -> Self {
        Self {
            picker,
            link: Mutex::new(Link::default()),
            status: RwLock::new(LinkStatus::default()),
            interrupt: Notify::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            last_ts: AtomicU64::new(0),
        }
    }

    /// Give up on a line that the device has not taken after `timeout`.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn is_available(&self) -> bool {
        self.picker.is_some()
    }

    fn picker(&self) -> Result<&Arc<dyn PortPicker>, BridgeError> {
        self.picker.as_ref().ok_or(BridgeError::NotAvailable)
    }

    /// Publish the state of `link`. Called with the link lock held.
    fn publish(&self, link: &Link) {
        *self.status.write() = link.status();
    }

    /// Ask the picker for a port and remember it. Does not open it.
    pub async fn select_port(&self, filters: &[PortFilter]) -> Result<PortInfo, BridgeError> {
        let port = self.picker()?.request_port(filters).await?;
        Ok(self.store(port).await)
    }

    /// Remember the `index`-th port the picker already has permission for.
    pub async fn select_known(&self, index: usize) -> Result<PortInfo, BridgeError> {
        let mut ports = self.picker()?.known_ports().await?;
        if index >= ports.len() {
            return Err(BridgeError::PortUnavailable);
        }
        Ok(self.store(ports.swap_remove(index)).await)
    }

    async fn store(&self, port: Box<dyn SerialPort>) -> PortInfo {
        let info = port.info();
        // Only one port at a time: release the previous one first
        let mut link = self.lock_interrupting().await;
        link.teardown(true).await;
        log::info!("Serial port selected: {}", info.name);
        link.port = Some(port);
        self.publish(&link);
        info
    }

    /// Open the selected port. A no-op when already open.
    pub async fn open(&self, options: &PortOptions) -> Result<(), BridgeError> {
        if !self.is_available() {
            return Err(BridgeError::NotAvailable);
        }
        let mut link = self.link.lock().await;
        if link.writer.is_some() {
            return Ok(());
        }
        let port = link.port.as_mut().ok_or(BridgeError::PortUnavailable)?;
        let writer = port.open(options).await.map_err(|e| {
            log::error!("Failed to open serial port {}: {}", port.info().name, e);
            BridgeError::OpenFailed(e)
        })?;
        log::info!(
            "Serial port {} opened at {} baud",
            port.info().name,
            options.baud_rate
        );
        link.writer = Some(writer);
        self.publish(&link);
        Ok(())
    }

    /// Write one snapshot line. On failure, timeout or interruption the writer
    /// is discarded and the link stays closed until the next explicit `open`.
    pub async fn send(&self, snapshot: &Snapshot) -> Result<(), BridgeError> {
        let mut link = self.link.lock().await;
        if link.writer.is_none() {
            return Err(if link.port.is_some() {
                BridgeError::NotConnected
            } else {
                BridgeError::PortUnavailable
            });
        }

        // Stamp before encoding so the line carries the raised ts
        let ts = self.stamp(snapshot.ts);
        let line = Snapshot {
            ts,
            ..snapshot.clone()
        }
        .encode_line()?;

        // The lock stays held so lines never interleave on the wire
        let result = match link.writer.as_mut() {
            Some(writer) => {
                let write = async {
                    writer.write_all(&line).await?;
                    writer.flush().await
                };
                tokio::select! {
                    written = tokio::time::timeout(self.write_timeout, write) => {
                        written.unwrap_or_else(|_| {
                            Err(io::Error::new(io::ErrorKind::TimedOut, "device stopped reading"))
                        })
                    }
                    _ = self.interrupt.notified() => {
                        Err(io::Error::new(io::ErrorKind::Interrupted, "link closed during write"))
                    }
                }
            }
            None => return Err(BridgeError::NotConnected),
        };

        if let Err(e) = result {
            log::error!("Serial write failed, closing link: {}", e);
            link.teardown(false).await;
            self.publish(&link);
            return Err(BridgeError::WriteFailed(e));
        }
        Ok(())
    }

    /// Raise `ts` to the last sent stamp so stamps never go backwards.
    fn stamp(&self, ts: u64) -> u64 {
        let previous = self.last_ts.fetch_max(ts, Ordering::SeqCst);
        previous.max(ts)
    }

    /// Take the link, cutting short a write that is stuck on the device.
    async fn lock_interrupting(&self) -> MutexGuard<'_, Link> {
        let lock = self.link.lock();
        tokio::pin!(lock);
        loop {
            tokio::select! {
                link = &mut lock => return link,
                // Wake a writer that started waiting after the last notification.
                _ = tokio::time::sleep(INTERRUPT_RETRY) => self.interrupt.notify_waiters(),
            }
        }
    }

    /// Release the writer, close the port and forget it. Safe to repeat.
    pub async fn close(&self) {
        self.interrupt.notify_waiters();
        let mut link = self.lock_interrupting().await;
        if link.port.is_none() && link.writer.is_none() {
            return;
        }
        link.teardown(true).await;
        self.publish(&link);
        log::info!("Serial port closed");
    }

    /// Current state. Never waits on a write in flight.
    pub fn status(&self) -> LinkStatus {
        self.status.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().connected
    }
}

/// Drain published snapshots into the bridge one at a time. Only the latest
/// snapshot matters, so a slow link skips intermediate states.
pub fn spawn_forwarder(
    bridge: Arc<SerialBridge>,
    mut snapshots: watch::Receiver<Snapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if !bridge.is_connected() {
                log::trace!("Serial link down, not forwarding snapshot");
                continue;
            }
            if let Err(e) = bridge.send(&snapshot).await {
                log::warn!("Dropping snapshot: {}", e);
            }
        }
        log::debug!("Snapshot forwarder stopped");
    })
}
