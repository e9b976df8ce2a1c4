use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, HostError, MetadataError};
use crate::host::{Host, HostEvent, MetadataExtractor};
use crate::metadata::BasicExtractor;
use crate::observer::{ObserverSet, ViewObserver};
use crate::relay::{self, AgentCommand, Applied, RelayMessage};
use crate::serial::{self, LinkStatus, PortFilter, PortOptions, SerialBridge, Snapshot};
use crate::state::SourceRegistry;
use crate::types::{ContextInfo, LoadStatus, PlaybackControl, Source, SourceId, SourceMetadata};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(4500);
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// Delay between a navigation-triggered removal and the audibility re-check.
    pub grace_period: Duration,
    pub metadata_timeout: Duration,
    pub port_options: PortOptions,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            port_options: PortOptions::default(),
        }
    }
}

/// Where a source currently stands. `Unregistering` is never observable from
/// outside: removal happens in one registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Absent,
    Registering,
    Active,
}

struct Recheck {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Phases {
    registering: HashSet<SourceId>,
    /// Dormant by host policy; ignored until the context loads again.
    discarded: HashSet<SourceId>,
    rechecks: HashMap<SourceId, Recheck>,
    generation: u64,
}

impl Phases {
    fn cancel_recheck(&mut self, id: SourceId) -> bool {
        match self.rechecks.remove(&id) {
            Some(recheck) => {
                recheck.handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Decides when sources enter and leave the registry and fans every change
/// out to views and the serial link.
pub struct LifecycleController {
    host: Arc<dyn Host>,
    extractor: Arc<dyn MetadataExtractor>,
    registry: SourceRegistry,
    observers: ObserverSet,
    bridge: Arc<SerialBridge>,
    snapshots: watch::Sender<Snapshot>,
    forwarder: JoinHandle<()>,
    phases: Mutex<Phases>,
    // Held across the host calls so badge updates land in order.
    badge: tokio::sync::Mutex<()>,
    settings: LifecycleSettings,
}

impl LifecycleController {
    /// Must be called from within a tokio runtime: the snapshot forwarder is
    /// spawned here.
    pub fn new(
        host: Arc<dyn Host>,
        extractor: Arc<dyn MetadataExtractor>,
        bridge: Arc<SerialBridge>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        let (snapshots, receiver) = watch::channel(Snapshot::capture(None));
        let forwarder = serial::spawn_forwarder(bridge.clone(), receiver);

        Arc::new(Self {
            host,
            extractor,
            registry: SourceRegistry::new(),
            observers: ObserverSet::new(),
            bridge,
            snapshots,
            forwarder,
            phases: Mutex::new(Phases::default()),
            badge: tokio::sync::Mutex::new(()),
            settings,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<SerialBridge> {
        &self.bridge
    }

    pub fn subscribe(&self, view: &Arc<dyn ViewObserver>) {
        self.observers.subscribe(view);
    }

    /// Everything currently tracked, newest first. Views opened late use this
    /// to catch up.
    pub fn sources(&self) -> Vec<Source> {
        self.registry.list()
    }

    pub fn phase(&self, id: SourceId) -> Phase {
        if self.registry.contains(id) {
            Phase::Active
        } else if self.phases.lock().registering.contains(&id) {
            Phase::Registering
        } else {
            Phase::Absent
        }
    }

    pub fn has_pending_recheck(&self, id: SourceId) -> bool {
        self.phases.lock().rechecks.contains_key(&id)
    }

    /// The snapshot currently offered to the serial link.
    pub fn current_snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Reset the entry point and pick up every context that is already playing.
    pub async fn start(self: &Arc<Self>) {
        // Nothing is tracked yet, clear whatever the host still shows
        self.sync_badge().await;

        let contexts = match self.host.audible_contexts().await {
            Ok(contexts) => contexts,
            Err(e) => {
                log::error!("Failed to list audible contexts: {}", e);
                return;
            }
        };

        log::info!("Found {} audible contexts at startup", contexts.len());
        for context in contexts {
            // Contexts still loading report audible again once they finish
            if context.status == LoadStatus::Complete {
                self.register(context.id).await;
            }
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: HostEvent) {
        log::debug!("Host event for source {}: {:?}", event.id(), event);
        match event {
            HostEvent::AudibleChanged { id, audible: true } => self.on_audible(id).await,
            HostEvent::AudibleChanged { audible: false, .. } => {}
            HostEvent::Navigated { id } => self.on_navigated(id).await,
            HostEvent::TitleChanged { id, title } => self.on_title(id, title),
            HostEvent::Discarded { id } => self.on_discarded(id).await,
            HostEvent::Removed { id } => self.on_removed(id).await,
            HostEvent::Message { id, message } => self.on_message(id, message).await,
        }
    }

    async fn on_audible(&self, id: SourceId) {
        if self.phases.lock().rechecks.contains_key(&id) {
            log::debug!("Source {} audible during grace period, leaving it to the re-check", id);
            return;
        }
        self.register(id).await;
    }

    async fn on_navigated(self: &Arc<Self>, id: SourceId) {
        let (was_active, was_registering, had_recheck) = {
            let mut phases = self.phases.lock();
            // A reload brings a discarded context back.
            phases.discarded.remove(&id);
            let was_registering = phases.registering.remove(&id);
            let had_recheck = phases.cancel_recheck(id);
            (self.detach(id), was_registering, had_recheck)
        };

        if was_active {
            self.after_detach(id).await;
        }
        if was_active || was_registering || had_recheck {
            self.schedule_recheck(id);
        }
    }

    fn on_title(&self, id: SourceId, title: String) {
        let Some(source) = self.registry.update(id, |s| s.metadata.title = title) else {
            return;
        };
        self.observers.update(&source);
        self.publish();
    }

    async fn on_discarded(&self, id: SourceId) {
        let was_active = {
            let mut phases = self.phases.lock();
            phases.cancel_recheck(id);
            phases.registering.remove(&id);
            phases.discarded.insert(id);
            self.detach(id)
        };
        if was_active {
            log::info!("Source {} discarded", id);
            self.after_detach(id).await;
        }
    }

    async fn on_removed(&self, id: SourceId) {
        let was_active = {
            let mut phases = self.phases.lock();
            phases.cancel_recheck(id);
            phases.registering.remove(&id);
            phases.discarded.remove(&id);
            self.detach(id)
        };
        if was_active {
            self.after_detach(id).await;
        }
    }

    async fn on_message(&self, id: SourceId, message: RelayMessage) {
        match relay::apply(&self.registry, id, &message) {
            Applied::Updated { source, handshake } => {
                let source = if handshake {
                    if let Err(e) = self.host.inject_observer(id).await {
                        log::warn!("Failed to inject observer into source {}: {}", id, e);
                    }
                    // The source may have gone away while the script was injected.
                    match self.registry.get(id) {
                        Some(source) => source,
                        None => return,
                    }
                } else {
                    source
                };
                self.observers.update(&source);
                self.publish();
            }
            Applied::Stale => {
                log::debug!("Dropping {:?} for unknown source {}", message, id);
            }
            Applied::NotHooked => {
                log::debug!("Dropping {:?} from source {} before handshake", message, id);
            }
            Applied::Ignored => {}
        }
    }

    /// `Absent → Registering → Active`. Returns whether the source became active.
    async fn register(&self, id: SourceId) -> bool {
        // Skip ids that are tracked, dormant or already on their way in
        {
            let mut phases = self.phases.lock();
            if self.registry.contains(id) || phases.discarded.contains(&id) {
                return false;
            }
            if !phases.registering.insert(id) {
                log::debug!("Source {} is already registering", id);
                return false;
            }
        }

        let context = match self.host.context(id).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                log::debug!("Source {} vanished before registration", id);
                self.phases.lock().registering.remove(&id);
                return false;
            }
            Err(e) => {
                log::warn!("Failed to look up source {}: {}", id, e);
                self.phases.lock().registering.remove(&id);
                return false;
            }
        };

        let mut metadata = self.describe(&context).await;

        // Title events are dropped while the id is not in the registry, so
        // pick up any rename that happened during the lookup.
        match self.host.context(id).await {
            Ok(Some(current)) => metadata.title = current.title,
            Ok(None) => log::debug!("Source {} closed during metadata lookup", id),
            Err(e) => log::debug!("Could not refresh title of source {}: {}", id, e),
        }

        // Commit under the phases lock: a navigation, discard or removal is
        // seen either entirely before (and the registration is dropped) or
        // entirely after the insert and the `add`.
        let source = {
            let mut phases = self.phases.lock();
            if !phases.registering.remove(&id) || phases.discarded.contains(&id) {
                log::debug!("Registration of source {} abandoned", id);
                return false;
            }
            let source = self
                .registry
                .register(id, context.window, context.url.clone(), metadata);
            self.observers.add(&source);
            source
        };
        log::info!(
            "Registered source {} ({}): {}",
            id,
            source.metadata.hostname,
            source.metadata.title
        );

        self.sync_badge().await;
        if let Err(e) = self.host.inject_agent(id).await {
            log::warn!("Failed to inject agent into source {}: {}", id, e);
        }
        true
    }

    async fn describe(&self, context: &ContextInfo) -> SourceMetadata {
        let described = tokio::time::timeout(
            self.settings.metadata_timeout,
            self.extractor.describe(context),
        )
        .await
        .unwrap_or(Err(MetadataError::TimedOut));

        described.unwrap_or_else(|e| {
            log::warn!(
                "Metadata for source {} unavailable, registering with partial metadata: {}",
                context.id,
                e
            );
            BasicExtractor::partial(context)
        })
    }

    /// `Active → Unregistering`: drop the entry and tell the views. Must be
    /// called with the phases lock held so it orders against `register`.
    fn detach(&self, id: SourceId) -> bool {
        if self.registry.unregister(id).is_none() {
            return false;
        }
        log::info!("Unregistered source {}", id);
        self.observers.del(id);
        true
    }

    /// `Unregistering → Absent`: host side effects of a detach.
    async fn after_detach(&self, id: SourceId) {
        self.sync_badge().await;
        if let Err(e) = self.host.send_to_agent(id, AgentCommand::Unhook).await {
            log::debug!("Could not unhook source {}: {}", id, e);
        }
        self.publish();
    }

    fn schedule_recheck(self: &Arc<Self>, id: SourceId) {
        let mut phases = self.phases.lock();
        phases.cancel_recheck(id);
        phases.generation += 1;
        let generation = phases.generation;

        let controller: Weak<Self> = Arc::downgrade(self);
        let grace = self.settings.grace_period;
        // Spawned under the lock so the task cannot look for its entry before
        // it is inserted.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(controller) = controller.upgrade() {
                controller.recheck(id, generation).await;
            }
        });
        phases.rechecks.insert(id, Recheck { generation, handle });
        log::debug!("Re-checking source {} in {:?}", id, grace);
    }

    async fn recheck(&self, id: SourceId, generation: u64) {
        {
            let mut phases = self.phases.lock();
            // Superseded or cancelled while sleeping.
            if phases.rechecks.get(&id).map(|r| r.generation) != Some(generation) {
                return;
            }
            phases.rechecks.remove(&id);
        }

        // Only what the host reports now counts, not events seen meanwhile
        let audible = match self.host.context(id).await {
            Ok(Some(context)) => context.audible && !context.discarded,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Failed to re-check source {}: {}", id, e);
                false
            }
        };

        if audible {
            log::debug!("Source {} still audible after navigation", id);
            self.register(id).await;
        } else {
            log::debug!("Source {} went quiet after navigation", id);
        }
    }

    async fn sync_badge(&self) {
        let _ordered = self.badge.lock().await;
        // Always the registry size, never a running count
        let size = self.registry.len();
        let enabled = size > 0;

        if let Err(e) = self.host.set_entry_point_enabled(enabled).await {
            log::warn!("Failed to toggle entry point: {}", e);
        }
        if let Err(e) = self.host.set_badge(enabled.then_some(size)).await {
            log::warn!("Failed to update badge: {}", e);
        }
    }

    fn publish(&self) {
        let snapshot = Snapshot::capture(self.registry.now_playing().as_ref());
        self.snapshots.send_if_modified(|current| {
            if current.same_content(&snapshot) {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Drop a source from the list without waiting for the host to do so.
    pub async fn dismiss(&self, id: SourceId) -> bool {
        let was_active = {
            let mut phases = self.phases.lock();
            phases.cancel_recheck(id);
            phases.registering.remove(&id);
            self.detach(id)
        };
        if was_active {
            self.after_detach(id).await;
        }
        was_active
    }

    /// Forward a playback control to the source. Returns `false` when the
    /// source is not tracked or has not shaken hands yet.
    pub async fn control(&self, id: SourceId, control: PlaybackControl) -> Result<bool, HostError> {
        let Some(media) = self.registry.get(id).and_then(|s| s.media) else {
            return Ok(false);
        };
        self.host.run_media_command(id, control.resolve(&media)).await?;
        Ok(true)
    }

    pub async fn focus(&self, id: SourceId) -> Result<bool, HostError> {
        let Some(source) = self.registry.get(id) else {
            return Ok(false);
        };
        self.host.focus(id, source.window).await?;
        Ok(true)
    }

    pub async fn close(&self, id: SourceId) -> Result<(), HostError> {
        self.host.close_context(id).await
    }

    /// Let the user pick a new port, open it and send the current state.
    pub async fn serial_request(&self, filters: &[PortFilter]) -> Result<LinkStatus, BridgeError> {
        self.bridge.select_port(filters).await?;
        self.serial_open().await
    }

    /// Connect to the `index`-th port the user already granted.
    pub async fn serial_connect(&self, index: usize) -> Result<LinkStatus, BridgeError> {
        self.bridge.select_known(index).await?;
        self.serial_open().await
    }

    /// Open the selected port and send the current state right away.
    pub async fn serial_open(&self) -> Result<LinkStatus, BridgeError> {
        self.bridge.open(&self.settings.port_options).await?;
        // The device starts from the current state, not from the next change.
        let snapshot = Snapshot::capture(self.registry.now_playing().as_ref());
        self.bridge.send(&snapshot).await?;
        Ok(self.bridge.status())
    }

    pub async fn serial_disconnect(&self) -> LinkStatus {
        self.bridge.close().await;
        self.bridge.status()
    }

    /// Never waits on a write in flight.
    pub fn serial_status(&self) -> LinkStatus {
        self.bridge.status()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.forwarder.abort();
        for (_, recheck) in self.phases.get_mut().rechecks.drain() {
            recheck.handle.abort();
        }
    }
}
