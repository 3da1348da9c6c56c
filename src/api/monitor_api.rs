//! Debug monitor facade
//!
//! Wires the interception adapters, the pending request registry, the sync
//! channel and the storage mirror together behind `start` / `stop`.
//!
//! Adapters are installed onto their surfaces in a fixed order and their
//! installs are recorded; `stop` unwinds everything installed since `start`
//! in reverse order so each surface gets back the exact implementation it
//! had before.

use super::config::{validate_port, validate_server_ip, ConfigError, MonitorConfig, StartOptions};
use crate::clients::{GlobalFetch, InterceptorHost, XhrClass};
use crate::intercept::{
    FetchInterceptor, PassiveXhrObserver, PipelineInterceptor, RequestTracker, SurfaceAdapter,
    XhrInterceptor,
};
use crate::models::{InboundCommand, NetworkEventType, OutboundMessage, RequestRecord};
use crate::registry::{PendingRequestRegistry, RegistryEvent};
use crate::storage::{KeyValueStore, MemoryStore, StorageMirror};
use crate::sync::{ChannelEvent, ConnectionState, Connector, SyncChannel, WebSocketConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterSlot {
    Xhr,
    Fetch,
    Pipeline,
    Passive,
}

#[derive(Default)]
struct MonitorState {
    started: bool,
    /// Installed adapters, innermost first
    installed: Vec<AdapterSlot>,
    /// Length of `installed` when `start` ran
    start_mark: usize,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared with the background workers
#[derive(Clone)]
struct MonitorShared {
    registry: Arc<PendingRequestRegistry>,
    channel: Arc<SyncChannel>,
    mirror: Arc<StorageMirror>,
    monitoring: Arc<AtomicBool>,
}

impl MonitorShared {
    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { .. } => {
                self.mirror.push_snapshot().await;
                self.channel.send(&OutboundMessage::network_status(
                    self.monitoring.load(Ordering::SeqCst),
                ));
            }
            ChannelEvent::Command(command) if command.is_storage_command() => {
                self.mirror.handle(&command).await;
            }
            ChannelEvent::Command(InboundCommand::RequestRefresh) => {
                self.request_refresh();
            }
            ChannelEvent::Command(InboundCommand::ClearNetworkHistory) => {
                self.clear_network_history();
            }
            ChannelEvent::Command(command) => debug!("Ignoring command {:?}", command),
            ChannelEvent::Disconnected { .. } | ChannelEvent::DiscoveryFailed => {}
        }
    }

    fn request_refresh(&self) -> bool {
        if !self.channel.is_connected() {
            return false;
        }
        self.channel.send(&OutboundMessage::network_signal(
            NetworkEventType::RequestRefresh,
        ));
        for record in self.registry.list() {
            self.channel.send(&OutboundMessage::network_event(
                NetworkEventType::RequestPending,
                record,
            ));
        }
        true
    }

    fn clear_network_history(&self) {
        self.registry.clear();
        self.channel.send(&OutboundMessage::network_signal(
            NetworkEventType::ClearNetworkHistory,
        ));
        info!("Network history cleared");
    }
}

async fn forward_network_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    channel: Arc<SyncChannel>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                channel.send(&OutboundMessage::network_event(
                    event.event_type,
                    event.record,
                ));
            }
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} network events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn dispatch_channel_events(
    mut events: broadcast::Receiver<ChannelEvent>,
    shared: MonitorShared,
) {
    loop {
        match events.recv().await {
            Ok(event) => shared.handle_channel_event(event).await,
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} channel events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Builder for [`DebugMonitor`]
#[derive(Default)]
pub struct DebugMonitorBuilder {
    config: MonitorConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    xhr: Option<Arc<XhrClass>>,
    fetch: Option<Arc<GlobalFetch>>,
    connector: Option<Arc<dyn Connector>>,
}

impl DebugMonitorBuilder {
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Store mirrored to the host; defaults to an empty in-memory store
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn xhr(mut self, class: Arc<XhrClass>) -> Self {
        self.xhr = Some(class);
        self
    }

    pub fn fetch(mut self, surface: Arc<GlobalFetch>) -> Self {
        self.fetch = Some(surface);
        self
    }

    /// Transport for the sync channel; defaults to WebSocket
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> DebugMonitor {
        let registry = Arc::new(PendingRequestRegistry::new());
        let tracker = Arc::new(RequestTracker::new(Arc::clone(&registry)));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector) as Arc<dyn Connector>);
        let channel = SyncChannel::new(self.config.channel_config(), connector);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let mirror = Arc::new(StorageMirror::new(store, Arc::clone(&channel)));

        let monitor = DebugMonitor {
            shared: MonitorShared {
                registry,
                channel,
                mirror,
                monitoring: Arc::new(AtomicBool::new(false)),
            },
            xhr: self
                .xhr
                .as_ref()
                .map(|class| XhrInterceptor::new(Arc::clone(class), Arc::clone(&tracker))),
            fetch: self
                .fetch
                .map(|surface| FetchInterceptor::new(surface, Arc::clone(&tracker))),
            pipeline: PipelineInterceptor::new(Arc::clone(&tracker)),
            passive: self
                .xhr
                .map(|class| PassiveXhrObserver::new(class, Arc::clone(&tracker))),
            config: self.config,
            state: Mutex::new(MonitorState::default()),
        };
        if monitor.config.passive_capture {
            monitor.enable_passive_capture();
        }
        monitor
    }
}

/// Device-side debug monitor
pub struct DebugMonitor {
    config: MonitorConfig,
    shared: MonitorShared,
    xhr: Option<XhrInterceptor>,
    fetch: Option<FetchInterceptor>,
    pipeline: PipelineInterceptor,
    passive: Option<PassiveXhrObserver>,
    state: Mutex<MonitorState>,
}

impl DebugMonitor {
    pub fn builder() -> DebugMonitorBuilder {
        DebugMonitorBuilder::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adapter(&self, slot: AdapterSlot) -> Option<&dyn SurfaceAdapter> {
        match slot {
            AdapterSlot::Xhr => self.xhr.as_ref().map(|a| a as &dyn SurfaceAdapter),
            AdapterSlot::Fetch => self.fetch.as_ref().map(|a| a as &dyn SurfaceAdapter),
            AdapterSlot::Pipeline => Some(&self.pipeline as &dyn SurfaceAdapter),
            AdapterSlot::Passive => self.passive.as_ref().map(|a| a as &dyn SurfaceAdapter),
        }
    }

    fn install(&self, state: &mut MonitorState, slot: AdapterSlot) -> bool {
        let Some(adapter) = self.adapter(slot) else {
            return false;
        };
        if !adapter.install() {
            return false;
        }
        state.installed.push(slot);
        debug!("Installed {} adapter", adapter.name());
        true
    }

    /// Uninstall adapters, newest first, until `mark` remain
    fn revert_to(&self, state: &mut MonitorState, mark: usize) {
        while state.installed.len() > mark {
            let Some(slot) = state.installed.pop() else {
                break;
            };
            if let Some(adapter) = self.adapter(slot) {
                adapter.uninstall();
                debug!("Restored original {} implementation", adapter.name());
            }
        }
    }

    /// Start monitoring and connect to the host in the background.
    ///
    /// Returns `false` when already started or outside development mode.
    /// `stop` cancels a connection attempt that is still in progress.
    pub async fn start(&self, options: StartOptions) -> bool {
        {
            let mut state = self.lock_state();
            if state.started {
                warn!("Debug monitor is already started");
                return false;
            }
            if !self.config.development_mode {
                info!("Debug monitor only runs in development mode");
                return false;
            }
            state.started = true;
            state.start_mark = state.installed.len();
        }

        if let Some(ip) = options.server_ip.as_deref() {
            if let Err(e) = self.set_server_ip(ip) {
                warn!("Ignoring start option: {}", e);
            }
        }
        if let Some(port) = options.port {
            if let Err(e) = self.set_port(port) {
                warn!("Ignoring start option: {}", e);
            }
        }

        self.spawn_workers();
        if options.monitor_network {
            self.install_network_adapters();
        }

        info!("Starting debug monitor");
        self.shared.channel.start_connect();
        true
    }

    /// Stop monitoring, close the channel and restore every surface.
    ///
    /// Returns `false` if the monitor was not started.
    pub fn stop(&self) -> bool {
        let tasks = {
            let mut state = self.lock_state();
            if !state.started {
                return false;
            }
            state.started = false;
            std::mem::take(&mut state.tasks)
        };

        if self.shared.monitoring.swap(false, Ordering::SeqCst) {
            self.shared
                .channel
                .send(&OutboundMessage::network_status(false));
        }
        self.shared.channel.close();

        {
            let mut state = self.lock_state();
            let mark = state.start_mark;
            self.revert_to(&mut state, mark);
        }
        for task in tasks {
            task.abort();
        }
        info!("Debug monitor stopped");
        true
    }

    fn spawn_workers(&self) {
        let forwarder = tokio::spawn(forward_network_events(
            self.shared.registry.subscribe(),
            Arc::clone(&self.shared.channel),
        ));
        let dispatcher = tokio::spawn(dispatch_channel_events(
            self.shared.channel.subscribe(),
            self.shared.clone(),
        ));
        self.lock_state().tasks.extend([forwarder, dispatcher]);
    }

    fn install_network_adapters(&self) {
        {
            let mut state = self.lock_state();
            for slot in [AdapterSlot::Xhr, AdapterSlot::Fetch, AdapterSlot::Pipeline] {
                self.install(&mut state, slot);
            }
        }
        self.shared.monitoring.store(true, Ordering::SeqCst);
        self.shared
            .channel
            .send(&OutboundMessage::network_status(true));
        info!("Network monitoring started");
    }

    /// Report callback-style requests created before monitoring started.
    ///
    /// Returns `false` without a callback-style surface or when already
    /// enabled.
    pub fn enable_passive_capture(&self) -> bool {
        let mut state = self.lock_state();
        if state.installed.contains(&AdapterSlot::Passive) {
            return false;
        }
        self.install(&mut state, AdapterSlot::Passive)
    }

    /// Remove the passive observer; only possible while it is the
    /// outermost wrapper
    pub fn disable_passive_capture(&self) -> bool {
        let mut state = self.lock_state();
        if state.installed.last() != Some(&AdapterSlot::Passive) {
            warn!("Passive capture is not the outermost wrapper; leaving it installed");
            return false;
        }
        let mark = state.installed.len() - 1;
        if mark < state.start_mark {
            state.start_mark = mark;
        }
        self.revert_to(&mut state, mark);
        true
    }

    pub fn set_server_ip(&self, ip: &str) -> Result<(), ConfigError> {
        let host = validate_server_ip(ip)?;
        info!("Server host set to {}", host);
        self.shared.channel.set_server_host(Some(host));
        Ok(())
    }

    pub fn set_port(&self, port: u32) -> Result<(), ConfigError> {
        let port = validate_port(port)?;
        info!("Server port set to {}", port);
        self.shared.channel.set_port(port);
        Ok(())
    }

    /// Monitor an interceptor-pipeline client.
    ///
    /// Returns `false` if the client has no pipeline or is already
    /// registered.
    pub fn add_pipeline_client(&self, client: Arc<dyn InterceptorHost>) -> bool {
        match self.pipeline.register(client) {
            Ok(()) => {
                info!("Pipeline client registered");
                true
            }
            Err(e) => {
                warn!("Cannot monitor pipeline client: {}", e);
                false
            }
        }
    }

    /// Calls currently in flight, ordered by id
    pub fn pending_requests(&self) -> Vec<RequestRecord> {
        self.shared.registry.list()
    }

    /// Re-announce pending calls; `false` when not connected
    pub fn request_refresh(&self) -> bool {
        self.shared.request_refresh()
    }

    pub fn clear_network_history(&self) {
        self.shared.clear_network_history();
    }

    pub fn is_started(&self) -> bool {
        self.lock_state().started
    }

    pub fn is_passive_capture_enabled(&self) -> bool {
        self.passive
            .as_ref()
            .is_some_and(|observer| observer.is_installed())
    }

    pub fn is_monitoring_network(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.channel.state()
    }

    pub fn server_host(&self) -> Option<String> {
        self.shared.channel.server_host()
    }

    pub fn port(&self) -> u16 {
        self.shared.channel.port()
    }

    pub fn registry(&self) -> &Arc<PendingRequestRegistry> {
        &self.shared.registry
    }

    pub fn storage(&self) -> &StorageMirror {
        &self.shared.mirror
    }
}

impl Drop for DebugMonitor {
    fn drop(&mut self) {
        self.stop();
        let mut state = self.lock_state();
        self.revert_to(&mut state, 0);
    }
}
