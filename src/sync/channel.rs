//! Reconnecting sync channel
//!
//! Owns at most one live connection. A lost or failed connection schedules
//! one reconnect with a linearly growing delay capped at 30 seconds. When no
//! host is configured the channel probes the discovery candidates instead.
//!
//! Every connect bumps a generation counter; results and close
//! notifications from an older generation are discarded, so `close` and a
//! newer `connect` always win over in-flight work.

use super::connector::{Connection, Connector};
use super::discovery::{self, DiscoveryConfig};
use crate::models::{InboundCommand, OutboundMessage};
use anyhow::{anyhow, bail};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Default host port
pub const DEFAULT_PORT: u16 = 12380;

const RECONNECT_STEP_MS: u64 = 5_000;
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
/// Time allowed for a single connection to open
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time a closing connection gets to flush queued messages
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Delay before the next reconnect given the attempts made so far
pub fn reconnect_delay(attempts: u32) -> Duration {
    Duration::from_millis(
        RECONNECT_STEP_MS
            .saturating_mul(u64::from(attempts))
            .min(MAX_RECONNECT_DELAY_MS),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected { host: String, port: u16 },
    Disconnected { reason: String },
    Command(InboundCommand),
    DiscoveryFailed,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_host: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_host: None,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Timer,
}

struct ChannelInner {
    state: ConnectionState,
    server_host: Option<String>,
    discovered_host: Option<String>,
    port: u16,
    connection_attempts: u32,
    active: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connection_task: Option<JoinHandle<()>>,
    /// Caller-initiated attempt, including its discovery loop
    connect_task: Option<AbortHandle>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ChannelInner {
    /// Drop the live connection; a graceful close lets queued messages flush
    fn release_connection(&mut self, graceful: bool) {
        self.outbound = None;
        if let Some(task) = self.connection_task.take() {
            match (graceful, tokio::runtime::Handle::try_current()) {
                (true, Ok(runtime)) => {
                    runtime.spawn(async move {
                        let mut task = task;
                        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                            task.abort();
                        }
                    });
                }
                _ => task.abort(),
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn cancel_connect(&mut self) {
        if let Some(attempt) = self.connect_task.take() {
            attempt.abort();
        }
    }
}

pub struct SyncChannel {
    connector: Arc<dyn Connector>,
    discovery: DiscoveryConfig,
    connect_timeout: Duration,
    inner: Mutex<ChannelInner>,
    events: broadcast::Sender<ChannelEvent>,
}

impl SyncChannel {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            discovery: config.discovery,
            connect_timeout: config.connect_timeout,
            inner: Mutex::new(ChannelInner {
                state: ConnectionState::Disconnected,
                server_host: config.server_host,
                discovered_host: None,
                port: config.port,
                connection_attempts: 0,
                active: false,
                generation: 0,
                outbound: None,
                connection_task: None,
                connect_task: None,
                reconnect_timer: None,
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connection_attempts(&self) -> u32 {
        self.lock().connection_attempts
    }

    /// Explicit host, or the discovered one when none is configured
    pub fn server_host(&self) -> Option<String> {
        let inner = self.lock();
        inner
            .server_host
            .clone()
            .or_else(|| inner.discovered_host.clone())
    }

    /// Takes effect on the next connect
    pub fn set_server_host(&self, host: Option<String>) {
        self.lock().server_host = host;
    }

    pub fn port(&self) -> u16 {
        self.lock().port
    }

    /// Takes effect on the next connect
    pub fn set_port(&self, port: u16) {
        self.lock().port = port;
    }

    pub fn reconnect_pending(&self) -> bool {
        self.lock().reconnect_timer.is_some()
    }

    /// Open the channel, tearing down any existing connection first.
    ///
    /// Returns whether a connection was established; `false` as well when
    /// `close` or a newer connect cancels the attempt. On failure a
    /// reconnect is scheduled.
    pub async fn connect(self: &Arc<Self>) -> bool {
        self.spawn_connect().await.unwrap_or(false)
    }

    /// Like [`connect`](Self::connect) without waiting for the outcome
    pub fn start_connect(self: &Arc<Self>) {
        self.spawn_connect();
    }

    /// Run the attempt on its own task so `close` can abort it mid-discovery
    fn spawn_connect(self: &Arc<Self>) -> JoinHandle<bool> {
        let channel = Arc::clone(self);
        let mut inner = self.lock();
        inner.cancel_connect();
        let attempt = tokio::spawn(async move { channel.connect_from(Origin::Caller).await });
        inner.connect_task = Some(attempt.abort_handle());
        attempt
    }

    /// Stop reconnecting and close the connection
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.active = false;
        inner.generation += 1;
        inner.cancel_connect();
        inner.cancel_reconnect();
        inner.release_connection(true);
        inner.connection_attempts = 0;
        debug!("Sync channel closed locally");
    }

    /// Serialize and send; a no-op unless connected
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        match serde_json::to_string(message) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                warn!("Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    async fn connect_from(self: &Arc<Self>, origin: Origin) -> bool {
        let (generation, explicit_host, discovered_host, port, attempts) = {
            let mut inner = self.lock();
            if origin == Origin::Caller {
                inner.cancel_reconnect();
            }
            inner.release_connection(false);
            inner.active = true;
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            (
                inner.generation,
                inner.server_host.clone(),
                inner.discovered_host.clone(),
                inner.port,
                inner.connection_attempts,
            )
        };

        let result = self
            .open_target(explicit_host, discovered_host, port, attempts)
            .await;

        let mut inner = self.lock();
        if origin == Origin::Timer {
            inner.reconnect_timer = None;
        }
        if inner.generation != generation || !inner.active {
            debug!("Discarding superseded connection attempt");
            return false;
        }

        match result {
            Ok((host, connection, discovered)) => {
                if discovered {
                    inner.discovered_host = Some(host.clone());
                }
                inner.state = ConnectionState::Connected;
                inner.connection_attempts = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                inner.outbound = Some(tx);
                let channel = Arc::clone(self);
                inner.connection_task = Some(tokio::spawn(async move {
                    channel.run_connection(generation, connection, rx).await;
                }));
                drop(inner);

                info!("Sync channel connected to {}:{}", host, port);
                self.emit(ChannelEvent::Connected { host, port });
                true
            }
            Err(e) => {
                inner.state = ConnectionState::Disconnected;
                drop(inner);

                warn!("Sync channel connection failed: {:#}", e);
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Resolve the target host and open a connection to it.
    ///
    /// The flag in the result is set when the host came from discovery.
    async fn open_target(
        &self,
        explicit_host: Option<String>,
        discovered_host: Option<String>,
        port: u16,
        attempts: u32,
    ) -> anyhow::Result<(String, Connection, bool)> {
        if let Some(host) = explicit_host {
            let connection = self.open(&host, port).await?;
            return Ok((host, connection, false));
        }

        if self.discovery.enabled && attempts >= self.discovery.threshold {
            info!(
                "No server host configured; probing {} candidates",
                self.discovery.candidates.len()
            );
            if let Some((host, connection)) =
                discovery::discover(self.connector.as_ref(), &self.discovery, port).await
            {
                return Ok((host, connection, true));
            }
            self.emit(ChannelEvent::DiscoveryFailed);
            bail!("no candidate host accepted a connection");
        }

        if let Some(host) = discovered_host {
            let connection = self.open(&host, port).await?;
            return Ok((host, connection, true));
        }
        bail!("no server host configured")
    }

    async fn open(&self, host: &str, port: u16) -> anyhow::Result<Connection> {
        tokio::time::timeout(self.connect_timeout, self.connector.connect(host, port))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}:{}", host, port))?
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if !inner.active || inner.reconnect_timer.is_some() {
            return;
        }
        inner.connection_attempts = inner.connection_attempts.saturating_add(1);
        let delay = reconnect_delay(inner.connection_attempts);
        info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            inner.connection_attempts
        );
        let channel = Arc::clone(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            channel.reconnect().await;
        }));
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.connect_from(Origin::Timer).await;
        })
    }

    async fn run_connection(
        self: Arc<Self>,
        generation: u64,
        connection: Connection,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;
        let reason = loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(text) => {
                        if let Err(e) = sink.send(text).await {
                            break format!("send failed: {:#}", e);
                        }
                    }
                    None => break "closed locally".to_string(),
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(text)) => self.dispatch_inbound(&text),
                    Some(Err(e)) => break format!("transport error: {:#}", e),
                    None => break "closed by host".to_string(),
                },
            }
        };
        let _ = sink.close().await;
        self.handle_closed(generation, reason);
    }

    fn dispatch_inbound(&self, text: &str) {
        match serde_json::from_str::<InboundCommand>(text) {
            Ok(command) => {
                debug!("Received command {:?}", command);
                self.emit(ChannelEvent::Command(command));
            }
            Err(e) => warn!("Ignoring malformed message from host: {}", e),
        }
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, reason: String) {
        let should_reconnect = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.outbound = None;
            inner.connection_task = None;
            inner.active
        };
        info!("Sync channel disconnected: {}", reason);
        self.emit(ChannelEvent::Disconnected { reason });
        if should_reconnect {
            self.schedule_reconnect();
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageEntry;
    use crate::sync::connector::{MemoryConnector, MemoryPeer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Every probe takes 1.5 s and fails
    #[derive(Default)]
    struct SlowConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Connection> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            bail!("{}:{} refused", host, port)
        }
    }

    fn slow_discovery_channel() -> (Arc<SyncChannel>, Arc<SlowConnector>) {
        let connector = Arc::new(SlowConnector::default());
        let config = ChannelConfig {
            discovery: DiscoveryConfig {
                candidates: (1..=5).map(|n| format!("10.0.0.{n}")).collect(),
                ..Default::default()
            },
            ..Default::default()
        };
        (SyncChannel::new(config, connector.clone()), connector)
    }

    fn no_discovery() -> DiscoveryConfig {
        DiscoveryConfig {
            enabled: false,
            ..Default::default()
        }
    }

    fn channel_to(
        host: Option<&str>,
        discovery: DiscoveryConfig,
    ) -> (Arc<SyncChannel>, Arc<MemoryConnector>, UnboundedReceiver<MemoryPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let config = ChannelConfig {
            server_host: host.map(String::from),
            discovery,
            ..Default::default()
        };
        (SyncChannel::new(config, connector.clone()), connector, peers)
    }

    #[test]
    fn reconnect_delay_grows_linearly_then_caps() {
        let delays: Vec<u64> = (1..=8)
            .map(|n| reconnect_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![5_000, 10_000, 15_000, 20_000, 25_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(reconnect_delay(0), Duration::ZERO);
        assert_eq!(reconnect_delay(u32::MAX).as_millis(), 30_000);
    }

    #[tokio::test]
    async fn send_is_noop_while_disconnected() {
        let (channel, _connector, _peers) = channel_to(Some("192.168.1.50"), no_discovery());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(!channel.send(&OutboundMessage::network_status(true)));
    }

    #[tokio::test]
    async fn connects_to_explicit_host_and_sends() {
        let (channel, connector, mut peers) = channel_to(Some("192.168.1.50"), no_discovery());
        connector.set_reachable("192.168.1.50", true);

        assert!(channel.connect().await);
        assert!(channel.is_connected());
        assert_eq!(channel.connection_attempts(), 0);

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.host, "192.168.1.50");
        assert_eq!(peer.port, DEFAULT_PORT);

        let entries = vec![StorageEntry::new("a", "1")];
        assert!(channel.send(&OutboundMessage::storage_data(entries)));
        let value = peer.recv_json().await.unwrap();
        assert_eq!(value["type"], "STORAGE_DATA");
        assert_eq!(value["data"][0]["key"], "a");
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_schedules_single_reconnect() {
        let (channel, connector, _peers) = channel_to(Some("192.168.1.50"), no_discovery());

        assert!(!channel.connect().await);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.connection_attempts(), 1);
        assert!(channel.reconnect_pending());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(channel.connection_attempts(), 2);
        assert_eq!(connector.attempts().len(), 2);

        channel.close();
        assert!(!channel.reconnect_pending());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn host_close_triggers_backoff_reconnect() {
        let (channel, connector, mut peers) = channel_to(Some("192.168.1.50"), no_discovery());
        connector.set_reachable("192.168.1.50", true);
        let mut events = channel.subscribe();

        assert!(channel.connect().await);
        let first = peers.recv().await.unwrap();
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Connected { .. })));

        drop(first);
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Disconnected { .. })));
        assert_eq!(channel.connection_attempts(), 1);
        assert!(channel.reconnect_pending());

        let _second = peers.recv().await.unwrap();
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Connected { .. })));
        assert!(channel.is_connected());
        assert_eq!(channel.connection_attempts(), 0);
        assert!(!channel.reconnect_pending());
        channel.close();
    }

    #[tokio::test]
    async fn new_connect_replaces_existing_connection() {
        let (channel, connector, mut peers) = channel_to(Some("192.168.1.50"), no_discovery());
        connector.set_reachable("192.168.1.50", true);

        assert!(channel.connect().await);
        let mut first = peers.recv().await.unwrap();
        assert!(channel.connect().await);
        let _second = peers.recv().await.unwrap();

        assert!(first.recv().await.is_none());
        assert!(channel.is_connected());
        channel.close();
    }

    #[tokio::test]
    async fn discovery_adopts_first_reachable_candidate() {
        let discovery = DiscoveryConfig {
            candidates: vec!["10.0.2.2".into(), "127.0.0.1".into(), "192.168.1.100".into()],
            ..Default::default()
        };
        let (channel, connector, _peers) = channel_to(None, discovery);
        connector.set_reachable("127.0.0.1", true);
        connector.set_reachable("192.168.1.100", true);

        assert!(channel.connect().await);
        assert_eq!(channel.server_host().as_deref(), Some("127.0.0.1"));
        assert_eq!(
            connector.attempts(),
            vec!["10.0.2.2:12380", "127.0.0.1:12380"]
        );
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_waits_for_threshold() {
        let discovery = DiscoveryConfig {
            threshold: 1,
            candidates: vec!["127.0.0.1".into()],
            ..Default::default()
        };
        let (channel, connector, _peers) = channel_to(None, discovery);
        connector.set_reachable("127.0.0.1", true);

        assert!(!channel.connect().await);
        assert!(connector.attempts().is_empty());

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(channel.is_connected());
        assert_eq!(connector.attempts(), vec!["127.0.0.1:12380"]);
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_discovery_is_reported() {
        let discovery = DiscoveryConfig {
            candidates: vec!["10.0.2.2".into()],
            ..Default::default()
        };
        let (channel, _connector, _peers) = channel_to(None, discovery);
        let mut events = channel.subscribe();

        assert!(!channel.connect().await);
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::DiscoveryFailed);
        assert!(channel.reconnect_pending());
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_discovery_in_progress() {
        let (channel, connector) = slow_discovery_channel();

        channel.start_connect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Connecting);

        channel.close();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(!channel.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_connect_reports_failure() {
        let (channel, connector) = slow_discovery_channel();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        channel.close();

        assert!(!pending.await.unwrap());
        let probes = connector.attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), probes);
    }

    #[tokio::test]
    async fn malformed_inbound_is_ignored() {
        let (channel, connector, mut peers) = channel_to(Some("192.168.1.50"), no_discovery());
        connector.set_reachable("192.168.1.50", true);
        let mut events = channel.subscribe();

        assert!(channel.connect().await);
        let peer = peers.recv().await.unwrap();
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Connected { .. })));

        peer.send("not json");
        peer.send(r#"{"type":"UNKNOWN"}"#);
        peer.send(r#"{"type":"GET_STORAGE"}"#);
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Command(InboundCommand::GetStorage)
        );
        assert!(channel.is_connected());
        channel.close();
    }

    #[tokio::test]
    async fn close_flushes_queued_messages() {
        let (channel, connector, mut peers) = channel_to(Some("192.168.1.50"), no_discovery());
        connector.set_reachable("192.168.1.50", true);

        assert!(channel.connect().await);
        let mut peer = peers.recv().await.unwrap();
        assert!(channel.send(&OutboundMessage::network_status(false)));
        channel.close();

        let value = peer.recv_json().await.unwrap();
        assert_eq!(value["type"], "NETWORK_STATUS");
        assert!(peer.recv().await.is_none());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
