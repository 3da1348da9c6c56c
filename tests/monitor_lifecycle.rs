use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use rust_lib_debugmonitor::api::{DebugMonitor, MonitorConfig, StartOptions};
use rust_lib_debugmonitor::clients::{
    FetchError, FetchHandler, FetchRequest, FetchResponse, GlobalFetch, PipelineAdapter,
    PipelineClient, PipelineError, PipelineResponse, RequestConfig, XhrBackend, XhrClass,
    XhrEventKind, XhrTransportError, XhrWireRequest, XhrWireResponse,
};
use rust_lib_debugmonitor::models::NetworkEventType;
use rust_lib_debugmonitor::storage::MemoryStore;
use rust_lib_debugmonitor::sync::{DiscoveryConfig, MemoryConnector, MemoryPeer};

const HOST: &str = "192.168.1.50";
const WAIT: Duration = Duration::from_secs(5);

struct Api {
    release: Arc<Notify>,
}

#[async_trait]
impl FetchHandler for Api {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = request.url;
        match url.as_str() {
            "https://api.test/users" => Ok(FetchResponse::new(200, url.clone(), r#"[{"id":1}]"#)),
            "https://api.test/slow" => {
                self.release.notified().await;
                Ok(FetchResponse::new(200, url.clone(), "done"))
            }
            _ => Err(FetchError::new("offline")),
        }
    }
}

struct Echo;

#[async_trait]
impl XhrBackend for Echo {
    async fn execute(
        &self,
        request: XhrWireRequest,
    ) -> Result<XhrWireResponse, XhrTransportError> {
        Ok(XhrWireResponse {
            status: 200,
            url: request.url,
            body: Bytes::from_static(b"hello"),
        })
    }
}

struct Users;

#[async_trait]
impl PipelineAdapter for Users {
    async fn dispatch(&self, _config: RequestConfig) -> Result<PipelineResponse, PipelineError> {
        Ok(PipelineResponse::new(201, json!({"id": 7}))
            .with_header("Content-Type", "application/json"))
    }
}

struct Harness {
    monitor: DebugMonitor,
    fetch: Arc<GlobalFetch>,
    xhr: Arc<XhrClass>,
    release: Arc<Notify>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

fn harness(development_mode: bool) -> Harness {
    let (connector, peers) = MemoryConnector::new();
    connector.set_reachable(HOST, true);
    let release = Arc::new(Notify::new());
    let fetch = GlobalFetch::new(Arc::new(Api {
        release: release.clone(),
    }));
    let xhr = XhrClass::native(Arc::new(Echo));
    let config = MonitorConfig {
        development_mode,
        discovery: DiscoveryConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let monitor = DebugMonitor::builder()
        .config(config)
        .store(Arc::new(MemoryStore::with_entries([("a", "1"), ("b", "2")])))
        .xhr(xhr.clone())
        .fetch(fetch.clone())
        .connector(connector)
        .build();
    Harness {
        monitor,
        fetch,
        xhr,
        release,
        peers,
    }
}

/// Start against the reachable host and consume the greeting messages
async fn start_connected(harness: &mut Harness) -> MemoryPeer {
    assert!(
        harness
            .monitor
            .start(StartOptions::default().with_server_ip(HOST))
            .await
    );
    let mut peer = timeout(WAIT, harness.peers.recv()).await.unwrap().unwrap();
    assert_eq!(peer.host, HOST);
    next_of(&mut peer, "STORAGE_DATA").await;
    next_of(&mut peer, "NETWORK_STATUS").await;
    peer
}

async fn next_of(peer: &mut MemoryPeer, message_type: &str) -> Value {
    timeout(WAIT, peer.recv_type(message_type))
        .await
        .expect("timed out waiting for message")
        .expect("peer closed")
}

async fn next_event(peer: &mut MemoryPeer, event_type: &str) -> Value {
    loop {
        let message = next_of(peer, "NETWORK_EVENT").await;
        if message["eventType"] == event_type {
            return message;
        }
    }
}

fn entries(message: &Value) -> Vec<(String, String)> {
    message["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["key"].as_str().unwrap().to_string(),
                e["value"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn start_announces_storage_and_monitoring_status() {
    let mut harness = harness(true);
    assert!(
        harness
            .monitor
            .start(StartOptions::default().with_server_ip(HOST))
            .await
    );
    let mut peer = timeout(WAIT, harness.peers.recv()).await.unwrap().unwrap();

    let storage = timeout(WAIT, peer.recv_json()).await.unwrap().unwrap();
    assert_eq!(storage["type"], "STORAGE_DATA");
    assert_eq!(
        entries(&storage),
        vec![("a".into(), "1".into()), ("b".into(), "2".into())]
    );

    let status = timeout(WAIT, peer.recv_json()).await.unwrap().unwrap();
    assert_eq!(status, json!({"type": "NETWORK_STATUS", "data": {"monitoring": true}}));

    assert!(!harness.monitor.start(StartOptions::default()).await);
    assert!(harness.monitor.is_started());
}

#[tokio::test]
async fn fetch_calls_are_streamed_to_host() {
    let mut harness = harness(true);
    let mut peer = start_connected(&mut harness).await;

    let response = harness
        .fetch
        .fetch(FetchRequest::get("https://api.test/users"))
        .await
        .unwrap();
    assert_eq!(response.text().unwrap(), r#"[{"id":1}]"#);

    let started = next_event(&mut peer, "REQUEST_STARTED").await;
    assert_eq!(started["data"]["method"], "GET");
    assert_eq!(started["data"]["url"], "https://api.test/users");

    let completed = next_event(&mut peer, "REQUEST_COMPLETED").await;
    assert_eq!(completed["data"]["id"], started["data"]["id"]);
    assert_eq!(completed["data"]["status"], 200);
    assert_eq!(completed["data"]["responseType"], "json");
}

#[tokio::test]
async fn failed_fetch_is_reported_and_rethrown_unchanged() {
    let mut harness = harness(true);
    let mut peer = start_connected(&mut harness).await;

    let error = harness
        .fetch
        .fetch(FetchRequest::get("https://api.test/down"))
        .await
        .unwrap_err();
    assert_eq!(error, FetchError::new("offline"));

    let failed = next_event(&mut peer, "REQUEST_FAILED").await;
    assert_eq!(failed["data"]["status"], 0);
    assert_eq!(failed["data"]["error"], "offline");
    assert!(harness.monitor.pending_requests().is_empty());
}

#[tokio::test]
async fn every_started_call_reaches_one_terminal_event() {
    let harness = harness(true);
    let mut events = harness.monitor.registry().subscribe();
    assert!(harness.monitor.start(StartOptions::default()).await);

    for url in ["https://api.test/users", "https://api.test/down"].repeat(3) {
        let _ = harness.fetch.fetch(FetchRequest::get(url)).await;
    }

    let mut started = 0;
    let mut terminal = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == NetworkEventType::RequestStarted {
            started += 1;
        } else if event.event_type.is_terminal() {
            terminal += 1;
        }
    }
    assert_eq!(started, 6);
    assert_eq!(terminal, 6);
}

#[tokio::test]
async fn callback_requests_are_reported_once() {
    let mut harness = harness(true);
    let mut peer = start_connected(&mut harness).await;
    let mut events = harness.monitor.registry().subscribe();

    let (loaded_tx, mut loaded_rx) = mpsc::unbounded_channel();
    let request = harness.xhr.create();
    request.open("get", "https://api.test/profile");
    request.add_event_listener(XhrEventKind::Load, move |xhr| {
        let _ = loaded_tx.send(xhr.response_text());
    });
    request.send(None);

    let body = timeout(WAIT, loaded_rx.recv()).await.unwrap().unwrap();
    assert_eq!(body, "hello");

    let completed = next_event(&mut peer, "REQUEST_COMPLETED").await;
    assert_eq!(completed["data"]["url"], "https://api.test/profile");
    assert_eq!(completed["data"]["responseBody"], "hello");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(
        seen,
        vec![NetworkEventType::RequestStarted, NetworkEventType::RequestCompleted]
    );
    assert!(harness.monitor.registry().is_empty());
}

#[tokio::test]
async fn pipeline_clients_are_monitored() {
    let mut harness = harness(true);
    let client = Arc::new(PipelineClient::new(Arc::new(Users)));
    assert!(harness.monitor.add_pipeline_client(client.clone()));
    let mut peer = start_connected(&mut harness).await;

    let response = client.post("https://api.test/users", json!({"name": "ada"})).await.unwrap();
    assert_eq!(response.status, 201);

    let started = next_event(&mut peer, "REQUEST_STARTED").await;
    assert_eq!(started["data"]["method"], "POST");
    let completed = next_event(&mut peer, "REQUEST_COMPLETED").await;
    assert_eq!(completed["data"]["status"], 201);
}

#[tokio::test]
async fn host_edits_storage_and_receives_fresh_snapshot() {
    let mut harness = harness(true);
    let mut peer = start_connected(&mut harness).await;

    assert!(peer.send(
        json!({"type": "UPDATE_VALUE", "data": {"key": "a", "value": "9"}}).to_string()
    ));
    let snapshot = next_of(&mut peer, "STORAGE_DATA").await;
    assert_eq!(
        entries(&snapshot),
        vec![("a".into(), "9".into()), ("b".into(), "2".into())]
    );

    assert!(peer.send(r#"{"type":"DELETE_VALUE","data":{"key":"b"}}"#));
    let snapshot = next_of(&mut peer, "STORAGE_DATA").await;
    assert_eq!(entries(&snapshot), vec![("a".into(), "9".into())]);
}

#[tokio::test]
async fn refresh_command_replays_pending_calls() {
    let mut harness = harness(true);
    let mut peer = start_connected(&mut harness).await;

    let fetch = harness.fetch.clone();
    let slow = tokio::spawn(async move { fetch.fetch(FetchRequest::get("https://api.test/slow")).await });
    next_event(&mut peer, "REQUEST_STARTED").await;
    assert_eq!(harness.monitor.pending_requests().len(), 1);

    assert!(peer.send(r#"{"type":"REQUEST_REFRESH"}"#));
    let refresh = next_event(&mut peer, "REQUEST_REFRESH").await;
    assert_eq!(refresh["data"], json!({}));
    let pending = next_event(&mut peer, "REQUEST_PENDING").await;
    assert_eq!(pending["data"]["url"], "https://api.test/slow");

    harness.release.notify_one();
    assert_eq!(slow.await.unwrap().unwrap().status, 200);
    next_event(&mut peer, "REQUEST_COMPLETED").await;

    assert!(peer.send(r#"{"type":"CLEAR_NETWORK_HISTORY"}"#));
    let cleared = next_event(&mut peer, "CLEAR_NETWORK_HISTORY").await;
    assert_eq!(cleared["data"], json!({}));
}

#[tokio::test]
async fn stop_restores_every_surface() {
    let mut harness = harness(true);
    let fetch_before = harness.fetch.handler();
    let xhr_before = harness.xhr.prototype();
    let mut peer = start_connected(&mut harness).await;

    assert!(!Arc::ptr_eq(&fetch_before, &harness.fetch.handler()));
    assert!(!Arc::ptr_eq(&xhr_before, &harness.xhr.prototype()));

    assert!(harness.monitor.stop());
    assert!(!harness.monitor.stop());
    assert!(Arc::ptr_eq(&fetch_before, &harness.fetch.handler()));
    assert!(Arc::ptr_eq(&xhr_before, &harness.xhr.prototype()));

    let status = next_of(&mut peer, "NETWORK_STATUS").await;
    assert_eq!(status["data"]["monitoring"], false);
    assert_eq!(timeout(WAIT, peer.recv()).await.unwrap(), None);

    let mut events = harness.monitor.registry().subscribe();
    let response = harness
        .fetch
        .fetch(FetchRequest::get("https://api.test/users"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn dropping_the_monitor_removes_passive_observer() {
    let (connector, _peers) = MemoryConnector::new();
    let xhr = XhrClass::native(Arc::new(Echo));
    let native = xhr.prototype();

    let monitor = DebugMonitor::builder()
        .config(MonitorConfig {
            development_mode: true,
            ..Default::default()
        })
        .xhr(xhr.clone())
        .connector(connector)
        .build();
    assert!(!Arc::ptr_eq(&native, &xhr.prototype()));
    assert!(!monitor.enable_passive_capture());

    drop(monitor);
    assert!(Arc::ptr_eq(&native, &xhr.prototype()));
}

#[tokio::test]
async fn outside_development_mode_nothing_is_installed() {
    let harness = harness(false);
    let before = harness.fetch.handler();

    assert!(!harness.monitor.start(StartOptions::default()).await);
    assert!(!harness.monitor.is_started());
    assert!(Arc::ptr_eq(&before, &harness.fetch.handler()));
}
