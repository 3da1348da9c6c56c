//! Transport seam for the sync channel

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

pub type MessageSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// An open text-message connection
pub struct Connection {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Connection>;
}

/// `ws://host:port` transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Connection> {
        let url = format!("ws://{}:{}", host, port);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let (write, read) = ws_stream.split();

        let sink = write.with(|text: String| {
            future::ready(Ok::<Message, anyhow::Error>(Message::Text(text)))
        });
        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(String::from_utf8(data).map_err(anyhow::Error::from)),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::from(e))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Host side of an in-memory connection
pub struct MemoryPeer {
    pub host: String,
    pub port: u16,
    to_device: fmpsc::UnboundedSender<String>,
    from_device: fmpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Send a raw text frame to the device
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_device.unbounded_send(text.into()).is_ok()
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.from_device.next().await
    }

    /// Next frame parsed as JSON; unparsable frames are skipped
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(text) = self.recv().await {
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
        None
    }

    /// Next envelope whose `type` matches
    pub async fn recv_type(&mut self, message_type: &str) -> Option<Value> {
        while let Some(value) = self.recv_json().await {
            if value["type"] == message_type {
                return Some(value);
            }
        }
        None
    }
}

/// In-process transport where reachability is set per host
pub struct MemoryConnector {
    reachable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    /// Returns the connector and the stream of accepted peers
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            reachable: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
            peers,
        });
        (connector, accepted)
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut hosts = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// Every `host:port` a connection was attempted to, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Connection> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}:{}", host, port));
        let reachable = self
            .reachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(host);
        if !reachable {
            bail!("connection refused by {}:{}", host, port);
        }

        let (device_tx, from_device) = fmpsc::unbounded();
        let (to_device, device_rx) = fmpsc::unbounded();
        self.peers
            .send(MemoryPeer {
                host: host.to_string(),
                port,
                to_device,
                from_device,
            })
            .map_err(|_| anyhow!("memory listener is gone"))?;

        Ok(Connection {
            sink: Box::pin(device_tx.sink_map_err(anyhow::Error::from)),
            stream: Box::pin(device_rx.map(Ok::<String, anyhow::Error>)),
        })
    }
}
