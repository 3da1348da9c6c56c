//! Storage mirror
//!
//! Reads full snapshots of the key-value store, pushes them to the host and
//! applies the host's edits. Every successful edit is followed by a fresh
//! snapshot so the host view never drifts.

use super::KeyValueStore;
use crate::models::{InboundCommand, OutboundMessage, StorageEntry};
use crate::sync::SyncChannel;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct StorageMirror {
    store: Arc<dyn KeyValueStore>,
    channel: Arc<SyncChannel>,
}

impl StorageMirror {
    pub fn new(store: Arc<dyn KeyValueStore>, channel: Arc<SyncChannel>) -> Self {
        Self { store, channel }
    }

    /// Every key with its value; an empty list if the store fails
    pub async fn snapshot(&self) -> Vec<StorageEntry> {
        match self.read_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Error reading storage snapshot: {:#}", e);
                Vec::new()
            }
        }
    }

    async fn read_all(&self) -> anyhow::Result<Vec<StorageEntry>> {
        let keys = self.store.keys().await?;
        let values = try_join_all(keys.iter().map(|key| self.store.get(key))).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .map(|(key, value)| StorageEntry {
                key,
                value: value.unwrap_or_default(),
            })
            .collect())
    }

    /// Send a snapshot if the channel is connected
    pub async fn push_snapshot(&self) -> bool {
        if !self.channel.is_connected() {
            return false;
        }
        let entries = self.snapshot().await;
        self.channel.send(&OutboundMessage::storage_data(entries))
    }

    pub async fn set_value(&self, key: &str, value: &str) -> bool {
        match self.store.set(key, value).await {
            Ok(()) => {
                info!("Updated storage key {}", key);
                self.push_snapshot().await;
                true
            }
            Err(e) => {
                error!("Error updating storage key {}: {:#}", key, e);
                false
            }
        }
    }

    pub async fn remove_value(&self, key: &str) -> bool {
        match self.store.remove(key).await {
            Ok(()) => {
                info!("Removed storage key {}", key);
                self.push_snapshot().await;
                true
            }
            Err(e) => {
                error!("Error removing storage key {}: {:#}", key, e);
                false
            }
        }
    }

    pub async fn clear_all(&self) -> bool {
        match self.store.clear().await {
            Ok(()) => {
                info!("Cleared storage");
                self.push_snapshot().await;
                true
            }
            Err(e) => {
                error!("Error clearing storage: {:#}", e);
                false
            }
        }
    }

    /// Apply a storage command from the host
    pub async fn handle(&self, command: &InboundCommand) -> bool {
        match command {
            InboundCommand::GetStorage => self.push_snapshot().await,
            InboundCommand::UpdateValue { data } => {
                if data.key.is_empty() {
                    warn!("Ignoring UPDATE_VALUE without a key");
                    return false;
                }
                self.set_value(&data.key, &data.value).await
            }
            InboundCommand::DeleteValue { data } => self.remove_value(&data.key).await,
            InboundCommand::ClearAllStorage => self.clear_all().await,
            InboundCommand::RequestRefresh | InboundCommand::ClearNetworkHistory => false,
        }
    }
}
