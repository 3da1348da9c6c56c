//! Wire protocol envelopes
//!
//! Every message exchanged with the desktop host is a JSON object tagged by
//! its `type` field.

use crate::models::RequestRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One key/value pair of a storage snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: String,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Payload of a `DELETE_VALUE` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKey {
    pub key: String,
}

/// Lifecycle events reported for observed calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkEventType {
    RequestStarted,
    RequestCompleted,
    RequestFailed,
    RequestAborted,
    RequestPending,
    RequestRefresh,
    ClearNetworkHistory,
}

impl NetworkEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkEventType::RequestStarted => "REQUEST_STARTED",
            NetworkEventType::RequestCompleted => "REQUEST_COMPLETED",
            NetworkEventType::RequestFailed => "REQUEST_FAILED",
            NetworkEventType::RequestAborted => "REQUEST_ABORTED",
            NetworkEventType::RequestPending => "REQUEST_PENDING",
            NetworkEventType::RequestRefresh => "REQUEST_REFRESH",
            NetworkEventType::ClearNetworkHistory => "CLEAR_NETWORK_HISTORY",
        }
    }

    /// Whether this event ends a record's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NetworkEventType::RequestCompleted
                | NetworkEventType::RequestFailed
                | NetworkEventType::RequestAborted
        )
    }
}

/// Data attached to a `NETWORK_EVENT` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Request(Box<RequestRecord>),
    Empty(Map<String, Value>),
}

/// Payload of a `NETWORK_STATUS` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub monitoring: bool,
}

/// Messages sent from the device to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    StorageData {
        data: Vec<StorageEntry>,
    },
    NetworkEvent {
        #[serde(rename = "eventType")]
        event_type: NetworkEventType,
        data: EventData,
    },
    NetworkStatus {
        data: NetworkStatus,
    },
}

impl OutboundMessage {
    pub fn storage_data(data: Vec<StorageEntry>) -> Self {
        OutboundMessage::StorageData { data }
    }

    pub fn network_event(event_type: NetworkEventType, record: RequestRecord) -> Self {
        OutboundMessage::NetworkEvent {
            event_type,
            data: EventData::Request(Box::new(record)),
        }
    }

    /// Network event carrying an empty `{}` payload
    pub fn network_signal(event_type: NetworkEventType) -> Self {
        OutboundMessage::NetworkEvent {
            event_type,
            data: EventData::Empty(Map::new()),
        }
    }

    pub fn network_status(monitoring: bool) -> Self {
        OutboundMessage::NetworkStatus {
            data: NetworkStatus { monitoring },
        }
    }
}

/// Commands received from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundCommand {
    GetStorage,
    UpdateValue { data: StorageEntry },
    DeleteValue { data: StorageKey },
    ClearAllStorage,
    RequestRefresh,
    ClearNetworkHistory,
}

impl InboundCommand {
    /// Whether the command targets the storage mirror
    pub fn is_storage_command(&self) -> bool {
        matches!(
            self,
            InboundCommand::GetStorage
                | InboundCommand::UpdateValue { .. }
                | InboundCommand::DeleteValue { .. }
                | InboundCommand::ClearAllStorage
        )
    }
}
