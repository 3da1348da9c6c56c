//! Pending request registry
//!
//! Tracks every observed call between its start and its terminal event and
//! broadcasts lifecycle events to subscribers. The registry is the only
//! component that declares a record terminal.

use crate::models::{NetworkEventType, RequestOutcome, RequestRecord};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Lifecycle event emitted by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub event_type: NetworkEventType,
    pub record: RequestRecord,
}

/// In-flight calls keyed by request id
pub struct PendingRequestRegistry {
    pending: Mutex<BTreeMap<u64, RequestRecord>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for PendingRequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pending: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert a new pending record and emit `REQUEST_STARTED`.
    ///
    /// Returns `false` without touching the existing entry when the id is
    /// already pending.
    pub fn begin(&self, record: RequestRecord) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            tracing::error!("pending registry lock poisoned; dropping request {}", record.id);
            return false;
        };
        if pending.contains_key(&record.id) {
            tracing::warn!("request id {} is already pending; ignoring begin", record.id);
            return false;
        }
        pending.insert(record.id, record.clone());
        // Emit while holding the lock so a concurrent `complete` cannot
        // overtake the start event.
        self.emit(NetworkEventType::RequestStarted, record);
        true
    }

    /// Look up a pending record
    pub fn get(&self, id: u64) -> Option<RequestRecord> {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.get(&id).cloned())
    }

    /// Merge the terminal outcome, remove the entry and emit the terminal event
    pub fn complete(&self, id: u64, outcome: RequestOutcome) -> Option<RequestRecord> {
        let event_type = outcome.event_type();
        let mut pending = self.pending.lock().ok()?;
        let Some(mut record) = pending.remove(&id) else {
            tracing::debug!("request {} is not pending; ignoring {}", id, event_type.as_str());
            return None;
        };
        record.settle(outcome);
        self.emit(event_type, record.clone());
        Some(record)
    }

    /// Report a call that was only seen after it finished
    pub fn observe_completed(&self, record: RequestRecord) {
        self.emit(NetworkEventType::RequestCompleted, record);
    }

    /// Snapshot of all pending records, ordered by id
    pub fn list(&self) -> Vec<RequestRecord> {
        self.pending
            .lock()
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every pending entry without emitting terminal events
    pub fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, event_type: NetworkEventType, record: RequestRecord) {
        // No subscribers is not an error.
        let _ = self.events.send(RegistryEvent { event_type, record });
    }
}
