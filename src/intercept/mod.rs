//! Interception adapters
//!
//! Each adapter wraps one client surface, reports calls to the pending
//! request registry and hands results and errors back to the caller
//! unchanged. Installing remembers the original implementation; uninstalling
//! puts it back.

pub mod fetch;
pub mod passive;
pub mod pipeline;
pub mod xhr;

pub use fetch::FetchInterceptor;
pub use passive::PassiveXhrObserver;
pub use pipeline::{AttachError, PipelineInterceptor};
pub use xhr::XhrInterceptor;

use crate::models::{RequestOutcome, RequestRecord};
use crate::registry::PendingRequestRegistry;
use serde::de::IgnoredAny;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Marks a request object as tracked under the given id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag(pub u64);

/// Common lifecycle for adapters that replace a surface implementation
pub trait SurfaceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wrap the surface. Returns `false` if already installed.
    fn install(&self) -> bool;

    /// Restore the original. Returns `false` if not installed.
    fn uninstall(&self) -> bool;

    fn is_installed(&self) -> bool;
}

/// Id allocation plus registry access shared by all adapters
pub struct RequestTracker {
    next_id: AtomicU64,
    registry: Arc<PendingRequestRegistry>,
}

impl RequestTracker {
    pub fn new(registry: Arc<PendingRequestRegistry>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<PendingRequestRegistry> {
        &self.registry
    }

    /// Allocate the next request id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// New record with a fresh id, not yet registered
    pub fn draft(&self, method: &str, url: &str) -> RequestRecord {
        RequestRecord::new(self.next_id(), method, url)
    }

    pub fn begin(&self, record: RequestRecord) -> bool {
        self.registry.begin(record)
    }

    pub fn complete(&self, id: u64, outcome: RequestOutcome) -> Option<RequestRecord> {
        self.registry.complete(id, outcome)
    }
}

/// A begun record that has not settled yet.
///
/// Dropping it unsettled, e.g. when the caller drops the call's future,
/// completes the record as aborted.
pub(crate) struct PendingCall {
    tracker: Arc<RequestTracker>,
    id: u64,
    settled: AtomicBool,
}

impl PendingCall {
    pub(crate) fn new(tracker: Arc<RequestTracker>, id: u64) -> Self {
        Self {
            tracker,
            id,
            settled: AtomicBool::new(false),
        }
    }

    /// Report the terminal outcome; later calls are ignored
    pub(crate) fn settle(&self, outcome: RequestOutcome) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.tracker.complete(self.id, outcome);
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            tracing::debug!("request {} dropped before settling", self.id);
            self.settle(RequestOutcome::Aborted);
        }
    }
}

/// Placeholder stored for bodies that cannot be rendered as text
pub(crate) fn body_placeholder(kind: &str) -> Value {
    Value::String(format!("[{kind} data]"))
}

/// Serialize a structured body into its JSON text
pub(crate) fn stringify_json(value: &Value) -> Value {
    match serde_json::to_string(value) {
        Ok(text) => Value::String(text),
        Err(err) => {
            tracing::debug!("could not serialize body: {}", err);
            Value::String("[complex body]".to_string())
        }
    }
}

/// Classify a response body as json or text
pub(crate) fn classify_text(text: &str) -> &'static str {
    if serde_json::from_str::<IgnoredAny>(text).is_ok() {
        crate::models::RESPONSE_TYPE_JSON
    } else {
        crate::models::RESPONSE_TYPE_TEXT
    }
}
