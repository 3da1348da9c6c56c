//! Request record model
//!
//! Represents a single HTTP-like call observed by one of the interception
//! adapters.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Response type hint used when the body is JSON
pub const RESPONSE_TYPE_JSON: &str = "json";
/// Response type hint used when the body is plain text
pub const RESPONSE_TYPE_TEXT: &str = "text";
/// Response type hint used when the body could not be read
pub const RESPONSE_TYPE_UNKNOWN: &str = "unknown";

/// Current wall-clock time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Canonical representation of one observed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Identifier assigned at interception time
    pub id: u64,

    /// Uppercased HTTP method
    pub method: String,

    /// Target URL
    pub url: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// When the call started (milliseconds since epoch)
    pub start_time: i64,

    /// When the call settled; `None` while pending
    pub end_time: Option<i64>,

    /// HTTP status; 0 until known or on transport failure
    pub status: u16,

    /// Request body (if captured)
    pub request_body: Option<Value>,

    /// Response body (if captured)
    pub response_body: Option<Value>,

    /// Body classification hint
    pub response_type: String,

    /// Failure message for failed or aborted calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    /// Create a new pending record stamped with the current time
    pub fn new(id: u64, method: &str, url: &str) -> Self {
        Self {
            id,
            method: normalize_method(method),
            url: url.to_string(),
            headers: HashMap::new(),
            start_time: now_millis(),
            end_time: None,
            status: 0,
            request_body: None,
            response_body: None,
            response_type: String::new(),
            error: None,
        }
    }

    /// Whether a terminal outcome has been merged into this record
    pub fn is_settled(&self) -> bool {
        self.end_time.is_some()
    }

    /// Elapsed time in milliseconds, if settled
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).max(0))
    }

    /// Merge a terminal outcome into the record
    pub fn settle(&mut self, outcome: RequestOutcome) {
        self.end_time = Some(now_millis());
        match outcome {
            RequestOutcome::Completed {
                status,
                response_body,
                response_type,
            } => {
                self.status = status;
                self.response_body = response_body;
                self.response_type = response_type;
            }
            RequestOutcome::Failed {
                status,
                error,
                response_body,
            } => {
                self.status = status;
                self.error = Some(error);
                self.response_body = response_body;
            }
            RequestOutcome::Aborted => {
                self.status = 0;
                self.error = Some("Aborted".to_string());
            }
        }
    }
}

/// Uppercase a method name, defaulting to GET when empty
pub fn normalize_method(method: &str) -> String {
    let trimmed = method.trim();
    if trimmed.is_empty() {
        "GET".to_string()
    } else {
        trimmed.to_ascii_uppercase()
    }
}

/// Terminal outcome of an observed call
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The call produced a response
    Completed {
        status: u16,
        response_body: Option<Value>,
        response_type: String,
    },
    /// The call failed (transport error or rejected response)
    Failed {
        status: u16,
        error: String,
        response_body: Option<Value>,
    },
    /// The call was cancelled by the application
    Aborted,
}

impl RequestOutcome {
    /// Network event type reported for this outcome
    pub fn event_type(&self) -> crate::models::NetworkEventType {
        use crate::models::NetworkEventType;
        match self {
            RequestOutcome::Completed { .. } => NetworkEventType::RequestCompleted,
            RequestOutcome::Failed { .. } => NetworkEventType::RequestFailed,
            RequestOutcome::Aborted => NetworkEventType::RequestAborted,
        }
    }
}
