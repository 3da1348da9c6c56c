//! Adapter for the global fetch function

use super::{classify_text, stringify_json, PendingCall, RequestTracker, SurfaceAdapter};
use crate::clients::{
    FetchBody, FetchError, FetchHandler, FetchRequest, FetchResponse, GlobalFetch,
};
use crate::models::{RequestOutcome, RESPONSE_TYPE_UNKNOWN};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

pub struct FetchInterceptor {
    surface: Arc<GlobalFetch>,
    tracker: Arc<RequestTracker>,
    original: Mutex<Option<Arc<dyn FetchHandler>>>,
}

impl FetchInterceptor {
    pub fn new(surface: Arc<GlobalFetch>, tracker: Arc<RequestTracker>) -> Self {
        Self {
            surface,
            tracker,
            original: Mutex::new(None),
        }
    }
}

impl SurfaceAdapter for FetchInterceptor {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn install(&self) -> bool {
        let mut original = self.original.lock().unwrap_or_else(PoisonError::into_inner);
        if original.is_some() {
            return false;
        }
        let tracker = Arc::clone(&self.tracker);
        let previous = self.surface.wrap_handler(move |inner| {
            Arc::new(MonitoredFetch { inner, tracker }) as Arc<dyn FetchHandler>
        });
        *original = Some(previous);
        true
    }

    fn uninstall(&self) -> bool {
        let mut original = self.original.lock().unwrap_or_else(PoisonError::into_inner);
        match original.take() {
            Some(previous) => {
                self.surface.replace_handler(previous);
                true
            }
            None => false,
        }
    }

    fn is_installed(&self) -> bool {
        self.original
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct MonitoredFetch {
    inner: Arc<dyn FetchHandler>,
    tracker: Arc<RequestTracker>,
}

#[async_trait]
impl FetchHandler for MonitoredFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut record = self
            .tracker
            .draft(request.method.as_deref().unwrap_or("GET"), &request.url);
        record.headers = request.headers.iter().cloned().collect();
        record.request_body = request.body.as_ref().map(capture_body);
        let id = record.id;
        let pending = self
            .tracker
            .begin(record)
            .then(|| PendingCall::new(Arc::clone(&self.tracker), id));

        let result = self.inner.fetch(request).await;
        if let Some(pending) = pending {
            let outcome = match &result {
                Ok(response) => completed(response),
                Err(err) => RequestOutcome::Failed {
                    status: 0,
                    error: if err.message.is_empty() {
                        "Network Error".to_string()
                    } else {
                        err.message.clone()
                    },
                    response_body: None,
                },
            };
            pending.settle(outcome);
        }
        result
    }
}

/// Read a copy of the body, leaving the caller's response untouched
fn completed(response: &FetchResponse) -> RequestOutcome {
    let (response_body, response_type) = match response.clone().text() {
        Ok(text) => {
            let hint = classify_text(&text);
            (Value::String(text), hint.to_string())
        }
        Err(_) => (
            Value::String("[unreadable response]".to_string()),
            RESPONSE_TYPE_UNKNOWN.to_string(),
        ),
    };
    RequestOutcome::Completed {
        status: response.status,
        response_body: Some(response_body),
        response_type,
    }
}

fn capture_body(body: &FetchBody) -> Value {
    match body {
        FetchBody::Text(text) => Value::String(text.clone()),
        FetchBody::Json(value) => stringify_json(value),
        FetchBody::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String("[binary body]".to_string()),
        },
    }
}
