//! Adapter for the callback-style client
//!
//! The wrapped prototype records method and URL on `open`, collects headers,
//! registers the record on `send` and settles it from `Load`, `Error` or
//! `Abort`. Listeners the application registers still fire as before.

use super::{body_placeholder, stringify_json, RequestTag, RequestTracker, SurfaceAdapter};
use crate::clients::{Xhr, XhrClass, XhrEventKind, XhrListener, XhrPrototype, XhrResponseType};
use crate::models::{RequestOutcome, RequestRecord};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// Record being assembled between `open` and `send`
#[derive(Clone)]
struct DraftRecord(RequestRecord);

pub struct XhrInterceptor {
    class: Arc<XhrClass>,
    tracker: Arc<RequestTracker>,
    original: Mutex<Option<Arc<dyn XhrPrototype>>>,
}

impl XhrInterceptor {
    pub fn new(class: Arc<XhrClass>, tracker: Arc<RequestTracker>) -> Self {
        Self {
            class,
            tracker,
            original: Mutex::new(None),
        }
    }
}

impl SurfaceAdapter for XhrInterceptor {
    fn name(&self) -> &'static str {
        "xhr"
    }

    fn install(&self) -> bool {
        let mut original = self.original.lock().unwrap_or_else(PoisonError::into_inner);
        if original.is_some() {
            return false;
        }
        let tracker = Arc::clone(&self.tracker);
        let previous = self.class.wrap_prototype(move |inner| {
            Arc::new(MonitoredXhr { inner, tracker }) as Arc<dyn XhrPrototype>
        });
        *original = Some(previous);
        true
    }

    fn uninstall(&self) -> bool {
        let mut original = self.original.lock().unwrap_or_else(PoisonError::into_inner);
        match original.take() {
            Some(previous) => {
                self.class.replace_prototype(previous);
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

struct MonitoredXhr {
    inner: Arc<dyn XhrPrototype>,
    tracker: Arc<RequestTracker>,
}

impl MonitoredXhr {
    fn watch(&self, xhr: &Xhr, id: u64) {
        for kind in [XhrEventKind::Load, XhrEventKind::Error, XhrEventKind::Abort] {
            let tracker = Arc::clone(&self.tracker);
            let listener: XhrListener = Arc::new(move |xhr: &Xhr| {
                tracker.complete(id, outcome_for(kind, xhr));
            });
            self.inner.add_event_listener(xhr, kind, listener);
        }
    }
}

impl XhrPrototype for MonitoredXhr {
    fn open(&self, xhr: &Xhr, method: &str, url: &str) {
        let draft = self.tracker.draft(method, url);
        xhr.with_extensions(|ext| {
            ext.remove::<RequestTag>();
            ext.insert(DraftRecord(draft));
        });
        self.inner.open(xhr, method, url);
    }

    fn set_request_header(&self, xhr: &Xhr, name: &str, value: &str) {
        xhr.with_extensions(|ext| {
            if let Some(DraftRecord(record)) = ext.get_mut::<DraftRecord>() {
                record.headers.insert(name.to_string(), value.to_string());
            }
        });
        self.inner.set_request_header(xhr, name, value);
    }

    fn send(&self, xhr: &Xhr, body: Option<String>) {
        if let Some(DraftRecord(mut record)) = xhr.with_extensions(|ext| ext.remove::<DraftRecord>())
        {
            record.request_body = body.clone().map(Value::String);
            let id = record.id;
            if self.tracker.begin(record) {
                xhr.with_extensions(|ext| {
                    ext.insert(RequestTag(id));
                });
                self.watch(xhr, id);
            }
        }
        self.inner.send(xhr, body);
    }

    fn add_event_listener(&self, xhr: &Xhr, kind: XhrEventKind, listener: XhrListener) {
        self.inner.add_event_listener(xhr, kind, listener);
    }
}

fn outcome_for(kind: XhrEventKind, xhr: &Xhr) -> RequestOutcome {
    match kind {
        XhrEventKind::Load => {
            let (response_body, response_type) = capture_response(xhr);
            RequestOutcome::Completed {
                status: xhr.status(),
                response_body: Some(response_body),
                response_type,
            }
        }
        XhrEventKind::Error => RequestOutcome::Failed {
            status: 0,
            error: "Network Error".to_string(),
            response_body: None,
        },
        XhrEventKind::Abort => RequestOutcome::Aborted,
    }
}

/// Body and type hint according to the declared response type
pub(crate) fn capture_response(xhr: &Xhr) -> (Value, String) {
    match xhr.response_type() {
        XhrResponseType::Default | XhrResponseType::Text => (
            Value::String(xhr.response_text()),
            crate::models::RESPONSE_TYPE_TEXT.to_string(),
        ),
        XhrResponseType::Json => (
            stringify_json(&xhr.response_json().unwrap_or(Value::Null)),
            crate::models::RESPONSE_TYPE_JSON.to_string(),
        ),
        other => (body_placeholder(other.as_str()), other.as_str().to_string()),
    }
}
