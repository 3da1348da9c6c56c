//! Passive completion observer
//!
//! Catches callback-style requests that were created before the active
//! adapter was installed. The observer piggybacks on the first `Load`
//! listener an application registers and reports the call as already
//! completed. Requests owned by the active adapter carry a [`RequestTag`]
//! and are skipped, so no call is reported twice.

use super::xhr::capture_response;
use super::{RequestTag, RequestTracker, SurfaceAdapter};
use crate::clients::{Xhr, XhrClass, XhrEventKind, XhrListener, XhrPrototype};
use crate::models::{now_millis, RequestRecord};
use std::sync::{Arc, Mutex, PoisonError};

/// Start time is unknown for passively observed calls
const ASSUMED_DURATION_MS: i64 = 1_000;

/// Set once the observer listener is attached to a request
#[derive(Clone, Copy)]
struct Observed;

pub struct PassiveXhrObserver {
    class: Arc<XhrClass>,
    tracker: Arc<RequestTracker>,
    original: Mutex<Option<Arc<dyn XhrPrototype>>>,
}

impl PassiveXhrObserver {
    pub fn new(class: Arc<XhrClass>, tracker: Arc<RequestTracker>) -> Self {
        Self {
            class,
            tracker,
            original: Mutex::new(None),
        }
    }
}

impl SurfaceAdapter for PassiveXhrObserver {
    fn name(&self) -> &'static str {
        "passive-xhr"
    }

    fn install(&self) -> bool {
        let mut original = self.original.lock().unwrap_or_else(PoisonError::into_inner);
        if original.is_some() {
            return false;
        }
        let tracker = Arc::clone(&self.tracker);
        let previous = self.class.wrap_prototype(move |inner| {
            Arc::new(PassiveXhr { inner, tracker }) as Arc<dyn XhrPrototype>
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

struct PassiveXhr {
    inner: Arc<dyn XhrPrototype>,
    tracker: Arc<RequestTracker>,
}

impl XhrPrototype for PassiveXhr {
    fn open(&self, xhr: &Xhr, method: &str, url: &str) {
        self.inner.open(xhr, method, url);
    }

    fn set_request_header(&self, xhr: &Xhr, name: &str, value: &str) {
        self.inner.set_request_header(xhr, name, value);
    }

    fn send(&self, xhr: &Xhr, body: Option<String>) {
        self.inner.send(xhr, body);
    }

    fn add_event_listener(&self, xhr: &Xhr, kind: XhrEventKind, listener: XhrListener) {
        self.inner.add_event_listener(xhr, kind, listener);
        if kind != XhrEventKind::Load {
            return;
        }
        let first = xhr.with_extensions(|ext| ext.insert(Observed).is_none());
        if first {
            let tracker = Arc::clone(&self.tracker);
            let observer: XhrListener = Arc::new(move |xhr: &Xhr| observe(&tracker, xhr));
            self.inner.add_event_listener(xhr, XhrEventKind::Load, observer);
        }
    }
}

fn observe(tracker: &RequestTracker, xhr: &Xhr) {
    if xhr.with_extensions(|ext| ext.get::<RequestTag>().is_some()) {
        return;
    }
    let Some(url) = xhr.response_url() else {
        return;
    };
    let end_time = now_millis();
    let (response_body, response_type) = capture_response(xhr);
    let mut record = RequestRecord::new(tracker.next_id(), &xhr.method(), &url);
    record.headers = xhr.request_headers().into_iter().collect();
    record.start_time = end_time - ASSUMED_DURATION_MS;
    record.end_time = Some(end_time);
    record.status = xhr.status();
    record.response_body = Some(response_body);
    record.response_type = response_type;
    tracing::debug!("passively observed {} {}", record.method, record.url);
    tracker.registry().observe_completed(record);
}
