//! Callback-style request client
//!
//! `Xhr` objects follow the open / set-header / send lifecycle and report
//! their outcome by invoking listeners registered for `Load`, `Error` and
//! `Abort`. All lifecycle calls dispatch through the prototype currently
//! installed on the owning [`XhrClass`].

use async_trait::async_trait;
use bytes::Bytes;
use http::Extensions;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

/// Events fired when a transfer settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XhrEventKind {
    Load,
    Error,
    Abort,
}

/// Declared response type of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XhrResponseType {
    /// Empty declaration, treated as text
    #[default]
    Default,
    Text,
    Json,
    ArrayBuffer,
    Blob,
    Document,
}

impl XhrResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            XhrResponseType::Default => "",
            XhrResponseType::Text => "text",
            XhrResponseType::Json => "json",
            XhrResponseType::ArrayBuffer => "arraybuffer",
            XhrResponseType::Blob => "blob",
            XhrResponseType::Document => "document",
        }
    }
}

/// Listener invoked with the request that fired the event
pub type XhrListener = Arc<dyn Fn(&Xhr) + Send + Sync>;

/// Lifecycle implementation shared by every request of a class
pub trait XhrPrototype: Send + Sync {
    fn open(&self, xhr: &Xhr, method: &str, url: &str);
    fn set_request_header(&self, xhr: &Xhr, name: &str, value: &str);
    fn send(&self, xhr: &Xhr, body: Option<String>);
    fn add_event_listener(&self, xhr: &Xhr, kind: XhrEventKind, listener: XhrListener);
}

/// Request handed to the platform network stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrWireRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Response produced by the platform network stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrWireResponse {
    pub status: u16,
    /// Final URL after redirects
    pub url: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure: {0}")]
pub struct XhrTransportError(pub String);

/// Platform network stack used by [`NativeXhr`]
#[async_trait]
pub trait XhrBackend: Send + Sync {
    async fn execute(&self, request: XhrWireRequest) -> Result<XhrWireResponse, XhrTransportError>;
}

/// Owner of the current prototype
pub struct XhrClass {
    prototype: RwLock<Arc<dyn XhrPrototype>>,
}

impl XhrClass {
    pub fn new(prototype: Arc<dyn XhrPrototype>) -> Arc<Self> {
        Arc::new(Self {
            prototype: RwLock::new(prototype),
        })
    }

    /// Class backed by the platform network stack
    pub fn native(backend: Arc<dyn XhrBackend>) -> Arc<Self> {
        Self::new(Arc::new(NativeXhr::new(backend)))
    }

    pub fn prototype(&self) -> Arc<dyn XhrPrototype> {
        self.prototype
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `prototype`, returning the one it replaced
    pub fn replace_prototype(&self, prototype: Arc<dyn XhrPrototype>) -> Arc<dyn XhrPrototype> {
        let mut slot = self.prototype.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, prototype)
    }

    /// Replace the prototype with one built around the current one
    pub fn wrap_prototype<F>(&self, wrap: F) -> Arc<dyn XhrPrototype>
    where
        F: FnOnce(Arc<dyn XhrPrototype>) -> Arc<dyn XhrPrototype>,
    {
        let mut slot = self.prototype.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot.clone();
        *slot = wrap(current.clone());
        current
    }

    /// Create a fresh request object
    pub fn create(self: &Arc<Self>) -> Xhr {
        Xhr {
            class: Arc::clone(self),
            state: Arc::new(Mutex::new(XhrState::default())),
        }
    }
}

#[derive(Default)]
struct XhrState {
    method: String,
    url: String,
    request_headers: Vec<(String, String)>,
    response_type: XhrResponseType,
    status: u16,
    response_text: String,
    response_json: Option<Value>,
    response_bytes: Bytes,
    response_url: Option<String>,
    sent: bool,
    done: bool,
    listeners: Vec<(XhrEventKind, XhrListener)>,
    extensions: Extensions,
}

/// Handle to one request; clones share state
#[derive(Clone)]
pub struct Xhr {
    class: Arc<XhrClass>,
    state: Arc<Mutex<XhrState>>,
}

impl std::fmt::Debug for Xhr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Xhr")
            .field("method", &state.method)
            .field("url", &state.url)
            .field("status", &state.status)
            .field("done", &state.done)
            .finish()
    }
}

impl Xhr {
    fn state(&self) -> MutexGuard<'_, XhrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, method: &str, url: &str) {
        self.class.prototype().open(self, method, url);
    }

    pub fn set_request_header(&self, name: &str, value: &str) {
        self.class.prototype().set_request_header(self, name, value);
    }

    pub fn send(&self, body: Option<String>) {
        self.class.prototype().send(self, body);
    }

    pub fn add_event_listener<F>(&self, kind: XhrEventKind, listener: F)
    where
        F: Fn(&Xhr) + Send + Sync + 'static,
    {
        self.class
            .prototype()
            .add_event_listener(self, kind, Arc::new(listener));
    }

    /// Cancel an in-flight transfer and fire `Abort`
    pub fn abort(&self) {
        let fire = {
            let mut state = self.state();
            if state.sent && !state.done {
                state.done = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.dispatch(XhrEventKind::Abort);
        }
    }

    pub fn set_response_type(&self, response_type: XhrResponseType) {
        self.state().response_type = response_type;
    }

    pub fn response_type(&self) -> XhrResponseType {
        self.state().response_type
    }

    pub fn method(&self) -> String {
        self.state().method.clone()
    }

    pub fn url(&self) -> String {
        self.state().url.clone()
    }

    pub fn request_headers(&self) -> Vec<(String, String)> {
        self.state().request_headers.clone()
    }

    pub fn status(&self) -> u16 {
        self.state().status
    }

    pub fn response_text(&self) -> String {
        self.state().response_text.clone()
    }

    /// Parsed body for `Json` requests
    pub fn response_json(&self) -> Option<Value> {
        self.state().response_json.clone()
    }

    pub fn response_bytes(&self) -> Bytes {
        self.state().response_bytes.clone()
    }

    pub fn response_url(&self) -> Option<String> {
        self.state().response_url.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state().done
    }

    /// Access the bookkeeping slots attached to this request
    pub fn with_extensions<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        f(&mut self.state().extensions)
    }

    /// Reset request state for a new `open`
    pub fn record_open(&self, method: &str, url: &str) {
        let mut state = self.state();
        state.method = method.to_string();
        state.url = url.to_string();
        state.request_headers.clear();
        state.status = 0;
        state.response_text.clear();
        state.response_json = None;
        state.response_bytes = Bytes::new();
        state.response_url = None;
        state.sent = false;
        state.done = false;
    }

    pub fn record_request_header(&self, name: &str, value: &str) {
        self.state()
            .request_headers
            .push((name.to_string(), value.to_string()));
    }

    pub fn push_listener(&self, kind: XhrEventKind, listener: XhrListener) {
        self.state().listeners.push((kind, listener));
    }

    /// Mark the request as sent and build the wire request
    pub fn begin_send(&self, body: Option<String>) -> XhrWireRequest {
        let mut state = self.state();
        state.sent = true;
        XhrWireRequest {
            method: state.method.clone(),
            url: state.url.clone(),
            headers: state.request_headers.clone(),
            body,
        }
    }

    /// Store the transfer result and fire `Load` or `Error`.
    ///
    /// Ignored once the request has settled (e.g. after `abort`).
    pub fn finish(&self, result: Result<XhrWireResponse, XhrTransportError>) {
        let kind = {
            let mut state = self.state();
            if state.done {
                return;
            }
            state.done = true;
            match result {
                Ok(response) => {
                    state.status = response.status;
                    state.response_url = Some(response.url);
                    state.response_text = String::from_utf8_lossy(&response.body).into_owned();
                    state.response_json = match state.response_type {
                        XhrResponseType::Json => serde_json::from_slice(&response.body).ok(),
                        _ => None,
                    };
                    state.response_bytes = response.body;
                    XhrEventKind::Load
                }
                Err(err) => {
                    tracing::debug!("xhr {} {} failed: {}", state.method, state.url, err);
                    XhrEventKind::Error
                }
            }
        };
        self.dispatch(kind);
    }

    /// Invoke the listeners for `kind` in registration order
    pub fn dispatch(&self, kind: XhrEventKind) {
        let listeners: Vec<XhrListener> = self
            .state()
            .listeners
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(self);
        }
    }
}

/// Prototype backed by an [`XhrBackend`].
///
/// `send` spawns the transfer, so it must be called from within a tokio
/// runtime.
pub struct NativeXhr {
    backend: Arc<dyn XhrBackend>,
}

impl NativeXhr {
    pub fn new(backend: Arc<dyn XhrBackend>) -> Self {
        Self { backend }
    }
}

impl XhrPrototype for NativeXhr {
    fn open(&self, xhr: &Xhr, method: &str, url: &str) {
        xhr.record_open(method, url);
    }

    fn set_request_header(&self, xhr: &Xhr, name: &str, value: &str) {
        xhr.record_request_header(name, value);
    }

    fn send(&self, xhr: &Xhr, body: Option<String>) {
        let request = xhr.begin_send(body);
        let backend = Arc::clone(&self.backend);
        let xhr = xhr.clone();
        tokio::spawn(async move {
            let result = backend.execute(request).await;
            xhr.finish(result);
        });
    }

    fn add_event_listener(&self, xhr: &Xhr, kind: XhrEventKind, listener: XhrListener) {
        xhr.push_listener(kind, listener);
    }
}
