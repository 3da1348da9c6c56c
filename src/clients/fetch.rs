//! Promise-style request function
//!
//! A single global entry point taking a request and resolving to a
//! response, or failing with an error carrying a message.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Request body variants accepted by `fetch`
#[derive(Debug, Clone, PartialEq)]
pub enum FetchBody {
    Text(String),
    Json(Value),
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    /// `None` means GET
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<FetchBody>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: FetchBody) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    body: Bytes,
}

impl FetchResponse {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the body as UTF-8 text
    pub fn text(self) -> Result<String, FetchError> {
        String::from_utf8(self.body.to_vec())
            .map_err(|_| FetchError::new("response body is not valid UTF-8"))
    }

    pub fn json(self) -> Result<Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::new(e.to_string()))
    }

    pub fn bytes(self) -> Bytes {
        self.body
    }
}

/// Failure of a fetch call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait FetchHandler: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// The global fetch entry point
pub struct GlobalFetch {
    handler: RwLock<Arc<dyn FetchHandler>>,
}

impl GlobalFetch {
    pub fn new(handler: Arc<dyn FetchHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler: RwLock::new(handler),
        })
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let handler = self.handler();
        handler.fetch(request).await
    }

    pub fn handler(&self) -> Arc<dyn FetchHandler> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `handler`, returning the one it replaced
    pub fn replace_handler(&self, handler: Arc<dyn FetchHandler>) -> Arc<dyn FetchHandler> {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, handler)
    }

    /// Replace the handler with one built around the current one
    pub fn wrap_handler<F>(&self, wrap: F) -> Arc<dyn FetchHandler>
    where
        F: FnOnce(Arc<dyn FetchHandler>) -> Arc<dyn FetchHandler>,
    {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot.clone();
        *slot = wrap(current.clone());
        current
    }
}
