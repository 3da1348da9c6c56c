//! Interceptor-pipeline client
//!
//! Requests flow through the registered request interceptors (most recently
//! registered first), the adapter, then the response interceptors in
//! registration order. Each stage has a fulfilled and a rejected handler;
//! a missing handler passes the value or the error through unchanged.

use async_trait::async_trait;
use http::Extensions;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Request description carried through the pipeline
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// `None` means GET
    pub method: Option<String>,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub data: Option<Value>,
    /// Per-request bookkeeping slots for interceptors
    pub extensions: Extensions,
}

impl RequestConfig {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub data: Value,
    /// Config the request was sent with
    pub config: RequestConfig,
}

impl PipelineResponse {
    pub fn new(status: u16, data: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            data,
            config: RequestConfig::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineError {
    pub message: String,
    pub config: Option<RequestConfig>,
    /// Present when the server answered with an error status
    pub response: Option<Box<PipelineResponse>>,
}

impl PipelineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            config: None,
            response: None,
        }
    }

    pub fn with_response(mut self, response: PipelineResponse) -> Self {
        self.response = Some(Box::new(response));
        self
    }
}

/// Performs the actual transfer
#[async_trait]
pub trait PipelineAdapter: Send + Sync {
    async fn dispatch(&self, config: RequestConfig) -> Result<PipelineResponse, PipelineError>;
}

pub type Fulfilled<T> = Arc<dyn Fn(T) -> Result<T, PipelineError> + Send + Sync>;
pub type Rejected<T> = Arc<dyn Fn(PipelineError) -> Result<T, PipelineError> + Send + Sync>;

/// One registered interceptor stage
pub struct Interceptor<T> {
    pub fulfilled: Option<Fulfilled<T>>,
    pub rejected: Option<Rejected<T>>,
}

impl<T> Clone for Interceptor<T> {
    fn clone(&self) -> Self {
        Self {
            fulfilled: self.fulfilled.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

impl<T> Interceptor<T> {
    fn run(&self, current: Result<T, PipelineError>) -> Result<T, PipelineError> {
        match current {
            Ok(value) => match &self.fulfilled {
                Some(fulfilled) => fulfilled(value),
                None => Ok(value),
            },
            Err(error) => match &self.rejected {
                Some(rejected) => rejected(error),
                None => Err(error),
            },
        }
    }
}

/// Registration list with stable handles
pub struct InterceptorManager<T> {
    handlers: Mutex<Vec<Option<Interceptor<T>>>>,
}

impl<T> Default for InterceptorManager<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> InterceptorManager<T> {
    /// Register a stage and return its handle
    pub fn use_interceptor(
        &self,
        fulfilled: Option<Fulfilled<T>>,
        rejected: Option<Rejected<T>>,
    ) -> usize {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.push(Some(Interceptor {
            fulfilled,
            rejected,
        }));
        handlers.len() - 1
    }

    /// Remove the stage registered under `handle`.
    ///
    /// Handles stay stable while later stages are live; trailing ejected
    /// slots are released, so their handles may be handed out again.
    pub fn eject(&self, handle: usize) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = match handlers.get_mut(handle) {
            Some(slot) => slot.take().is_some(),
            None => false,
        };
        while matches!(handlers.last(), Some(None)) {
            handlers.pop();
        }
        removed
    }

    /// Active stages in registration order
    pub fn active(&self) -> Vec<Interceptor<T>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct Interceptors {
    pub request: InterceptorManager<RequestConfig>,
    pub response: InterceptorManager<PipelineResponse>,
}

/// Anything that may expose an interceptor pipeline
pub trait InterceptorHost: Send + Sync {
    fn interceptors(&self) -> Option<&Interceptors>;
}

pub struct PipelineClient {
    interceptors: Interceptors,
    adapter: Arc<dyn PipelineAdapter>,
}

impl PipelineClient {
    pub fn new(adapter: Arc<dyn PipelineAdapter>) -> Self {
        Self {
            interceptors: Interceptors::default(),
            adapter,
        }
    }

    pub async fn request(&self, config: RequestConfig) -> Result<PipelineResponse, PipelineError> {
        let mut current = Ok(config);
        for stage in self.interceptors.request.active().iter().rev() {
            current = stage.run(current);
        }

        let mut outcome = match current {
            Ok(config) => {
                let sent = config.clone();
                match self.adapter.dispatch(config).await {
                    Ok(mut response) => {
                        response.config = sent;
                        Ok(response)
                    }
                    Err(mut error) => {
                        if error.config.is_none() {
                            error.config = Some(sent);
                        }
                        Err(error)
                    }
                }
            }
            Err(error) => Err(error),
        };

        for stage in self.interceptors.response.active().iter() {
            outcome = stage.run(outcome);
        }
        outcome
    }

    pub async fn get(&self, url: &str) -> Result<PipelineResponse, PipelineError> {
        self.request(RequestConfig::new("GET", url)).await
    }

    pub async fn post(&self, url: &str, data: Value) -> Result<PipelineResponse, PipelineError> {
        self.request(RequestConfig::new("POST", url).with_data(data))
            .await
    }
}

impl InterceptorHost for PipelineClient {
    fn interceptors(&self) -> Option<&Interceptors> {
        Some(&self.interceptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Reply(u16);

    #[async_trait]
    impl PipelineAdapter for Reply {
        async fn dispatch(
            &self,
            config: RequestConfig,
        ) -> Result<PipelineResponse, PipelineError> {
            if self.0 >= 400 {
                let response = PipelineResponse::new(self.0, json!({"error": "nope"}));
                return Err(PipelineError::new(format!(
                    "Request failed with status code {}",
                    self.0
                ))
                .with_response(response));
            }
            Ok(PipelineResponse::new(self.0, json!({"url": config.url})))
        }
    }

    fn tag_header(name: &'static str) -> Fulfilled<RequestConfig> {
        Arc::new(move |config: RequestConfig| {
            let order = config
                .headers
                .get("x-order")
                .cloned()
                .unwrap_or_default();
            Ok(config.with_header("x-order", format!("{order}{name}")))
        })
    }

    #[tokio::test]
    async fn request_interceptors_run_last_registered_first() {
        let client = PipelineClient::new(Arc::new(Reply(200)));
        client
            .interceptors
            .request
            .use_interceptor(Some(tag_header("a")), None);
        client
            .interceptors
            .request
            .use_interceptor(Some(tag_header("b")), None);

        let response = client.get("https://api.test/x").await.unwrap();
        assert_eq!(response.config.headers["x-order"], "ba");
        assert_eq!(response.data, json!({"url": "https://api.test/x"}));
    }

    #[tokio::test]
    async fn error_carries_config_and_response() {
        let client = PipelineClient::new(Arc::new(Reply(503)));
        let err = client.get("https://api.test/down").await.unwrap_err();
        assert_eq!(err.message, "Request failed with status code 503");
        assert_eq!(err.config.unwrap().url, "https://api.test/down");
        assert_eq!(err.response.unwrap().status, 503);
    }

    #[tokio::test]
    async fn ejected_interceptor_no_longer_runs() {
        let client = PipelineClient::new(Arc::new(Reply(200)));
        let handle = client
            .interceptors
            .request
            .use_interceptor(Some(tag_header("a")), None);
        assert!(client.interceptors.request.eject(handle));
        assert!(!client.interceptors.request.eject(handle));
        assert!(client.interceptors.request.is_empty());

        let response = client.get("https://api.test/x").await.unwrap();
        assert!(!response.config.headers.contains_key("x-order"));
    }

    #[test]
    fn repeated_use_and_eject_does_not_grow() {
        let manager = InterceptorManager::<RequestConfig>::default();
        let kept = manager.use_interceptor(Some(tag_header("kept")), None);
        for _ in 0..10 {
            let first = manager.use_interceptor(Some(tag_header("a")), None);
            let second = manager.use_interceptor(Some(tag_header("b")), None);
            assert!(manager.eject(first));
            assert!(manager.eject(second));
        }
        assert_eq!(manager.handlers.lock().unwrap().len(), 1);

        let middle = manager.use_interceptor(Some(tag_header("a")), None);
        let last = manager.use_interceptor(Some(tag_header("b")), None);
        assert!(manager.eject(middle));
        assert_eq!(manager.handlers.lock().unwrap().len(), 3);
        assert!(manager.eject(last));
        assert_eq!(manager.handlers.lock().unwrap().len(), 1);
        assert!(manager.eject(kept));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn rejected_response_handler_can_recover() {
        let client = PipelineClient::new(Arc::new(Reply(500)));
        client.interceptors.response.use_interceptor(
            None,
            Some(Arc::new(|_err: PipelineError| {
                Ok(PipelineResponse::new(200, json!("fallback")))
            })),
        );
        let response = client.get("https://api.test/x").await.unwrap();
        assert_eq!(response.data, json!("fallback"));
    }
}
