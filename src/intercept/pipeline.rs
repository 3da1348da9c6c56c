//! Adapter for interceptor-pipeline clients
//!
//! Clients are registered explicitly. While installed, every registered
//! client carries one request stage and one response stage owned by this
//! adapter. The request stage stores the pending call in the config's
//! extensions so the response stage can settle it; a call whose config is
//! dropped unsettled is reported as aborted.

use super::{PendingCall, RequestTracker, SurfaceAdapter};
use crate::clients::pipeline::{Fulfilled, Rejected};
use crate::clients::{InterceptorHost, PipelineError, PipelineResponse, RequestConfig};
use crate::models::{RequestOutcome, RESPONSE_TYPE_UNKNOWN};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("client does not expose an interceptor pipeline")]
    MissingInterceptors,
    #[error("client is already registered")]
    AlreadyRegistered,
}

struct Registration {
    client: Arc<dyn InterceptorHost>,
    /// Request and response stage handles while installed
    handles: Option<(usize, usize)>,
}

#[derive(Default)]
struct PipelineState {
    installed: bool,
    registrations: Vec<Registration>,
}

pub struct PipelineInterceptor {
    tracker: Arc<RequestTracker>,
    state: Mutex<PipelineState>,
}

impl PipelineInterceptor {
    pub fn new(tracker: Arc<RequestTracker>) -> Self {
        Self {
            tracker,
            state: Mutex::new(PipelineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client; stages are attached right away when installed
    pub fn register(&self, client: Arc<dyn InterceptorHost>) -> Result<(), AttachError> {
        if client.interceptors().is_none() {
            return Err(AttachError::MissingInterceptors);
        }
        let mut state = self.lock();
        if state
            .registrations
            .iter()
            .any(|r| same_client(&r.client, &client))
        {
            return Err(AttachError::AlreadyRegistered);
        }
        let handles = if state.installed {
            self.attach(client.as_ref())
        } else {
            None
        };
        state.registrations.push(Registration { client, handles });
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.lock().registrations.len()
    }

    fn attach(&self, client: &dyn InterceptorHost) -> Option<(usize, usize)> {
        let interceptors = client.interceptors()?;
        let request = interceptors
            .request
            .use_interceptor(Some(self.on_request()), Some(pass_error()));
        let response = interceptors
            .response
            .use_interceptor(Some(self.on_response()), Some(self.on_error()));
        Some((request, response))
    }

    fn on_request(&self) -> Fulfilled<RequestConfig> {
        let tracker = Arc::clone(&self.tracker);
        Arc::new(move |mut config: RequestConfig| {
            let mut record = tracker.draft(config.method.as_deref().unwrap_or("GET"), &config.url);
            record.headers = config.headers.clone();
            record.request_body = config.data.clone();
            let id = record.id;
            if tracker.begin(record) {
                config
                    .extensions
                    .insert(Arc::new(PendingCall::new(Arc::clone(&tracker), id)));
            }
            Ok(config)
        })
    }

    fn on_response(&self) -> Fulfilled<PipelineResponse> {
        Arc::new(move |response: PipelineResponse| {
            if let Some(pending) = response.config.extensions.get::<Arc<PendingCall>>() {
                pending.settle(RequestOutcome::Completed {
                    status: response.status,
                    response_body: Some(response.data.clone()),
                    response_type: content_type(&response.headers),
                });
            }
            Ok(response)
        })
    }

    fn on_error(&self) -> Rejected<PipelineResponse> {
        Arc::new(move |error: PipelineError| {
            let pending = error
                .config
                .as_ref()
                .and_then(|config| config.extensions.get::<Arc<PendingCall>>());
            if let Some(pending) = pending {
                pending.settle(RequestOutcome::Failed {
                    status: error.response.as_ref().map_or(0, |r| r.status),
                    error: error.message.clone(),
                    response_body: error.response.as_ref().map(|r| r.data.clone()),
                });
            }
            Err(error)
        })
    }
}

impl SurfaceAdapter for PipelineInterceptor {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn install(&self) -> bool {
        let mut state = self.lock();
        if state.installed {
            return false;
        }
        state.installed = true;
        for registration in state.registrations.iter_mut() {
            if registration.handles.is_none() {
                registration.handles = self.attach(registration.client.as_ref());
            }
        }
        true
    }

    fn uninstall(&self) -> bool {
        let mut state = self.lock();
        if !state.installed {
            return false;
        }
        state.installed = false;
        for registration in state.registrations.iter_mut() {
            let (Some((request, response)), Some(interceptors)) =
                (registration.handles.take(), registration.client.interceptors())
            else {
                continue;
            };
            interceptors.request.eject(request);
            interceptors.response.eject(response);
        }
        true
    }

    fn is_installed(&self) -> bool {
        self.lock().installed
    }
}

fn pass_error() -> Rejected<RequestConfig> {
    Arc::new(|error: PipelineError| Err::<RequestConfig, _>(error))
}

fn same_client(a: &Arc<dyn InterceptorHost>, b: &Arc<dyn InterceptorHost>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn content_type(headers: &HashMap<String, String>) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| RESPONSE_TYPE_UNKNOWN.to_string())
}
