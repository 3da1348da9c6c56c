//! HTTP client surfaces
//!
//! Each surface keeps its current implementation in a replaceable slot.
//! Application code always calls through the surface, so an observer can
//! swap the implementation in and restore the original later.

pub mod fetch;
pub mod pipeline;
pub mod xhr;

pub use fetch::{FetchBody, FetchError, FetchHandler, FetchRequest, FetchResponse, GlobalFetch};
pub use pipeline::{
    InterceptorHost, InterceptorManager, Interceptors, PipelineAdapter, PipelineClient,
    PipelineError, PipelineResponse, RequestConfig,
};
pub use xhr::{
    NativeXhr, Xhr, XhrBackend, XhrClass, XhrEventKind, XhrListener, XhrPrototype,
    XhrResponseType, XhrTransportError, XhrWireRequest, XhrWireResponse,
};
