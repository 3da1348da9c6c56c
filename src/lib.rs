//! # Debug Monitor Core
//!
//! Device-side engine that lets a desktop viewer inspect a running mobile
//! app's network traffic and key-value storage, live.
//!
//! ## Features
//!
//! - Observational interception of three HTTP client surfaces
//! - Correlation of every call through a pending request registry
//! - Reconnecting sync channel with backoff and host discovery
//! - Storage snapshots and remote storage edits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Desktop viewer (host)                    │
//! ├─────────────────────────────────────────────────────────┤
//! │            JSON envelopes over WebSocket                 │
//! ├─────────────────────────────────────────────────────────┤
//! │                 Debug Monitor Core (Rust)                │
//! │  ┌───────────┐  ┌──────────┐  ┌────────┐  ┌──────────┐  │
//! │  │ Intercept │──│ Registry │──│  Sync  │──│ Storage  │  │
//! │  │ adapters  │  │          │  │channel │  │  mirror  │  │
//! │  └───────────┘  └──────────┘  └────────┘  └──────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod clients;
pub mod intercept;
pub mod logging;
pub mod models;
pub mod registry;
pub mod storage;
pub mod sync;

pub use api::monitor_api::DebugMonitor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
