//! Public API of the debug monitor

pub mod config;
pub mod monitor_api;

pub use config::{ConfigError, MonitorConfig, StartOptions};
pub use monitor_api::{DebugMonitor, DebugMonitorBuilder};
