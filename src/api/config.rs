//! Monitor configuration

use crate::sync::{ChannelConfig, DiscoveryConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid server IP {0:?}: expected an IPv4 address or \"localhost\"")]
    InvalidServerIp(String),
    #[error("invalid port {0}: expected 1-65535")]
    InvalidPort(u32),
}

/// Accept an IPv4 literal or `localhost`
pub fn validate_server_ip(ip: &str) -> Result<String, ConfigError> {
    let trimmed = ip.trim();
    if trimmed.eq_ignore_ascii_case("localhost") {
        return Ok("localhost".to_string());
    }
    trimmed
        .parse::<Ipv4Addr>()
        .map(|addr| addr.to_string())
        .map_err(|_| ConfigError::InvalidServerIp(ip.to_string()))
}

pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::InvalidPort(port))
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// The monitor refuses to start outside development mode
    pub development_mode: bool,
    /// Explicit host; discovery is used when unset
    pub server_host: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub discovery: DiscoveryConfig,
    /// Install the passive observer when the monitor is built
    pub passive_capture: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            development_mode: cfg!(debug_assertions),
            server_host: None,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery: DiscoveryConfig::default(),
            passive_capture: true,
        }
    }
}

impl MonitorConfig {
    /// Defaults overridden by `DEBUG_MONITOR_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("DEBUG_MONITOR_HOST") {
            match validate_server_ip(&host) {
                Ok(host) => config.server_host = Some(host),
                Err(e) => tracing::warn!("Ignoring DEBUG_MONITOR_HOST: {}", e),
            }
        }
        if let Some(port) = lookup("DEBUG_MONITOR_PORT") {
            match port.trim().parse::<u32>() {
                Ok(port) => match validate_port(port) {
                    Ok(port) => config.port = port,
                    Err(e) => tracing::warn!("Ignoring DEBUG_MONITOR_PORT: {}", e),
                },
                Err(_) => tracing::warn!("Ignoring DEBUG_MONITOR_PORT: {:?} is not a number", port),
            }
        }
        if let Some(flag) = lookup("DEBUG_MONITOR_DISCOVERY").as_deref().and_then(parse_flag) {
            config.discovery.enabled = flag;
        }
        if let Some(flag) = lookup("DEBUG_MONITOR_DEV").as_deref().and_then(parse_flag) {
            config.development_mode = flag;
        }
        config
    }

    pub(crate) fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            server_host: self.server_host.clone(),
            port: self.port,
            connect_timeout: self.connect_timeout,
            discovery: self.discovery.clone(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Options passed to `start`, in the host app's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    #[serde(rename = "serverIP", default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default = "default_monitor_network")]
    pub monitor_network: bool,
}

fn default_monitor_network() -> bool {
    true
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            server_ip: None,
            port: None,
            monitor_network: true,
        }
    }
}

impl StartOptions {
    pub fn with_server_ip(mut self, ip: impl Into<String>) -> Self {
        self.server_ip = Some(ip.into());
        self
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = Some(port);
        self
    }

    pub fn without_network(mut self) -> Self {
        self.monitor_network = false;
        self
    }
}
