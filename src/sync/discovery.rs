//! Host discovery
//!
//! Probes a fixed list of candidate hosts in order and adopts the first one
//! that accepts a connection.

use super::connector::{Connection, Connector};
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Failed attempts required before probing starts
    pub threshold: u32,
    pub candidates: Vec<String>,
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0,
            candidates: default_candidates(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Loopback alias under which the development machine is reachable
pub fn platform_loopback_alias() -> &'static str {
    if cfg!(target_os = "android") {
        "10.0.2.2"
    } else {
        "localhost"
    }
}

/// Platform alias, loopback, alternate emulator alias, common LAN addresses
pub fn default_candidates() -> Vec<String> {
    [
        platform_loopback_alias(),
        "127.0.0.1",
        "10.0.3.2",
        "192.168.1.100",
        "192.168.0.100",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Probe candidates in order; returns the first host that connected
pub async fn discover(
    connector: &dyn Connector,
    config: &DiscoveryConfig,
    port: u16,
) -> Option<(String, Connection)> {
    for host in &config.candidates {
        tracing::debug!("Probing {}:{}", host, port);
        match tokio::time::timeout(config.probe_timeout, connector.connect(host, port)).await {
            Ok(Ok(connection)) => {
                tracing::info!("Discovered host at {}:{}", host, port);
                return Some((host.clone(), connection));
            }
            Ok(Err(e)) => tracing::debug!("Probe of {} failed: {:#}", host, e),
            Err(_) => tracing::debug!("Probe of {} timed out", host),
        }
    }
    None
}
