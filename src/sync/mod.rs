//! Sync channel to the desktop host
//!
//! A single persistent message channel per monitor. Outbound messages are
//! JSON envelopes; inbound commands are parsed and broadcast to the monitor.

pub mod channel;
pub mod connector;
pub mod discovery;

pub use channel::{
    reconnect_delay, ChannelConfig, ChannelEvent, ConnectionState, SyncChannel,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT,
};
pub use connector::{Connection, Connector, MemoryConnector, MemoryPeer, WebSocketConnector};
pub use discovery::{default_candidates, discover, DiscoveryConfig};
