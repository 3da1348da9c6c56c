//! Data models for the debug monitor
//!
//! These models are shared between the device core and the desktop viewer
//! through the JSON wire protocol.

pub mod message;
pub mod request;

pub use message::*;
pub use request::*;
