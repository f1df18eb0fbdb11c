//! WebSocket connection management.
//!
//! - [`ConnectionManager`]: owns one socket at a time and reconnects after transient failures
//! - [`ConnectionState`]: lifecycle state, observable through a `watch` channel
//! - [`Config`]: endpoint and reconnection policy

pub mod config;
pub mod connection;
pub mod state;

pub use config::{Config, ReconnectConfig, WS_URL_VAR};
pub use connection::ConnectionManager;
pub use state::{CloseCause, ConnectionState};
