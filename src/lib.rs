#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod channels;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod registry;
pub(crate) mod serde_helpers;
pub mod ws;

pub use channels::Channel;
pub use context::{TransportContext, TransportHandle};
pub use error::Error;
pub use registry::{ChannelRegistry, Subscription};
pub use ws::{Config, ConnectionState, ReconnectConfig};

pub type Result<T> = std::result::Result<T, Error>;
