//! Typed channel contracts.
//!
//! The transport itself routes opaque JSON payloads. A [`Channel`] pins a channel name to
//! the payload type published on it so subscribers can receive decoded values through
//! [`crate::TransportHandle::subscribe_typed`] and [`crate::TransportHandle::stream`].

pub mod assignment;

use serde::de::DeserializeOwned;

pub use assignment::{AssignmentStatus, AssignmentUpdate};

/// A named channel and the payload type published on it.
pub trait Channel: 'static {
    /// Channel name as it appears in the `channel` field of inbound frames
    const NAME: &'static str;

    type Payload: DeserializeOwned + Send + 'static;
}
