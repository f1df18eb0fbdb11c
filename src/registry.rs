#![expect(
    clippy::module_name_repetitions,
    reason = "Registry types are re-exported at the crate root"
)]

//! Channel registry: channel name to an ordered list of handlers.
//!
//! The registry is pure bookkeeping. It does no I/O and outlives any single connection,
//! so subscriptions survive reconnects.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, Entry};
use serde_json::Value;

/// Callback invoked with the payload of every frame on its channel.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

struct Registered {
    id: u64,
    handler: Handler,
}

/// Mapping from channel name to handlers, in registration order.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Vec<Registered>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append `handler` to the list for `channel`, creating the list if absent.
    ///
    /// The returned [`Subscription`] removes exactly this handler when released.
    pub fn register<S, F>(self: &Arc<Self>, channel: S, handler: F) -> Subscription
    where
        S: Into<String>,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.channels
            .entry(channel.clone())
            .or_default()
            .push(Registered {
                id,
                handler: Arc::new(handler),
            });

        #[cfg(feature = "tracing")]
        tracing::debug!(%channel, id, "registered channel handler");

        Subscription {
            channel,
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Invoke every handler registered for `channel` with `payload`, in registration order.
    ///
    /// Returns the number of handlers that ran to completion. A channel without handlers is
    /// a no-op. A panicking handler is contained and does not stop the handlers after it.
    pub fn dispatch(&self, channel: &str, payload: &Value) -> usize {
        // Snapshot so handlers can subscribe or release without holding the shard lock.
        let handlers: Vec<(u64, Handler)> = match self.channels.get(channel) {
            Some(list) => list
                .iter()
                .map(|registered| (registered.id, Arc::clone(&registered.handler)))
                .collect(),
            None => return 0,
        };

        let mut completed = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => completed += 1,
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(%channel, id, "channel handler panicked");
                    #[cfg(not(feature = "tracing"))]
                    let _ = id;
                }
            }
        }

        completed
    }

    /// Number of handlers currently registered for `channel`.
    #[must_use]
    pub fn handler_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |list| list.len())
    }

    /// Number of channels with at least one handler.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Names of channels with at least one handler, in no particular order.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    fn remove(&self, channel: &str, id: u64) -> bool {
        let Entry::Occupied(mut entry) = self.channels.entry(channel.to_owned()) else {
            return false;
        };

        let list = entry.get_mut();
        let before = list.len();
        list.retain(|registered| registered.id != id);
        let removed = list.len() != before;

        if list.is_empty() {
            entry.remove();
        }

        removed
    }
}

/// Release token for one registered handler.
///
/// Dropping the token leaves the handler registered; call [`Subscription::release`] to
/// remove it.
#[must_use = "the handler stays registered until the subscription is released"]
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    id: u64,
    registry: Weak<ChannelRegistry>,
}

impl Subscription {
    /// Channel this subscription is registered on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove the handler from its channel.
    ///
    /// Returns `false` when the handler was already gone, including when the registry
    /// itself has been dropped.
    pub fn release(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        let removed = registry.remove(&self.channel, self.id);

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %self.channel, id = self.id, removed, "released channel handler");

        removed
    }
}

/// Releases the wrapped subscription when dropped.
pub(crate) struct ReleaseOnDrop(pub(crate) Option<Subscription>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            let _removed = subscription.release();
        }
    }
}
