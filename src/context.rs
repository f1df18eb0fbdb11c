#![expect(
    clippy::module_name_repetitions,
    reason = "Context types are re-exported at the crate root"
)]

//! The owned boundary object applications hold for the lifetime of a realtime session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_stream::try_stream;
use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::Result;
use crate::channels::Channel;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Lagged};
use crate::registry::{ChannelRegistry, ReleaseOnDrop, Subscription};
use crate::serde_helpers::decode_payload;
use crate::ws::{Config, ConnectionManager, ConnectionState};

/// Buffered payloads per typed stream before it reports [`Lagged`].
const STREAM_CAPACITY: usize = 1024;

/// Owns the channel registry and, while active, one connection.
///
/// Subscriptions live in the registry, so they survive reconnects and even a
/// deactivate/activate cycle. Dropping the context deactivates it.
///
/// # Example
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use realtime_transport::{Config, TransportContext};
///
/// #[tokio::main]
/// async fn main() -> realtime_transport::Result<()> {
///     let context = TransportContext::new(Config::from_env()?);
///     context.activate()?;
///
///     let subscription = context.handle()?.subscribe("assignment:update", |payload| {
///         println!("assignment changed: {payload}");
///     });
///
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     subscription.release();
///     Ok(())
/// }
/// ```
pub struct TransportContext {
    config: Config,
    registry: Arc<ChannelRegistry>,
    manager: Mutex<Option<ConnectionManager>>,
}

impl TransportContext {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: ChannelRegistry::new(),
            manager: Mutex::new(None),
        }
    }

    /// Open the connection.
    ///
    /// A no-op while already active, except that a pending reconnect is brought forward.
    /// After a deactivate, or after the server closed the connection for good, a fresh
    /// connection is started.
    pub fn activate(&self) -> Result<()> {
        let mut manager = self.manager.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = manager.as_ref()
            && !current.state().is_closed()
        {
            return current.activate();
        }

        let fresh = ConnectionManager::new(
            self.config.clone(),
            Dispatcher::new(Arc::clone(&self.registry)),
        );
        fresh.activate()?;
        *manager = Some(fresh);

        Ok(())
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    pub fn deactivate(&self) {
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(manager) = manager {
            manager.deactivate();
        }
    }

    /// Deactivate and wait until the socket has been released.
    pub async fn shutdown(&self) {
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(manager) = manager {
            manager.shutdown().await;
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Accessor for the subscribe surface.
    ///
    /// Fails with [`crate::error::Kind::Misuse`] when the context is not active.
    pub fn handle(&self) -> Result<TransportHandle> {
        if !self.is_active() {
            return Err(Error::misuse(
                "transport accessed outside of an active context",
            ));
        }

        Ok(TransportHandle {
            registry: Arc::clone(&self.registry),
        })
    }

    /// Current connection state, `Idle` when the context is not active.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(ConnectionState::Idle, ConnectionManager::state)
    }

    /// Watch the state of the current connection.
    ///
    /// Fails with [`crate::error::Kind::Misuse`] when the context is not active.
    pub fn state_receiver(&self) -> Result<watch::Receiver<ConnectionState>> {
        self.manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ConnectionManager::state_receiver)
            .ok_or_else(|| Error::misuse("no connection outside of an active context"))
    }

    /// The registry backing this context.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Cloneable subscribe surface handed out by an active [`TransportContext`].
#[derive(Clone)]
pub struct TransportHandle {
    registry: Arc<ChannelRegistry>,
}

impl TransportHandle {
    /// Invoke `handler` with the payload of every frame on `channel`.
    ///
    /// Handlers on the same channel run in subscription order. The handler stays
    /// registered until the returned [`Subscription`] is released.
    pub fn subscribe<S, F>(&self, channel: S, handler: F) -> Subscription
    where
        S: Into<String>,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.register(channel, handler)
    }

    /// Like [`TransportHandle::subscribe`], but decodes each payload into the channel's
    /// payload type first. Payloads that fail to decode are logged and skipped.
    pub fn subscribe_typed<C, F>(&self, handler: F) -> Subscription
    where
        C: Channel,
        F: Fn(C::Payload) + Send + Sync + 'static,
    {
        self.registry
            .register(C::NAME, move |payload: &Value| {
                match decode_payload::<C::Payload>(payload) {
                    Ok(decoded) => handler(decoded),
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(channel = C::NAME, error = %e, "dropping undecodable payload");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }
            })
    }

    /// Stream of decoded payloads on channel `C`.
    ///
    /// The subscription is released when the stream is dropped. If the consumer falls
    /// more than 1024 payloads behind, the stream yields a [`Lagged`] error
    /// and ends.
    pub fn stream<C: Channel>(&self) -> impl Stream<Item = Result<C::Payload>> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(STREAM_CAPACITY);
        let missed = Arc::new(AtomicU64::new(0));
        let missed_clone = Arc::clone(&missed);

        let subscription = self.subscribe_typed::<C, _>(move |payload| {
            if tx.try_send(payload).is_err() {
                missed_clone.fetch_add(1, Ordering::Relaxed);
            }
        });
        let guard = ReleaseOnDrop(Some(subscription));

        try_stream! {
            let _guard = guard;

            while let Some(payload) = rx.recv().await {
                let count = missed.swap(0, Ordering::Relaxed);
                if count > 0 {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = C::NAME, count, "typed stream lagged");
                    Err(Lagged { count })?;
                }

                yield payload;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt as _;
    use serde_json::json;

    use super::*;
    use crate::channels::AssignmentUpdate;
    use crate::error::Kind;

    fn config() -> Config {
        Config::builder()
            .endpoint("ws://127.0.0.1:9/ws".to_owned())
            .build()
    }

    #[test]
    fn handle_before_activate_is_misuse() {
        let context = TransportContext::new(config());

        let error = context.handle().err().unwrap();
        assert_eq!(error.kind(), Kind::Misuse);
        assert_eq!(context.connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn activate_without_runtime_is_misuse() {
        let context = TransportContext::new(config());

        let error = context.activate().unwrap_err();
        assert_eq!(error.kind(), Kind::Misuse);
        assert!(!context.is_active(), "failed activation must leave the context inactive");
    }

    #[tokio::test]
    async fn activate_rejects_invalid_endpoint() {
        let context = TransportContext::new(
            Config::builder()
                .endpoint("http://127.0.0.1/ws".to_owned())
                .build(),
        );

        let error = context.activate().unwrap_err();
        assert_eq!(error.kind(), Kind::Validation);
    }

    #[tokio::test]
    async fn handle_after_deactivate_is_misuse() {
        let context = TransportContext::new(config());
        context.activate().unwrap();
        assert!(context.handle().is_ok(), "active context hands out handles");

        context.deactivate();
        context.deactivate();

        assert_eq!(context.handle().err().unwrap().kind(), Kind::Misuse);
        assert_eq!(context.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn subscriptions_outlive_deactivation() {
        let context = TransportContext::new(config());
        context.activate().unwrap();

        let _sub = context.handle().unwrap().subscribe("c", |_: &Value| {});
        context.shutdown().await;

        assert_eq!(context.registry().handler_count("c"), 1);
    }

    #[tokio::test]
    async fn subscribe_typed_decodes_and_skips_bad_payloads() {
        let context = TransportContext::new(config());
        context.activate().unwrap();
        let handle = context.handle().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = handle.subscribe_typed::<AssignmentUpdate, _>(move |update| {
            seen_clone.lock().unwrap().push(update.id);
        });

        let dispatcher = Dispatcher::new(Arc::clone(context.registry()));
        dispatcher.handle_text(r#"{"channel":"assignment:update","message":{"id":1}}"#);
        dispatcher.handle_text(r#"{"channel":"assignment:update","message":{"nope":true}}"#);
        dispatcher.handle_text(r#"{"channel":"assignment:update","message":{"id":2}}"#);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        context.shutdown().await;
    }

    #[tokio::test]
    async fn stream_yields_payloads_and_releases_on_drop() {
        let context = TransportContext::new(config());
        context.activate().unwrap();
        let handle = context.handle().unwrap();

        let stream = handle.stream::<AssignmentUpdate>();
        let mut stream = Box::pin(stream);
        assert_eq!(context.registry().handler_count("assignment:update"), 1);

        context
            .registry()
            .dispatch("assignment:update", &json!({"id": 42, "status": "TODO"}));

        let update = stream.next().await.unwrap().unwrap();
        assert_eq!(update.id, 42);

        drop(stream);
        assert_eq!(context.registry().handler_count("assignment:update"), 0);
        context.shutdown().await;
    }

    #[tokio::test]
    async fn stream_reports_lag() {
        let context = TransportContext::new(config());
        context.activate().unwrap();
        let handle = context.handle().unwrap();
        let mut stream = Box::pin(handle.stream::<AssignmentUpdate>());

        for id in 0..=STREAM_CAPACITY as u64 {
            context
                .registry()
                .dispatch("assignment:update", &json!({ "id": id }));
        }

        let error = stream.next().await.unwrap().unwrap_err();
        let lagged = error.downcast_ref::<Lagged>().unwrap();
        assert_eq!(lagged.count, 1);
        assert!(stream.next().await.is_none(), "stream ends after lagging");
        context.shutdown().await;
    }
}
