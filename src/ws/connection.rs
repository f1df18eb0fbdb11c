#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
#[cfg(feature = "tracing")]
use super::config::redact;
use super::state::{Action, CloseCause, ConnectionState, Event, Machine};
use crate::Result;
use crate::dispatch::{CloseDisposition, Dispatcher, classify_close};
use crate::error::{Error, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on sending our own close frame during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Handle to the background task driving one connection lifecycle.
struct Driver {
    cancel: CancellationToken,
    /// Cuts a pending reconnect wait short. Only ever woken with `notify_waiters`, so a
    /// wake-up that finds no wait in progress is dropped instead of stored.
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

/// Manages the WebSocket connection lifecycle and reconnection.
///
/// A single background task owns the socket and the reconnect timer. Every inbound text
/// frame is handed to the [`Dispatcher`] on that task, so frames from one connection are
/// delivered in arrival order.
///
/// Lifecycle:
///
/// ```text
/// Idle --activate--> Connecting --open--> Open
///                       ^  |                |
///                       |  | transient      | transient close
///                       |  v                v
///                       Retrying <----------+
///
/// fatal close / deactivate / retries exhausted --> Closed (terminal)
/// ```
pub struct ConnectionManager {
    config: Config,
    dispatcher: Dispatcher,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for checking the current state
    state_rx: watch::Receiver<ConnectionState>,
    driver: Mutex<Option<Driver>>,
}

impl ConnectionManager {
    /// Create an idle manager. Nothing connects until [`ConnectionManager::activate`].
    #[must_use]
    pub fn new(config: Config, dispatcher: Dispatcher) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        Self {
            config,
            dispatcher,
            state_tx,
            state_rx,
            driver: Mutex::new(None),
        }
    }

    /// Start connecting.
    ///
    /// No-op while `Connecting` or `Open`. While `Retrying`, the pending wait is cut short
    /// and a connection attempt starts immediately. Fails with [`crate::error::Kind::Misuse`]
    /// once the manager is `Closed`, and with [`crate::error::Kind::Validation`] when the
    /// endpoint cannot be resolved.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn activate(&self) -> Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        let state = *self.state_rx.borrow();
        match state {
            ConnectionState::Idle => {}
            ConnectionState::Connecting | ConnectionState::Open { .. } => return Ok(()),
            ConnectionState::Retrying { .. } => {
                if let Some(driver) = driver.as_ref() {
                    driver.wake.notify_waiters();
                }
                return Ok(());
            }
            ConnectionState::Closed { .. } => {
                return Err(Error::misuse(
                    "connection manager has been closed and cannot be reactivated",
                ));
            }
        }

        let endpoint = self.config.resolve_endpoint()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::misuse(format!("activate requires a Tokio runtime: {e}")))?;

        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %redact(&endpoint), "activating WebSocket connection");

        self.state_tx.send_replace(ConnectionState::Connecting);

        let task = runtime.spawn(Self::connection_loop(
            endpoint,
            self.config.clone(),
            self.dispatcher.clone(),
            self.state_tx.clone(),
            cancel.clone(),
            Arc::clone(&wake),
        ));

        *driver = Some(Driver {
            cancel,
            wake,
            task: Some(task),
        });

        Ok(())
    }

    /// Close any live connection and cancel any pending reconnect. Idempotent.
    ///
    /// The state becomes `Closed` before this returns, and no further connection attempt
    /// is made afterwards.
    pub fn deactivate(&self) {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        self.state_tx.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = ConnectionState::Closed {
                cause: CloseCause::Deactivated,
            };
            true
        });

        if let Some(driver) = driver.as_ref()
            && !driver.cancel.is_cancelled()
        {
            driver.cancel.cancel();

            #[cfg(feature = "tracing")]
            tracing::info!("deactivated WebSocket connection");
        }
    }

    /// Deactivate and wait for the background task to release the socket.
    pub async fn shutdown(&self) {
        self.deactivate();

        let task = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|driver| driver.task.take());

        if let Some(task) = task
            && let Err(e) = task.await
        {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "connection task did not exit cleanly");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Main connection loop. Feeds transport events into the [`Machine`] and performs the
    /// action it returns until told to stop.
    async fn connection_loop(
        endpoint: Url,
        config: Config,
        dispatcher: Dispatcher,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
        wake: Arc<Notify>,
    ) {
        let mut machine = Machine::new(config.reconnect.clone());
        let mut action = machine.on_event(Event::Activate);

        loop {
            // Registered before `Retrying` becomes visible, so an activate that observes
            // it is guaranteed to reach this wait.
            let woken = wake.notified();
            let mut woken = pin!(woken);
            woken.as_mut().enable();

            if !publish(&state_tx, machine.state()) {
                break;
            }

            match action {
                Action::Connect => {
                    let connected = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        connected = Self::connect(&endpoint, config.connect_timeout) => connected,
                    };

                    let disposition = match connected {
                        Ok(mut ws_stream) => {
                            machine.on_event(Event::Opened);
                            if !publish(&state_tx, machine.state()) {
                                _ = timeout(CLOSE_GRACE, ws_stream.close(None)).await;
                                break;
                            }

                            match Self::handle_connection(ws_stream, &dispatcher, &cancel).await {
                                Some(disposition) => disposition,
                                None => break,
                            }
                        }
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "Unable to connect");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;

                            CloseDisposition::Transient
                        }
                    };

                    if let CloseDisposition::Fatal(code) = &disposition {
                        let error = Error::fatal_close(code.clone());
                        #[cfg(feature = "tracing")]
                        tracing::error!(%error, "not reconnecting");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &error;
                    }

                    action = machine.on_event(Event::Closed(disposition));
                }
                Action::Wait(delay) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(?delay, state = %machine.state(), "waiting to reconnect");

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = woken => {}
                        () = sleep(delay) => {}
                    }

                    action = machine.on_event(Event::RetryElapsed);
                }
                // Nothing is in flight outside of connecting and waiting.
                Action::Continue | Action::Stop => break,
            }
        }

        if cancel.is_cancelled() {
            machine.on_event(Event::Deactivate);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(state = %machine.state(), "connection loop exited");
    }

    async fn connect(endpoint: &Url, connect_timeout: Duration) -> Result<WsStream> {
        match timeout(connect_timeout, connect_async(endpoint.as_str())).await {
            Ok(Ok((ws_stream, _response))) => {
                #[cfg(feature = "tracing")]
                tracing::info!(endpoint = %redact(endpoint), "WebSocket connected");

                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(TransportError::ConnectTimeout.into()),
        }
    }

    /// Read an open connection until it ends.
    ///
    /// Returns how the connection ended, or `None` when it was cancelled locally.
    async fn handle_connection(
        ws_stream: WsStream,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Option<CloseDisposition> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    _ = timeout(CLOSE_GRACE, write.send(Message::Close(None))).await;
                    return None;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            dispatcher.handle_text(text.as_str());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .as_ref()
                                .map(|frame| frame.reason.as_str())
                                .unwrap_or_default();
                            let error = TransportError::Closed {
                                reason: reason.to_owned(),
                            };
                            #[cfg(feature = "tracing")]
                            tracing::info!(%error, "WebSocket closed by server");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;

                            let disposition = classify_close(reason);
                            // Flush the close handshake reply queued by tungstenite.
                            _ = timeout(CLOSE_GRACE, write.close()).await;
                            return Some(disposition);
                        }
                        Some(Ok(_)) => {
                            // Binary, ping and pong frames carry nothing to dispatch.
                        }
                        Some(Err(e)) => {
                            let error = Error::from(e);
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%error, "WebSocket read failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;

                            return Some(CloseDisposition::Transient);
                        }
                        None => {
                            let error = TransportError::StreamEnded;
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%error, "WebSocket stream ended");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;

                            return Some(CloseDisposition::Transient);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Publish the machine's state unless the manager was closed from outside.
///
/// Returns `false` when the published state is already terminal.
fn publish(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    let mut terminal = false;

    state_tx.send_if_modified(|current| {
        if current.is_closed() {
            terminal = true;
            return false;
        }
        terminal = next.is_closed();
        if *current == next {
            return false;
        }
        *current = next;
        true
    });

    !terminal
}
