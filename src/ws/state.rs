#![expect(
    clippy::module_name_repetitions,
    reason = "State types carry their domain in the name for clarity"
)]

//! Connection lifecycle state and the transition function that drives it.

use std::time::{Duration, Instant};

use backoff::backoff::{Backoff as _, Constant};

use super::config::ReconnectConfig;
use crate::dispatch::CloseDisposition;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// Never activated
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the reconnect delay after a transient failure
    Retrying {
        /// Consecutive reconnection attempt this wait precedes, starting at 1
        attempt: u32,
    },
    /// Terminal. Never transitions back to `Connecting`.
    Closed {
        /// Why the connection stopped for good
        cause: CloseCause,
    },
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// `Connecting` or `Open`: activation is a no-op in these states.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open { .. })
    }

    /// Terminal: the manager will never connect again.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Reason a connection reached [`ConnectionState::Closed`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CloseCause {
    /// The owner tore the transport down
    Deactivated,
    /// The server closed with a truthy error code
    FatalClose,
    /// The configured maximum number of reconnection attempts was reached
    RetriesExhausted,
}

/// Inputs to the state machine, as observed on the underlying transport.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Activate,
    Opened,
    Closed(CloseDisposition),
    RetryElapsed,
    Deactivate,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Open a new connection
    Connect,
    /// Keep doing what it was doing
    Continue,
    /// Sleep for the delay, then feed [`Event::RetryElapsed`]
    Wait(Duration),
    /// Release the connection and exit
    Stop,
}

/// Pure transition function for the connection lifecycle.
pub(crate) struct Machine {
    state: ConnectionState,
    attempt: u32,
    max_attempts: Option<u32>,
    backoff: Constant,
    delay: Duration,
}

impl Machine {
    pub(crate) fn new(policy: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            max_attempts: policy.max_attempts,
            delay: policy.delay,
            backoff: policy.into(),
        }
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn on_event(&mut self, event: Event) -> Action {
        use ConnectionState as S;

        match (self.state, event) {
            (S::Closed { .. }, _) => Action::Stop,
            (_, Event::Deactivate) => self.close(CloseCause::Deactivated),
            (S::Idle | S::Retrying { .. }, Event::Activate | Event::RetryElapsed) => {
                self.state = S::Connecting;
                Action::Connect
            }
            (S::Connecting, Event::Opened) => {
                self.state = S::Open {
                    since: Instant::now(),
                };
                self.attempt = 0;
                self.backoff.reset();
                Action::Continue
            }
            (S::Connecting | S::Open { .. }, Event::Closed(CloseDisposition::Fatal(_))) => {
                self.close(CloseCause::FatalClose)
            }
            (S::Connecting | S::Open { .. }, Event::Closed(CloseDisposition::Transient)) => {
                if self.max_attempts.is_some_and(|max| self.attempt >= max) {
                    return self.close(CloseCause::RetriesExhausted);
                }

                self.attempt = self.attempt.saturating_add(1);
                self.state = S::Retrying {
                    attempt: self.attempt,
                };
                Action::Wait(self.backoff.next_backoff().unwrap_or(self.delay))
            }
            _ => Action::Continue,
        }
    }

    fn close(&mut self, cause: CloseCause) -> Action {
        self.state = ConnectionState::Closed { cause };
        Action::Stop
    }
}
