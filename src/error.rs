use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error opening, reading from, or closing the WebSocket connection
    Connection,
    /// Error decoding an inbound frame or close reason
    Protocol,
    /// The server closed the connection with a fatal error code
    FatalClose,
    /// The transport was used outside of an active scope
    Misuse,
    /// Error related to invalid configuration
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn misuse<S: Into<String>>(message: S) -> Self {
        Misuse {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn fatal_close(code: Value) -> Self {
        FatalClose { code }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Transport-level failures. These are transient and lead to a reconnect.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// The connection attempt did not complete in time
    ConnectTimeout,
    /// The server closed the connection, optionally with a reason
    Closed {
        /// Raw close reason text, empty when none was sent
        reason: String,
    },
    /// The stream ended without a close frame
    StreamEnded,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectTimeout => write!(f, "WebSocket connection attempt timed out"),
            Self::Closed { reason } if reason.is_empty() => {
                write!(f, "WebSocket connection closed")
            }
            Self::Closed { reason } => write!(f, "WebSocket connection closed: {reason}"),
            Self::StreamEnded => write!(f, "WebSocket stream ended without a close frame"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Connection, TransportError::WebSocket(e))
    }
}

/// Malformed inbound data. Always dropped at the point of decoding.
#[non_exhaustive]
#[derive(Debug)]
pub enum ProtocolError {
    /// The text was not valid JSON or did not match the expected shape
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl StdError for ProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Json(e) => Some(e),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::with_source(Kind::Protocol, err)
    }
}

/// The server closed the connection deliberately; no reconnect is attempted.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct FatalClose {
    pub code: Value,
}

impl fmt::Display for FatalClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection closed by server with error code {}", self.code)
    }
}

impl StdError for FatalClose {}

impl From<FatalClose> for Error {
    fn from(err: FatalClose) -> Self {
        Error::with_source(Kind::FatalClose, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Misuse {
    pub reason: String,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "misuse: {}", self.reason)
    }
}

impl StdError for Misuse {}

impl From<Misuse> for Error {
    fn from(err: Misuse) -> Self {
        Error::with_source(Kind::Misuse, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

/// A typed payload stream fell behind its channel and payloads were dropped.
#[non_exhaustive]
#[derive(Debug)]
pub struct Lagged {
    pub count: u64,
}

impl fmt::Display for Lagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream lagged, missed {} payloads", self.count)
    }
}

impl StdError for Lagged {}

impl From<Lagged> for Error {
    fn from(err: Lagged) -> Self {
        Error::with_source(Kind::Internal, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fatal_close_display_should_include_code() {
        let error = Error::fatal_close(json!(401));

        assert_eq!(error.kind(), Kind::FatalClose);
        assert_eq!(
            error.to_string(),
            "FatalClose: connection closed by server with error code 401"
        );
    }

    #[test]
    fn misuse_should_downcast() {
        let error = Error::misuse("subscribe called outside an active transport");

        assert_eq!(error.kind(), Kind::Misuse);
        let misuse = error.downcast_ref::<Misuse>().unwrap();
        assert_eq!(misuse.reason, "subscribe called outside an active transport");
    }

    #[test]
    fn closed_without_reason_display_should_succeed() {
        let error = TransportError::Closed {
            reason: String::new(),
        };

        assert_eq!(error.to_string(), "WebSocket connection closed");
    }

    #[test]
    fn json_error_should_be_protocol_source() {
        let json_error = serde_json::from_str::<Value>("{").unwrap_err();
        let error: Error = ProtocolError::Json(json_error).into();

        assert_eq!(error.kind(), Kind::Protocol);
        assert!(error.source().is_some());
    }
}
