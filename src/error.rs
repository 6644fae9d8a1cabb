use thiserror::Error;

use crate::packet::close_code;
use crate::session::BoxError;

/// Errors surfaced by a shard.
///
/// Most variants are recoverable: the reconnect loop in [`Shard::open`]
/// swallows them and dials again. Only configuration errors, cancellation,
/// and WebSocket closes carrying one of the known-terminal codes end the
/// shard (see [`Error::is_recoverable`]).
///
/// [`Shard::open`]: crate::Shard::open
#[derive(Error, Debug)]
pub enum Error {
    /// No gateway URL was configured before `open` was called.
    #[error("gateway URL is not configured")]
    MissingGateway,

    /// The configured gateway URL does not parse.
    #[error("invalid gateway URL {url:?}: {source}")]
    InvalidGateway {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The WebSocket handshake did not complete within the connect timeout.
    #[error("timed out dialing the gateway")]
    ConnectTimeout,

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The peer closed the connection with a close frame.
    #[error("connection closed with code {code}: {reason:?}")]
    Close { code: u16, reason: String },

    /// JSON envelope or payload codec error.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport decompression context rejected a frame.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The peer violated the gateway protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session store failed a read or write.
    #[error("session store error: {0}")]
    Store(#[source] BoxError),

    /// A send was attempted while no connection is open.
    #[error("shard is not connected")]
    NotConnected,

    /// The caller cancelled the shard's scope.
    #[error("shard cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the reconnect loop may retry after this error.
    ///
    /// A close frame is terminal only when its code is in the fatal set
    /// (authentication failure, bad shard tuple, bad version, bad intents).
    /// Everything else, including transport and protocol errors, drives a
    /// reconnect; backoff policy belongs to the supervisor.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Close { code, .. } => !close_code::FATAL.contains(code),
            Error::MissingGateway | Error::InvalidGateway { .. } | Error::Cancelled => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_close_codes_are_not_recoverable() {
        for code in close_code::FATAL {
            let err = Error::Close {
                code,
                reason: String::new(),
            };
            assert!(!err.is_recoverable(), "code {code} must be fatal");
        }
    }

    #[test]
    fn other_close_codes_are_recoverable() {
        for code in [
            1000,
            1001,
            1006,
            close_code::UNKNOWN_ERROR,
            close_code::SESSION_TIMEOUT,
            4008,
        ] {
            let err = Error::Close {
                code,
                reason: String::new(),
            };
            assert!(err.is_recoverable(), "code {code} must be recoverable");
        }
    }

    #[test]
    fn configuration_and_cancellation_are_terminal() {
        assert!(!Error::MissingGateway.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
        assert!(Error::NotConnected.is_recoverable());
        assert!(Error::ConnectTimeout.is_recoverable());
    }
}
