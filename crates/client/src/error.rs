//! Error types for the courier-client crate.

use courier_crypto::error::CryptoError;
use courier_shared::error::NodeError;
use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures of the physical duplex transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport i/o error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The Noise handshake failed or timed out. Never retried in place.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// The relay ended the stream with an error code.
    #[error("stream error {code}: {text}")]
    StreamError { code: u16, text: String },

    /// The relay revoked this device's session.
    #[error("logged out")]
    LoggedOut,

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    /// The relay answered a request with `type="error"`.
    #[error("request failed with {code}: {text}")]
    Iq { code: u16, text: String },

    #[error("no payload available to resend message {message_id}")]
    RetryPayloadMissing { message_id: String },

    #[error("app-state sync key {key_id} not available")]
    MissingSyncKey { key_id: String },

    #[error("app-state {name} failed verification: {what}")]
    AppStateMismatch { name: String, what: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Record accessors on libsignal types fail with libsignal's own error.
impl From<SignalProtocolError> for ClientError {
    fn from(err: SignalProtocolError) -> Self {
        ClientError::Crypto(err.into())
    }
}

impl ClientError {
    /// Request-level failures that a caller may simply try again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout | ClientError::Cancelled | ClientError::ConnectionClosed
        )
    }

    /// Errors that end the current connection and drive reconnect/backoff.
    pub fn is_fatal_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Handshake(_)
                | ClientError::KeepaliveTimeout
                | ClientError::StreamError { .. }
                | ClientError::LoggedOut
                | ClientError::Transport(_)
                | ClientError::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}
