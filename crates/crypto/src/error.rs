//! Error types for the courier-crypto crate.

use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature over key material or a message did not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    /// Decryption failed (wrong key, tampered ciphertext, etc.).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The message is structurally malformed or fails validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Padding after decryption was missing or malformed.
    #[error("invalid padding")]
    InvalidPadding,

    /// The message key was already used: a replay or duplicate delivery.
    #[error("duplicated message from {address} (counter {counter})")]
    DuplicatedMessage { address: String, counter: u32 },

    /// No session exists for the given address.
    #[error("session not found for address: {address}")]
    SessionNotFound { address: String },

    /// No sender key state exists for the given group and sender.
    #[error("no sender key for {sender} in group {group}")]
    NoSenderKey { group: String, sender: String },

    /// The remote identity differs from the one previously trusted.
    #[error("untrusted identity for address: {address}")]
    UntrustedIdentity { address: String },

    /// A first message referenced a one-time prekey we do not hold.
    #[error("unknown one-time pre-key")]
    InvalidPreKeyId,

    /// A first message referenced a signed prekey we do not hold.
    #[error("unknown signed pre-key")]
    InvalidSignedPreKeyId,

    /// No identity keypair has been generated yet.
    #[error("identity not initialized")]
    IdentityNotInitialized,

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Transport handshake failure. Always fatal for the connection attempt.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl CryptoError {
    /// Whether a decryption failure can be repaired by the retry protocol
    /// (the sender re-encrypting, possibly after rebuilding the session).
    pub fn is_recoverable_by_retry(&self) -> bool {
        !matches!(
            self,
            CryptoError::DuplicatedMessage { .. }
                | CryptoError::IdentityNotInitialized
                | CryptoError::StorageError(_)
                | CryptoError::Handshake(_)
        )
    }
}

/// Fallback mapping for libsignal failures. `SessionCipher` re-labels the
/// address-bearing variants with the device or group it was working on.
impl From<SignalProtocolError> for CryptoError {
    fn from(err: SignalProtocolError) -> Self {
        match err {
            SignalProtocolError::DuplicatedMessage(_, counter) => CryptoError::DuplicatedMessage {
                address: "unknown".into(),
                counter,
            },
            SignalProtocolError::SessionNotFound(address) => CryptoError::SessionNotFound {
                address: address.to_string(),
            },
            SignalProtocolError::UntrustedIdentity(address) => CryptoError::UntrustedIdentity {
                address: address.to_string(),
            },
            SignalProtocolError::NoSenderKeyState { .. } => CryptoError::NoSenderKey {
                group: "unknown".into(),
                sender: "unknown".into(),
            },
            SignalProtocolError::InvalidPreKeyId => CryptoError::InvalidPreKeyId,
            SignalProtocolError::InvalidSignedPreKeyId => CryptoError::InvalidSignedPreKeyId,
            // Store failures come back through libsignal as InvalidState.
            SignalProtocolError::InvalidState(_, detail) => CryptoError::StorageError(detail),
            SignalProtocolError::InvalidMessage(_, _) => CryptoError::InvalidMessage(err.to_string()),
            other => CryptoError::DecryptionFailed(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::DecryptionFailed("authentication tag mismatch".into())
    }
}
