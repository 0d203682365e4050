//! Noise XX handshake for the relay transport.
//!
//! `Noise_XX_25519_AESGCM_SHA256` with a fixed prologue:
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es          (+ certificate payload)
//!   -> s, se                 (+ client hello payload)
//! ```
//!
//! The client checks that the certificate carried in the second message
//! names the static key it just decrypted and, when a trusted root is
//! configured, that the root signed it and it has not expired. `split`
//! yields one [`NoiseCipher`] per direction.

use courier_shared::constants::HANDSHAKE_PROLOGUE;
use libsignal_protocol::{IdentityKey, IdentityKeyPair};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::aead::{self, NONCE_LEN};
use crate::error::CryptoError;
use crate::identity::{sign, verify};
use crate::kdf::{hkdf, sha256};
use crate::keys::{KeyPair, KEY_LEN};

pub const NOISE_PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";

fn handshake_error(what: &str) -> CryptoError {
    CryptoError::Handshake(what.to_string())
}

fn nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// One direction of an established transport. The counter is the nonce and
/// only moves forward.
pub struct NoiseCipher {
    key: [u8; KEY_LEN],
    counter: u64,
}

impl NoiseCipher {
    fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key, counter: 0 }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        let n = nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| handshake_error("transport nonce exhausted"))?;
        Ok(n)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let n = self.next_nonce()?;
        aead::seal(&self.key, &n, plaintext, &[])
    }

    /// Decrypt the next frame. A failed frame still consumes its nonce, so
    /// the stream cannot recover from it; callers treat it as fatal.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let n = self.next_nonce()?;
        aead::open(&self.key, &n, ciphertext, &[])
    }
}

impl Drop for NoiseCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// The cipher pair produced by a completed handshake.
pub struct TransportCiphers {
    pub send: NoiseCipher,
    pub recv: NoiseCipher,
}

/// Running transcript hash and chaining key.
struct SymmetricState {
    chaining_key: [u8; KEY_LEN],
    hash: [u8; KEY_LEN],
    key: Option<[u8; KEY_LEN]>,
    counter: u64,
}

impl SymmetricState {
    fn new(prologue: &[u8]) -> Self {
        let mut hash = [0u8; KEY_LEN];
        if NOISE_PROTOCOL_NAME.len() <= KEY_LEN {
            hash[..NOISE_PROTOCOL_NAME.len()].copy_from_slice(NOISE_PROTOCOL_NAME);
        } else {
            hash = sha256(&[NOISE_PROTOCOL_NAME]);
        }
        let mut state = Self {
            chaining_key: hash,
            hash,
            key: None,
            counter: 0,
        };
        state.mix_hash(prologue);
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.hash = sha256(&[&self.hash[..], data]);
    }

    fn mix_key(&mut self, input: &[u8]) -> Result<(), CryptoError> {
        let mut okm = [0u8; 2 * KEY_LEN];
        hkdf(Some(&self.chaining_key), input, &[], &mut okm)?;
        let mut key = [0u8; KEY_LEN];
        self.chaining_key.copy_from_slice(&okm[..KEY_LEN]);
        key.copy_from_slice(&okm[KEY_LEN..]);
        okm.zeroize();
        self.key = Some(key);
        self.counter = 0;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = match &self.key {
            Some(key) => {
                let ct = aead::seal(key, &nonce(self.counter), plaintext, &self.hash)?;
                self.counter += 1;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = match &self.key {
            Some(key) => {
                let pt = aead::open(key, &nonce(self.counter), ciphertext, &self.hash)
                    .map_err(|_| handshake_error("handshake message failed to decrypt"))?;
                self.counter += 1;
                pt
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the initiator-to-responder and responder-to-initiator ciphers.
    fn split(&self) -> Result<(NoiseCipher, NoiseCipher), CryptoError> {
        let mut okm = [0u8; 2 * KEY_LEN];
        hkdf(Some(&self.chaining_key), &[], &[], &mut okm)?;
        let mut first = [0u8; KEY_LEN];
        let mut second = [0u8; KEY_LEN];
        first.copy_from_slice(&okm[..KEY_LEN]);
        second.copy_from_slice(&okm[KEY_LEN..]);
        okm.zeroize();
        Ok((NoiseCipher::new(first), NoiseCipher::new(second)))
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.chaining_key.zeroize();
        if let Some(key) = &mut self.key {
            key.zeroize();
        }
    }
}

/// Handshake frames, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    ClientHello {
        ephemeral: [u8; KEY_LEN],
    },
    ServerHello {
        ephemeral: [u8; KEY_LEN],
        static_key: Vec<u8>,
        payload: Vec<u8>,
    },
    ClientFinish {
        static_key: Vec<u8>,
        payload: Vec<u8>,
    },
}

impl HandshakeMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::Handshake(format!("malformed handshake message: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    /// The relay's static transport key.
    pub key: [u8; KEY_LEN],
    pub issuer: String,
    /// Expiry, unix seconds.
    pub expires: i64,
}

/// The relay's proof that its static key is vouched for by a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseCertificate {
    pub details: CertificateDetails,
    pub signature: Vec<u8>,
}

impl NoiseCertificate {
    /// Sign `key` with the root keypair.
    pub fn issue(
        root: &IdentityKeyPair,
        issuer: impl Into<String>,
        key: [u8; KEY_LEN],
        expires: i64,
    ) -> Result<Self, CryptoError> {
        let details = CertificateDetails {
            key,
            issuer: issuer.into(),
            expires,
        };
        let signature = sign(root, &serde_json::to_vec(&details)?)?;
        Ok(Self { details, signature })
    }

    pub fn verify(
        &self,
        static_key: &[u8; KEY_LEN],
        trusted_root: Option<&IdentityKey>,
        now: i64,
    ) -> Result<(), CryptoError> {
        if self.details.key != *static_key {
            return Err(handshake_error("certificate key does not match static key"));
        }
        if let Some(root) = trusted_root {
            verify(root, &serde_json::to_vec(&self.details)?, &self.signature)
                .map_err(|_| handshake_error("certificate signature invalid"))?;
            if self.details.expires <= now {
                return Err(handshake_error("certificate expired"));
            }
        }
        Ok(())
    }
}

fn static_key_from(bytes: Vec<u8>) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| handshake_error("static key has wrong length"))
}

/// Initiator side, waiting for the server hello.
pub struct ClientHandshake {
    state: SymmetricState,
    ephemeral: KeyPair,
    static_key: KeyPair,
    trusted_root: Option<IdentityKey>,
}

impl ClientHandshake {
    /// Begin a handshake; returns the state and the first frame to send.
    pub fn start(
        static_key: KeyPair,
        trusted_root: Option<IdentityKey>,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = SymmetricState::new(HANDSHAKE_PROLOGUE);
        let ephemeral = KeyPair::generate();
        state.mix_hash(&ephemeral.public_bytes());
        let frame = HandshakeMessage::ClientHello {
            ephemeral: ephemeral.public_bytes(),
        }
        .encode()?;
        Ok((
            Self {
                state,
                ephemeral,
                static_key,
                trusted_root,
            },
            frame,
        ))
    }

    /// Consume the server hello and produce the final frame carrying our
    /// static key and `payload`.
    pub fn process_server_hello(
        mut self,
        frame: &[u8],
        payload: &[u8],
    ) -> Result<(Vec<u8>, TransportCiphers), CryptoError> {
        let (remote_ephemeral, encrypted_static, encrypted_cert) =
            match HandshakeMessage::decode(frame)? {
                HandshakeMessage::ServerHello {
                    ephemeral,
                    static_key,
                    payload,
                } => (ephemeral, static_key, payload),
                _ => return Err(handshake_error("expected server hello")),
            };

        self.state.mix_hash(&remote_ephemeral);
        self.state
            .mix_key(&*self.ephemeral.agree(&remote_ephemeral))?;

        let remote_static = static_key_from(self.state.decrypt_and_hash(&encrypted_static)?)?;
        self.state.mix_key(&*self.ephemeral.agree(&remote_static))?;

        let cert_bytes = self.state.decrypt_and_hash(&encrypted_cert)?;
        let certificate: NoiseCertificate = serde_json::from_slice(&cert_bytes)
            .map_err(|e| CryptoError::Handshake(format!("malformed certificate: {e}")))?;
        certificate.verify(
            &remote_static,
            self.trusted_root.as_ref(),
            chrono::Utc::now().timestamp(),
        )?;

        let encrypted_own_static = self
            .state
            .encrypt_and_hash(&self.static_key.public_bytes())?;
        self.state
            .mix_key(&*self.static_key.agree(&remote_ephemeral))?;
        let encrypted_payload = self.state.encrypt_and_hash(payload)?;

        let finish = HandshakeMessage::ClientFinish {
            static_key: encrypted_own_static,
            payload: encrypted_payload,
        }
        .encode()?;
        let (send, recv) = self.state.split()?;
        Ok((finish, TransportCiphers { send, recv }))
    }
}

/// What the responder learns from a completed handshake.
pub struct AcceptedHandshake {
    pub remote_static: [u8; KEY_LEN],
    pub payload: Vec<u8>,
    pub ciphers: TransportCiphers,
}

/// Responder side, waiting for the client finish.
pub struct ServerHandshake {
    state: SymmetricState,
    ephemeral: KeyPair,
}

impl ServerHandshake {
    /// Answer a client hello with our ephemeral, static key and certificate.
    pub fn accept(
        static_key: &KeyPair,
        certificate: &NoiseCertificate,
        client_hello: &[u8],
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let remote_ephemeral = match HandshakeMessage::decode(client_hello)? {
            HandshakeMessage::ClientHello { ephemeral } => ephemeral,
            _ => return Err(handshake_error("expected client hello")),
        };

        let mut state = SymmetricState::new(HANDSHAKE_PROLOGUE);
        state.mix_hash(&remote_ephemeral);

        let ephemeral = KeyPair::generate();
        state.mix_hash(&ephemeral.public_bytes());
        state.mix_key(&*ephemeral.agree(&remote_ephemeral))?;
        let encrypted_static = state.encrypt_and_hash(&static_key.public_bytes())?;
        state.mix_key(&*static_key.agree(&remote_ephemeral))?;
        let encrypted_cert = state.encrypt_and_hash(&serde_json::to_vec(certificate)?)?;

        let frame = HandshakeMessage::ServerHello {
            ephemeral: ephemeral.public_bytes(),
            static_key: encrypted_static,
            payload: encrypted_cert,
        }
        .encode()?;
        Ok((Self { state, ephemeral }, frame))
    }

    pub fn complete(mut self, frame: &[u8]) -> Result<AcceptedHandshake, CryptoError> {
        let (encrypted_static, encrypted_payload) = match HandshakeMessage::decode(frame)? {
            HandshakeMessage::ClientFinish {
                static_key,
                payload,
            } => (static_key, payload),
            _ => return Err(handshake_error("expected client finish")),
        };

        let remote_static = static_key_from(self.state.decrypt_and_hash(&encrypted_static)?)?;
        self.state.mix_key(&*self.ephemeral.agree(&remote_static))?;
        let payload = self.state.decrypt_and_hash(&encrypted_payload)?;

        let (recv, send) = self.state.split()?;
        Ok(AcceptedHandshake {
            remote_static,
            payload,
            ciphers: TransportCiphers { send, recv },
        })
    }
}
