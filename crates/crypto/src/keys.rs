//! The X25519 static keypair used by the Noise transport handshake.
//!
//! Message-layer keys (identity, pre-keys, sessions) are libsignal types;
//! this module only covers what the transport needs on top of them.

use libsignal_protocol::IdentityKeyPair;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

/// Fill an array from the thread-local CSPRNG.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// An X25519 keypair for Noise static and ephemeral keys.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_bytes())
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The transport static key of a device is its identity key: both are
    /// Curve25519, so the identity's private scalar is used as-is.
    pub fn from_identity(identity: &IdentityKeyPair) -> Result<Self, CryptoError> {
        let private = Zeroizing::new(identity.private_key().serialize().to_vec());
        let bytes: [u8; KEY_LEN] = private
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity private key length".into()))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 agreement with a remote public key.
    pub fn agree(&self, their_public: &[u8; KEY_LEN]) -> Zeroizing<[u8; KEY_LEN]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        Zeroizing::new(*shared.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(*a.agree(&b.public_bytes()), *b.agree(&a.public_bytes()));
    }

    #[test]
    fn identity_static_key_matches_identity_public_key() {
        let identity = IdentityKeyPair::generate(&mut rand::rng());
        let static_key = KeyPair::from_identity(&identity).unwrap();

        // libsignal prefixes the 32-byte point with a one-byte type tag.
        let public = identity.public_key().serialize();
        assert_eq!(&public[1..], &static_key.public_bytes()[..]);
    }

    #[test]
    fn secret_bytes_rebuild_the_same_pair() {
        let pair = KeyPair::generate();
        let rebuilt = KeyPair::from_secret_bytes(*pair.secret_bytes());
        assert_eq!(rebuilt.public_bytes(), pair.public_bytes());
    }
}
