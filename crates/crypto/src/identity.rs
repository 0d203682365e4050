//! Local identity management.
//!
//! Generates the Curve25519 identity keypair and registration id via
//! libsignal, loads them back from the store, and produces the signed
//! device-identity proof that accompanies every first-session message.

use courier_shared::constants::MAX_REGISTRATION_ID;
use courier_shared::ids::DeviceAddress;
use libsignal_protocol::{IdentityKey, IdentityKeyPair};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::storage::IdentityKeyStore;

/// Generate a new identity keypair and registration id and store them.
///
/// Returns an error if an identity already exists (to prevent accidental
/// overwrite, which would break existing sessions).
pub async fn generate_identity<S>(store: &S) -> Result<IdentityKeyPair, CryptoError>
where
    S: IdentityKeyStore + ?Sized,
{
    if store.get_identity_key_pair().await?.is_some() {
        return Err(CryptoError::StorageError("identity already exists".into()));
    }

    let keypair = IdentityKeyPair::generate(&mut rand::rng());
    let registration_id: u32 = rand::rng().random_range(1..=MAX_REGISTRATION_ID);
    store.store_local_identity(&keypair, registration_id).await?;

    tracing::info!(registration_id, "generated local identity");
    Ok(keypair)
}

/// Load the local identity keypair, or `IdentityNotInitialized`.
pub async fn get_identity<S>(store: &S) -> Result<IdentityKeyPair, CryptoError>
where
    S: IdentityKeyStore + ?Sized,
{
    store
        .get_identity_key_pair()
        .await?
        .ok_or(CryptoError::IdentityNotInitialized)
}

pub async fn get_registration_id<S>(store: &S) -> Result<u32, CryptoError>
where
    S: IdentityKeyStore + ?Sized,
{
    store
        .get_local_registration_id()
        .await?
        .ok_or(CryptoError::IdentityNotInitialized)
}

/// XEdDSA signature with the identity private key.
pub fn sign(identity: &IdentityKeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signature = identity
        .private_key()
        .calculate_signature(message, &mut rand::rng())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(Vec::from(signature.as_ref()))
}

/// Check a signature made by [`sign`].
pub fn verify(key: &IdentityKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    if key.public_key().verify_signature(message, signature) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature("signature does not verify"))
    }
}

/// Signed statement binding a device address to its identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub details: DeviceIdentityDetails,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentityDetails {
    pub address: DeviceAddress,
    /// Serialized libsignal identity key.
    pub identity_key: Vec<u8>,
    pub timestamp: i64,
}

impl DeviceIdentity {
    /// Check the signature against the embedded identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let key = IdentityKey::decode(&self.details.identity_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        verify(&key, &serde_json::to_vec(&self.details)?, &self.signature)
            .map_err(|_| CryptoError::InvalidSignature("device identity"))
    }

    /// Verify, and additionally require the proof to be for `address` with
    /// the identity carried in the accompanying first message.
    pub fn verify_for(
        &self,
        address: &DeviceAddress,
        identity_key: &IdentityKey,
    ) -> Result<(), CryptoError> {
        if self.details.address != *address
            || self.details.identity_key.as_slice() != identity_key.serialize().as_ref()
        {
            return Err(CryptoError::InvalidSignature("device identity mismatch"));
        }
        self.verify()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidMessage(format!("device identity: {e}")))
    }
}

/// Produce a fresh proof for our own device.
pub async fn sign_device_identity<S>(
    store: &S,
    address: DeviceAddress,
) -> Result<DeviceIdentity, CryptoError>
where
    S: IdentityKeyStore + ?Sized,
{
    let identity = get_identity(store).await?;
    let details = DeviceIdentityDetails {
        address,
        identity_key: identity.identity_key().serialize().to_vec(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    let signature = sign(&identity, &serde_json::to_vec(&details)?)?;
    Ok(DeviceIdentity { details, signature })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use courier_shared::ids::UserId;

    #[tokio::test]
    async fn generate_identity_stores_keypair_and_registration_id() {
        let store = MemoryStore::new();
        let keypair = generate_identity(&store).await.unwrap();

        let loaded = get_identity(&store).await.unwrap();
        assert_eq!(loaded.identity_key(), keypair.identity_key());
        assert_eq!(loaded.public_key().serialize().len(), 33);

        let reg_id = get_registration_id(&store).await.unwrap();
        assert!((1..=MAX_REGISTRATION_ID).contains(&reg_id));
    }

    #[tokio::test]
    async fn generate_identity_called_twice_returns_error() {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        assert!(generate_identity(&store).await.is_err());
    }

    #[tokio::test]
    async fn get_identity_returns_identity_not_initialized_on_empty_store() {
        let store = MemoryStore::new();
        assert!(matches!(
            get_identity(&store).await,
            Err(CryptoError::IdentityNotInitialized)
        ));
    }

    #[test]
    fn signatures_verify_only_for_the_signed_message() {
        let pair = IdentityKeyPair::generate(&mut rand::rng());
        let signature = sign(&pair, b"challenge").unwrap();
        assert!(verify(pair.identity_key(), b"challenge", &signature).is_ok());
        assert!(verify(pair.identity_key(), b"other", &signature).is_err());

        let stranger = IdentityKeyPair::generate(&mut rand::rng());
        assert!(verify(stranger.identity_key(), b"challenge", &signature).is_err());
    }

    #[tokio::test]
    async fn device_identity_proof_verifies() {
        let store = MemoryStore::new();
        let keypair = generate_identity(&store).await.unwrap();
        let address = DeviceAddress::new(UserId::new(), 1);

        let proof = sign_device_identity(&store, address).await.unwrap();
        let decoded = DeviceIdentity::decode(&proof.encode().unwrap()).unwrap();
        assert!(decoded.verify_for(&address, keypair.identity_key()).is_ok());
    }

    #[tokio::test]
    async fn device_identity_proof_rejects_other_address_or_key() {
        let store = MemoryStore::new();
        let keypair = generate_identity(&store).await.unwrap();
        let address = DeviceAddress::new(UserId::new(), 1);
        let proof = sign_device_identity(&store, address).await.unwrap();

        let other_address = DeviceAddress::new(UserId::new(), 1);
        assert!(proof.verify_for(&other_address, keypair.identity_key()).is_err());

        let other_key = IdentityKeyPair::generate(&mut rand::rng());
        assert!(proof.verify_for(&address, other_key.identity_key()).is_err());

        let mut tampered = proof.clone();
        tampered.details.timestamp += 1;
        assert!(tampered.verify().is_err());
    }
}
