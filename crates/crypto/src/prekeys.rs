//! Pre-key management.
//!
//! Generates signed pre-keys (each paired with a last-resort Kyber pre-key)
//! and one-time pre-keys, assembles the public bundle other devices use to
//! reach us, and handles upload tracking and signed pre-key rotation.

use courier_shared::constants::MAX_PRE_KEY_ID;
use libsignal_protocol::{
    kem, GenericSignedPreKey, IdentityKey, KeyPair, KyberPreKeyId, KyberPreKeyRecord, PreKeyId,
    PreKeyRecord, SignedPreKeyId, SignedPreKeyRecord, Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::{get_identity, get_registration_id, sign, verify};
use crate::storage::{IdentityKeyStore, KyberPreKeyStore, PreKeyStore, SignedPreKeyStore};

/// The public half of a one-time pre-key, as uploaded to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPreKey {
    pub key_id: u32,
    /// libsignal-serialized public key
    pub public_key: Vec<u8>,
}

/// Everything a remote device needs to start a session with us without a
/// live round trip. Key fields hold libsignal-serialized public keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPreKeyBundle {
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub kyber_pre_key_id: u32,
    pub kyber_pre_key: Vec<u8>,
    pub kyber_pre_key_signature: Vec<u8>,
    #[serde(default)]
    pub pre_key: Option<SerializedPreKey>,
}

impl SerializedPreKeyBundle {
    /// Check both pre-key signatures against the bundle's identity.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let identity = IdentityKey::decode(&self.identity_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        verify(&identity, &self.signed_pre_key, &self.signed_pre_key_signature)
            .map_err(|_| CryptoError::InvalidSignature("signed pre-key signature"))?;
        verify(&identity, &self.kyber_pre_key, &self.kyber_pre_key_signature)
            .map_err(|_| CryptoError::InvalidSignature("kyber pre-key signature"))
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Generate and store a new signed pre-key with the next free id, together
/// with the last-resort Kyber pre-key published beside it.
pub async fn generate_signed_pre_key<S>(store: &S) -> Result<SignedPreKeyRecord, CryptoError>
where
    S: IdentityKeyStore + SignedPreKeyStore + KyberPreKeyStore + ?Sized,
{
    let identity = get_identity(store).await?;
    let id = store.next_signed_pre_key_id().await?;

    let pair = KeyPair::generate(&mut rand::rng());
    let signature = sign(&identity, &pair.public_key.serialize())?;
    let record = SignedPreKeyRecord::new(
        SignedPreKeyId::from(id),
        Timestamp::from_epoch_millis(now_millis()),
        &pair,
        &signature,
    );
    let kyber = KyberPreKeyRecord::generate(
        kem::KeyType::Kyber1024,
        KyberPreKeyId::from(id),
        identity.private_key(),
    )?;

    store.save_kyber_pre_key(&kyber).await?;
    store.save_signed_pre_key(&record).await?;
    tracing::debug!(signed_pre_key_id = id, "generated signed pre-key");
    Ok(record)
}

/// The signed pre-key currently published and its Kyber companion,
/// generating either one if it is missing.
pub async fn current_signed_pre_keys<S>(
    store: &S,
) -> Result<(SignedPreKeyRecord, KyberPreKeyRecord), CryptoError>
where
    S: IdentityKeyStore + SignedPreKeyStore + KyberPreKeyStore + ?Sized,
{
    let signed = match store.latest_signed_pre_key().await? {
        Some(record) => record,
        None => generate_signed_pre_key(store).await?,
    };
    let id = u32::from(signed.id()?);
    let kyber = match store.get_kyber_pre_key(id).await? {
        Some(record) => record,
        None => {
            let identity = get_identity(store).await?;
            let record = KyberPreKeyRecord::generate(
                kem::KeyType::Kyber1024,
                KyberPreKeyId::from(id),
                identity.private_key(),
            )?;
            store.save_kyber_pre_key(&record).await?;
            record
        }
    };
    Ok((signed, kyber))
}

/// Build our public bundle from the current signed pre-keys. With
/// `one_time_key`, a fresh one-time pre-key is generated, stored and
/// included.
pub async fn generate_pre_key_bundle<S>(
    store: &S,
    one_time_key: bool,
) -> Result<SerializedPreKeyBundle, CryptoError>
where
    S: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + KyberPreKeyStore + ?Sized,
{
    let identity = get_identity(store).await?;
    let registration_id = get_registration_id(store).await?;
    let (signed, kyber) = current_signed_pre_keys(store).await?;

    let pre_key = if one_time_key {
        generate_one_time_pre_keys(store, 1).await?.into_iter().next()
    } else {
        None
    };

    Ok(SerializedPreKeyBundle {
        registration_id,
        identity_key: identity.identity_key().serialize().to_vec(),
        signed_pre_key_id: u32::from(signed.id()?),
        signed_pre_key: signed.public_key()?.serialize().to_vec(),
        signed_pre_key_signature: signed.signature()?,
        kyber_pre_key_id: u32::from(kyber.id()?),
        kyber_pre_key: kyber.public_key()?.serialize().to_vec(),
        kyber_pre_key_signature: kyber.signature()?,
        pre_key,
    })
}

/// Generate a batch of one-time pre-keys with sequential ids, stored as not
/// yet uploaded. Ids wrap back to 1 after `MAX_PRE_KEY_ID`.
pub async fn generate_one_time_pre_keys<S>(
    store: &S,
    count: u32,
) -> Result<Vec<SerializedPreKey>, CryptoError>
where
    S: PreKeyStore + ?Sized,
{
    let start_id = store.next_pre_key_id().await?;
    let mut records = Vec::with_capacity(count as usize);
    let mut public = Vec::with_capacity(count as usize);
    for i in 0..count {
        let id = (start_id - 1 + i) % MAX_PRE_KEY_ID + 1;
        let pair = KeyPair::generate(&mut rand::rng());
        public.push(SerializedPreKey {
            key_id: id,
            public_key: pair.public_key.serialize().to_vec(),
        });
        records.push(PreKeyRecord::new(PreKeyId::from(id), &pair));
    }
    store.save_pre_keys(&records).await?;
    Ok(public)
}

/// Whether the newest signed pre-key is older than `max_age_days` (or
/// missing entirely).
pub async fn is_signed_pre_key_stale<S>(store: &S, max_age_days: u32) -> Result<bool, CryptoError>
where
    S: SignedPreKeyStore + ?Sized,
{
    match store.latest_signed_pre_key().await? {
        Some(record) => {
            let age = now_millis().saturating_sub(record.timestamp()?.epoch_millis());
            Ok(age > u64::from(max_age_days) * 86_400_000)
        }
        None => Ok(true),
    }
}

/// Rotate the signed pre-key. Old signed pre-keys stay in storage because
/// in-flight first messages may still reference them.
pub async fn rotate_signed_pre_key<S>(store: &S) -> Result<SignedPreKeyRecord, CryptoError>
where
    S: IdentityKeyStore + SignedPreKeyStore + KyberPreKeyStore + ?Sized,
{
    generate_signed_pre_key(store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;
    use crate::storage::MemoryStore;

    async fn store_with_identity() -> MemoryStore {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        store
    }

    #[tokio::test]
    async fn generate_pre_key_bundle_returns_verifiable_bundle() {
        let store = store_with_identity().await;
        let bundle = generate_pre_key_bundle(&store, false).await.unwrap();

        assert!(bundle.verify().is_ok());
        assert!(bundle.pre_key.is_none());
        assert!(bundle.signed_pre_key_id > 0);
        assert_eq!(bundle.kyber_pre_key_id, bundle.signed_pre_key_id);
        assert!(bundle.registration_id >= 1 && bundle.registration_id <= 16380);
    }

    #[tokio::test]
    async fn generate_pre_key_bundle_reuses_latest_signed_pre_key() {
        let store = store_with_identity().await;
        let first = generate_pre_key_bundle(&store, false).await.unwrap();
        let second = generate_pre_key_bundle(&store, true).await.unwrap();

        assert_eq!(first.signed_pre_key_id, second.signed_pre_key_id);
        assert_eq!(first.kyber_pre_key, second.kyber_pre_key);
        let one_time = second.pre_key.unwrap();
        assert!(store.get_pre_key(one_time.key_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tampered_bundle_fails_verification() {
        let store = store_with_identity().await;
        let bundle = generate_pre_key_bundle(&store, false).await.unwrap();

        let mut signed = bundle.clone();
        signed.signed_pre_key[5] ^= 0xFF;
        assert!(matches!(
            signed.verify(),
            Err(CryptoError::InvalidSignature(_))
        ));

        let mut kyber = bundle;
        kyber.kyber_pre_key_signature[0] ^= 0xFF;
        assert!(matches!(
            kyber.verify(),
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn one_time_pre_keys_have_sequential_ids_across_batches() {
        let store = store_with_identity().await;
        let first = generate_one_time_pre_keys(&store, 5).await.unwrap();
        let second = generate_one_time_pre_keys(&store, 3).await.unwrap();

        let ids: Vec<u32> = first.iter().chain(second.iter()).map(|k| k.key_id).collect();
        for pair in ids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[tokio::test]
    async fn one_time_pre_keys_start_unuploaded() {
        let store = store_with_identity().await;
        let keys = generate_one_time_pre_keys(&store, 10).await.unwrap();
        assert_eq!(store.count_uploaded_pre_keys().await.unwrap(), 0);

        let ids: Vec<u32> = keys[..4].iter().map(|k| k.key_id).collect();
        store.mark_pre_keys_uploaded(&ids).await.unwrap();
        assert_eq!(store.count_uploaded_pre_keys().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn signed_pre_key_staleness() {
        let store = store_with_identity().await;
        assert!(is_signed_pre_key_stale(&store, 7).await.unwrap());

        generate_signed_pre_key(&store).await.unwrap();
        assert!(!is_signed_pre_key_stale(&store, 7).await.unwrap());
    }

    #[tokio::test]
    async fn rotate_signed_pre_key_assigns_new_id_and_kyber_key() {
        let store = store_with_identity().await;
        let first = generate_signed_pre_key(&store).await.unwrap();
        let second = rotate_signed_pre_key(&store).await.unwrap();

        let first_id = u32::from(first.id().unwrap());
        let second_id = u32::from(second.id().unwrap());
        assert_ne!(first_id, second_id);
        assert!(store.get_signed_pre_key(first_id).await.unwrap().is_some());
        assert!(store.get_kyber_pre_key(second_id).await.unwrap().is_some());
    }
}
