//! In-memory store backed by concurrent maps.
//!
//! Records are kept serialized, exactly as the SQLite backend keeps them, so
//! both backends hand out independent copies.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use courier_shared::constants::MAX_PRE_KEY_ID;
use courier_shared::ids::{DeviceAddress, GroupId};
use dashmap::DashMap;
use libsignal_protocol::{
    GenericSignedPreKey, IdentityChange, IdentityKey, IdentityKeyPair, KyberPreKeyRecord,
    PreKeyRecord, SenderKeyRecord, SessionRecord, SignedPreKeyRecord,
};
use tokio::sync::Mutex;

use crate::error::CryptoError;
use crate::storage::{
    decode_identity_pair, encode_identity_pair, AppStateCommit, AppStateVersion,
    IdentityKeyStore, KyberPreKeyStore, PreKeyStore, SenderKeyStore, SessionStore,
    SignedPreKeyStore, SyncKey, SyncStore,
};

struct LocalIdentity {
    public: Vec<u8>,
    private: Vec<u8>,
    registration_id: u32,
}

struct StoredSignedPreKey {
    record: Vec<u8>,
    created_at: u64,
}

pub struct MemoryStore {
    local: RwLock<Option<LocalIdentity>>,
    identities: DashMap<DeviceAddress, Vec<u8>>,
    pre_keys: DashMap<u32, (Vec<u8>, bool)>,
    next_pre_key_id: AtomicU32,
    signed_pre_keys: DashMap<u32, StoredSignedPreKey>,
    kyber_pre_keys: DashMap<u32, Vec<u8>>,
    sessions: DashMap<DeviceAddress, Vec<u8>>,
    sender_keys: DashMap<(GroupId, DeviceAddress), Vec<u8>>,
    sync_keys: DashMap<Vec<u8>, SyncKey>,
    app_state: DashMap<String, AppStateVersion>,
    mutation_macs: DashMap<(String, Vec<u8>), Vec<u8>>,
    /// Serializes app-state commits so readers never see half of one.
    commit_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            local: RwLock::new(None),
            identities: DashMap::new(),
            pre_keys: DashMap::new(),
            next_pre_key_id: AtomicU32::new(1),
            signed_pre_keys: DashMap::new(),
            kyber_pre_keys: DashMap::new(),
            sessions: DashMap::new(),
            sender_keys: DashMap::new(),
            sync_keys: DashMap::new(),
            app_state: DashMap::new(),
            mutation_macs: DashMap::new(),
            commit_lock: Mutex::new(()),
        }
    }

    fn local(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<LocalIdentity>>, CryptoError> {
        self.local
            .read()
            .map_err(|_| CryptoError::StorageError("identity lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityKeyStore for MemoryStore {
    async fn get_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        self.local()?
            .as_ref()
            .map(|l| decode_identity_pair(&l.public, &l.private))
            .transpose()
    }

    async fn get_local_registration_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(self.local()?.as_ref().map(|l| l.registration_id))
    }

    async fn store_local_identity(
        &self,
        keypair: &IdentityKeyPair,
        registration_id: u32,
    ) -> Result<(), CryptoError> {
        let mut local = self
            .local
            .write()
            .map_err(|_| CryptoError::StorageError("identity lock poisoned".into()))?;
        if local.is_some() {
            return Err(CryptoError::StorageError("identity already exists".into()));
        }
        let (public, private) = encode_identity_pair(keypair);
        *local = Some(LocalIdentity {
            public,
            private,
            registration_id,
        });
        Ok(())
    }

    async fn save_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError> {
        let bytes = identity.serialize().to_vec();
        let previous = self.identities.insert(*address, bytes.clone());
        Ok(IdentityChange::from_changed(
            previous.is_some_and(|old| old != bytes),
        ))
    }

    async fn is_trusted_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        Ok(self
            .identities
            .get(address)
            .map_or(true, |stored| stored.as_slice() == identity.serialize().as_ref()))
    }

    async fn get_identity(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<IdentityKey>, CryptoError> {
        self.identities
            .get(address)
            .map(|bytes| {
                IdentityKey::decode(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
            })
            .transpose()
    }

    async fn remove_identity(&self, address: &DeviceAddress) -> Result<(), CryptoError> {
        self.identities.remove(address);
        Ok(())
    }
}

#[async_trait]
impl PreKeyStore for MemoryStore {
    async fn get_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError> {
        self.pre_keys
            .get(&id)
            .map(|e| PreKeyRecord::deserialize(&e.0).map_err(CryptoError::from))
            .transpose()
    }

    async fn save_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), CryptoError> {
        let mut last = None;
        for record in records {
            let id = u32::from(record.id()?);
            self.pre_keys.insert(id, (record.serialize()?, false));
            last = Some(id);
        }
        if let Some(last) = last {
            self.next_pre_key_id
                .store(last % MAX_PRE_KEY_ID + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove_pre_key(&self, id: u32) -> Result<(), CryptoError> {
        self.pre_keys.remove(&id);
        Ok(())
    }

    async fn next_pre_key_id(&self) -> Result<u32, CryptoError> {
        Ok(self.next_pre_key_id.load(Ordering::SeqCst))
    }

    async fn mark_pre_keys_uploaded(&self, ids: &[u32]) -> Result<(), CryptoError> {
        for id in ids {
            if let Some(mut entry) = self.pre_keys.get_mut(id) {
                entry.1 = true;
            }
        }
        Ok(())
    }

    async fn count_uploaded_pre_keys(&self) -> Result<usize, CryptoError> {
        Ok(self.pre_keys.iter().filter(|e| e.1).count())
    }
}

#[async_trait]
impl SignedPreKeyStore for MemoryStore {
    async fn get_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.signed_pre_keys
            .get(&id)
            .map(|s| SignedPreKeyRecord::deserialize(&s.record).map_err(CryptoError::from))
            .transpose()
    }

    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        self.signed_pre_keys.insert(
            u32::from(record.id()?),
            StoredSignedPreKey {
                record: record.serialize()?,
                created_at: record.timestamp()?.epoch_millis(),
            },
        );
        Ok(())
    }

    async fn latest_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        let latest = self
            .signed_pre_keys
            .iter()
            .max_by_key(|s| (s.created_at, *s.key()))
            .map(|s| s.record.clone());
        latest
            .map(|bytes| SignedPreKeyRecord::deserialize(&bytes).map_err(CryptoError::from))
            .transpose()
    }

    async fn next_signed_pre_key_id(&self) -> Result<u32, CryptoError> {
        Ok(self
            .signed_pre_keys
            .iter()
            .map(|r| *r.key())
            .max()
            .map_or(1, |id| id + 1))
    }
}

#[async_trait]
impl KyberPreKeyStore for MemoryStore {
    async fn get_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, CryptoError> {
        self.kyber_pre_keys
            .get(&id)
            .map(|bytes| KyberPreKeyRecord::deserialize(&bytes).map_err(CryptoError::from))
            .transpose()
    }

    async fn save_kyber_pre_key(&self, record: &KyberPreKeyRecord) -> Result<(), CryptoError> {
        self.kyber_pre_keys
            .insert(u32::from(record.id()?), record.serialize()?);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_session(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<SessionRecord>, CryptoError> {
        self.sessions
            .get(address)
            .map(|bytes| SessionRecord::deserialize(&bytes).map_err(CryptoError::from))
            .transpose()
    }

    async fn store_session(
        &self,
        address: &DeviceAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError> {
        self.sessions.insert(*address, record.serialize()?);
        Ok(())
    }

    async fn delete_session(&self, address: &DeviceAddress) -> Result<(), CryptoError> {
        self.sessions.remove(address);
        Ok(())
    }
}

#[async_trait]
impl SenderKeyStore for MemoryStore {
    async fn load_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
    ) -> Result<Option<SenderKeyRecord>, CryptoError> {
        self.sender_keys
            .get(&(*group, *sender))
            .map(|bytes| SenderKeyRecord::deserialize(&bytes).map_err(CryptoError::from))
            .transpose()
    }

    async fn store_sender_key(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
        record: &SenderKeyRecord,
    ) -> Result<(), CryptoError> {
        self.sender_keys
            .insert((*group, *sender), record.serialize()?);
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<SyncKey>, CryptoError> {
        Ok(self.sync_keys.get(key_id).map(|k| k.clone()))
    }

    async fn store_sync_key(&self, key: &SyncKey) -> Result<(), CryptoError> {
        self.sync_keys.insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    async fn latest_sync_key(&self) -> Result<Option<SyncKey>, CryptoError> {
        Ok(self
            .sync_keys
            .iter()
            .max_by_key(|k| k.timestamp)
            .map(|k| k.clone()))
    }

    async fn get_app_state_version(
        &self,
        name: &str,
    ) -> Result<Option<AppStateVersion>, CryptoError> {
        let _guard = self.commit_lock.lock().await;
        Ok(self.app_state.get(name).map(|v| v.clone()))
    }

    async fn get_mutation_mac(
        &self,
        name: &str,
        index_mac: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .mutation_macs
            .get(&(name.to_string(), index_mac.to_vec()))
            .map(|m| m.clone()))
    }

    async fn commit_app_state(&self, commit: &AppStateCommit) -> Result<(), CryptoError> {
        let _guard = self.commit_lock.lock().await;
        if commit.replace_all {
            self.mutation_macs.retain(|(name, _), _| *name != commit.name);
        }
        for mutation in &commit.mutations {
            let key = (commit.name.clone(), mutation.index_mac.clone());
            match &mutation.value_mac {
                Some(value_mac) => {
                    self.mutation_macs.insert(key, value_mac.clone());
                }
                None => {
                    self.mutation_macs.remove(&key);
                }
            }
        }
        self.app_state
            .insert(commit.name.clone(), commit.state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MutationMac;
    use courier_shared::ids::UserId;

    #[tokio::test]
    async fn identity_trust_is_first_use() {
        let store = MemoryStore::new();
        let address = DeviceAddress::new(UserId::new(), 2);
        let first = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();
        let second = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();

        assert!(store.is_trusted_identity(&address, &first).await.unwrap());
        store.save_identity(&address, &first).await.unwrap();
        assert!(!store.is_trusted_identity(&address, &second).await.unwrap());
        assert_eq!(
            store.save_identity(&address, &second).await.unwrap(),
            IdentityChange::ReplacedExisting
        );
    }

    #[tokio::test]
    async fn pre_key_id_counter_wraps() {
        let store = MemoryStore::new();
        let pair = libsignal_protocol::KeyPair::generate(&mut rand::rng());
        let record = PreKeyRecord::new(libsignal_protocol::PreKeyId::from(MAX_PRE_KEY_ID), &pair);
        store.save_pre_keys(&[record]).await.unwrap();
        assert_eq!(store.next_pre_key_id().await.unwrap(), 1);
        assert!(store.get_pre_key(MAX_PRE_KEY_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_replaces_indexes_for_snapshots_only() {
        let store = MemoryStore::new();
        let mac = |i: u8| MutationMac {
            index_mac: vec![i],
            value_mac: Some(vec![i]),
        };
        let commit = |version: u64, replace_all, mutations| AppStateCommit {
            name: "regular".into(),
            state: AppStateVersion {
                version,
                hash: vec![0; 128],
            },
            replace_all,
            mutations,
        };

        store
            .commit_app_state(&commit(1, true, vec![mac(1)]))
            .await
            .unwrap();
        store
            .commit_app_state(&commit(2, false, vec![mac(2)]))
            .await
            .unwrap();
        assert!(store.get_mutation_mac("regular", &[1]).await.unwrap().is_some());

        store
            .commit_app_state(&commit(9, true, vec![mac(3)]))
            .await
            .unwrap();
        assert!(store.get_mutation_mac("regular", &[1]).await.unwrap().is_none());
        assert!(store.get_mutation_mac("regular", &[3]).await.unwrap().is_some());
        assert_eq!(
            store
                .get_app_state_version("regular")
                .await
                .unwrap()
                .unwrap()
                .version,
            9
        );
    }
}
