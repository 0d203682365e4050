//! Store-backed encrypt/decrypt for pairwise and group messages.
//!
//! `SessionCipher` is the only component that mutates sessions and sender
//! keys. Each operation runs one libsignal call under a per-address (or
//! per group sender) async lock, so concurrent deliveries for the same peer
//! are applied one at a time. Plaintexts are padded before encryption and
//! unpadded after decryption.

use std::hash::Hash;
use std::sync::Arc;
use std::time::SystemTime;

use courier_shared::ids::{DeviceAddress, GroupId};
use dashmap::DashMap;
use futures::executor::block_on;
use libsignal_protocol::{
    create_sender_key_distribution_message, group_decrypt, group_encrypt, message_decrypt_prekey,
    message_decrypt_signal, message_encrypt, process_prekey_bundle,
    process_sender_key_distribution_message, CiphertextMessageType, PreKeySignalMessage,
    SenderKeyDistributionMessage, SenderKeyMessage, SignalMessage, SignalProtocolError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::CryptoError;
use crate::padding::{pad, unpad};
use crate::prekeys::SerializedPreKeyBundle;
use crate::session::{pre_key_bundle, protocol_address};
use crate::storage::{ProtocolStore, SignalStore};

/// The `type` attribute of an `<enc>` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiphertextType {
    /// First-session message carrying bootstrap material.
    PreKey,
    /// Ongoing-session message.
    Signal,
    /// Group message under a sender key.
    SenderKey,
}

impl CiphertextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiphertextType::PreKey => "pkmsg",
            CiphertextType::Signal => "msg",
            CiphertextType::SenderKey => "skmsg",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pkmsg" => Some(CiphertextType::PreKey),
            "msg" => Some(CiphertextType::Signal),
            "skmsg" => Some(CiphertextType::SenderKey),
            _ => None,
        }
    }
}

impl std::fmt::Display for CiphertextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type LockMap<K> = DashMap<K, Arc<Mutex<()>>>;

/// Holds one keyed lock. The map entry is dropped with the last holder.
struct KeyedGuard<'a, K: Eq + Hash> {
    locks: &'a LockMap<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

async fn lock_key<K: Eq + Hash + Copy>(locks: &LockMap<K>, key: K) -> KeyedGuard<'_, K> {
    let lock = locks.entry(key).or_default().clone();
    KeyedGuard {
        locks,
        key,
        guard: Some(lock.lock_owned().await),
    }
}

/// Attach the address we were working on to libsignal's error.
fn pairwise_error(err: SignalProtocolError, address: &DeviceAddress) -> CryptoError {
    match err {
        SignalProtocolError::DuplicatedMessage(_, counter) => CryptoError::DuplicatedMessage {
            address: address.to_string(),
            counter,
        },
        SignalProtocolError::SessionNotFound(_) => CryptoError::SessionNotFound {
            address: address.to_string(),
        },
        SignalProtocolError::UntrustedIdentity(_) => CryptoError::UntrustedIdentity {
            address: address.to_string(),
        },
        other => other.into(),
    }
}

fn group_error(err: SignalProtocolError, group: &GroupId, sender: &DeviceAddress) -> CryptoError {
    match err {
        SignalProtocolError::NoSenderKeyState { .. } => CryptoError::NoSenderKey {
            group: group.to_string(),
            sender: sender.to_string(),
        },
        SignalProtocolError::DuplicatedMessage(_, counter) => CryptoError::DuplicatedMessage {
            address: sender.to_string(),
            counter,
        },
        other => other.into(),
    }
}

pub struct SessionCipher {
    store: Arc<dyn ProtocolStore>,
    address_locks: LockMap<DeviceAddress>,
    group_locks: LockMap<(GroupId, DeviceAddress)>,
    auto_trust_identity: bool,
}

impl SessionCipher {
    /// A cipher over `store`. Changed remote identities are rejected until
    /// [`with_auto_trust_identity`](Self::with_auto_trust_identity) says otherwise.
    pub fn new(store: Arc<dyn ProtocolStore>) -> Self {
        Self {
            store,
            address_locks: DashMap::new(),
            group_locks: DashMap::new(),
            auto_trust_identity: false,
        }
    }

    /// Replace a changed remote identity instead of rejecting it.
    pub fn with_auto_trust_identity(mut self, enabled: bool) -> Self {
        self.auto_trust_identity = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn ProtocolStore> {
        &self.store
    }

    fn signal(&self) -> SignalStore<'_> {
        SignalStore::new(&*self.store)
    }

    /// Whether a current session with `address` exists.
    pub async fn has_session(&self, address: &DeviceAddress) -> Result<bool, CryptoError> {
        self.store.has_session(address).await
    }

    /// Registration id the remote device announced in our current session,
    /// if there is one.
    pub async fn remote_registration_id(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<u32>, CryptoError> {
        Ok(self
            .store
            .load_session(address)
            .await?
            .and_then(|record| record.remote_registration_id().ok()))
    }

    /// Start a new session from a fetched bundle. Any current session is
    /// archived, never dropped.
    pub async fn process_pre_key_bundle(
        &self,
        address: &DeviceAddress,
        bundle: &SerializedPreKeyBundle,
    ) -> Result<(), CryptoError> {
        let _guard = lock_key(&self.address_locks, *address).await;
        self.process_bundle_locked(address, bundle)
    }

    fn process_bundle_locked(
        &self,
        address: &DeviceAddress,
        bundle: &SerializedPreKeyBundle,
    ) -> Result<(), CryptoError> {
        bundle.verify()?;
        let remote = protocol_address(address)?;
        let bundle = pre_key_bundle(address, bundle)?;

        let process = || {
            let mut sessions = self.signal();
            let mut identities = self.signal();
            block_on(process_prekey_bundle(
                &remote,
                &mut sessions,
                &mut identities,
                &bundle,
                SystemTime::now(),
                &mut rand::rng(),
            ))
        };

        let result = match process() {
            Err(SignalProtocolError::UntrustedIdentity(_)) if self.auto_trust_identity => {
                tracing::warn!(address = %address, "identity key changed, trusting new key from bundle");
                block_on(self.store.remove_identity(address))?;
                process()
            }
            other => other,
        };
        result.map_err(|e| pairwise_error(e, address))?;

        tracing::debug!(address = %address, "created session from pre-key bundle");
        Ok(())
    }

    /// Encrypt for one device, processing `bundle` first when given.
    pub async fn encrypt_for_device(
        &self,
        address: &DeviceAddress,
        plaintext: &[u8],
        bundle: Option<&SerializedPreKeyBundle>,
    ) -> Result<(CiphertextType, Vec<u8>), CryptoError> {
        let _guard = lock_key(&self.address_locks, *address).await;
        if let Some(bundle) = bundle {
            self.process_bundle_locked(address, bundle)?;
        }
        self.encrypt_locked(address, plaintext)
    }

    fn encrypt_locked(
        &self,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<(CiphertextType, Vec<u8>), CryptoError> {
        let remote = protocol_address(address)?;
        let mut sessions = self.signal();
        let mut identities = self.signal();
        let message = block_on(message_encrypt(
            &pad(plaintext),
            &remote,
            &mut sessions,
            &mut identities,
            SystemTime::now(),
            &mut rand::rng(),
        ))
        .map_err(|e| pairwise_error(e, address))?;

        let kind = match message.message_type() {
            CiphertextMessageType::PreKey => CiphertextType::PreKey,
            CiphertextMessageType::Whisper => CiphertextType::Signal,
            other => {
                return Err(CryptoError::InvalidMessage(format!(
                    "unexpected pairwise message type {other:?}"
                )))
            }
        };
        Ok((kind, message.serialize().to_vec()))
    }

    pub async fn decrypt_direct(
        &self,
        address: &DeviceAddress,
        ciphertext: &[u8],
        kind: CiphertextType,
    ) -> Result<Vec<u8>, CryptoError> {
        let _guard = lock_key(&self.address_locks, *address).await;
        let padded = match kind {
            CiphertextType::PreKey => {
                let message = PreKeySignalMessage::try_from(ciphertext)
                    .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;
                let result = match self.decrypt_pre_key(address, &message) {
                    Err(CryptoError::UntrustedIdentity { .. }) if self.auto_trust_identity => {
                        tracing::warn!(
                            address = %address,
                            "identity key changed, dropping old identity and session"
                        );
                        block_on(self.store.remove_identity(address))?;
                        block_on(self.store.delete_session(address))?;
                        self.decrypt_pre_key(address, &message)
                    }
                    other => other,
                };
                result?
            }
            CiphertextType::Signal => {
                let message = SignalMessage::try_from(ciphertext)
                    .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;
                let remote = protocol_address(address)?;
                let mut sessions = self.signal();
                let mut identities = self.signal();
                block_on(message_decrypt_signal(
                    &message,
                    &remote,
                    &mut sessions,
                    &mut identities,
                    &mut rand::rng(),
                ))
                .map_err(|e| pairwise_error(e, address))?
            }
            CiphertextType::SenderKey => {
                return Err(CryptoError::InvalidMessage(
                    "sender key message passed to pairwise decrypt".into(),
                ))
            }
        };
        Ok(unpad(&padded)?.to_vec())
    }

    /// One attempt at a first message. libsignal consumes the one-time
    /// pre-key only when the decrypt succeeds.
    fn decrypt_pre_key(
        &self,
        address: &DeviceAddress,
        message: &PreKeySignalMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let remote = protocol_address(address)?;
        let mut sessions = self.signal();
        let mut identities = self.signal();
        let mut pre_keys = self.signal();
        let signed_pre_keys = self.signal();
        let mut kyber_pre_keys = self.signal();
        block_on(message_decrypt_prekey(
            message,
            &remote,
            &mut sessions,
            &mut identities,
            &mut pre_keys,
            &signed_pre_keys,
            &mut kyber_pre_keys,
            &mut rand::rng(),
        ))
        .map_err(|e| pairwise_error(e, address))
    }

    /// Our distribution message for `group`, creating a sender key if needed.
    pub async fn create_distribution_message(
        &self,
        group: &GroupId,
        own_address: &DeviceAddress,
    ) -> Result<SenderKeyDistributionMessage, CryptoError> {
        let _guard = lock_key(&self.group_locks, (*group, *own_address)).await;
        self.distribution_locked(group, own_address)
    }

    fn distribution_locked(
        &self,
        group: &GroupId,
        own_address: &DeviceAddress,
    ) -> Result<SenderKeyDistributionMessage, CryptoError> {
        let own = protocol_address(own_address)?;
        let mut sender_keys = self.signal();
        block_on(create_sender_key_distribution_message(
            &own,
            group.0,
            &mut sender_keys,
            &mut rand::rng(),
        ))
        .map_err(|e| group_error(e, group, own_address))
    }

    /// Store the sender key `sender` distributed for `group`. A message
    /// minted for another group is rejected.
    pub async fn process_distribution_message(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
        message: &SenderKeyDistributionMessage,
    ) -> Result<(), CryptoError> {
        if message.distribution_id()? != group.0 {
            return Err(CryptoError::InvalidMessage(format!(
                "distribution message is not for group {group}"
            )));
        }
        let _guard = lock_key(&self.group_locks, (*group, *sender)).await;
        let remote = protocol_address(sender)?;
        let mut sender_keys = self.signal();
        block_on(process_sender_key_distribution_message(
            &remote,
            message,
            &mut sender_keys,
        ))
        .map_err(|e| group_error(e, group, sender))?;
        let chain_id = message.chain_id()?;
        tracing::debug!(group = %group, sender = %sender, chain_id, "stored sender key");
        Ok(())
    }

    /// Encrypt under our own sender key for `group`, creating the key on
    /// first use.
    pub async fn encrypt_for_group(
        &self,
        group: &GroupId,
        own_address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let _guard = lock_key(&self.group_locks, (*group, *own_address)).await;
        self.distribution_locked(group, own_address)?;

        let own = protocol_address(own_address)?;
        let mut sender_keys = self.signal();
        let message = block_on(group_encrypt(
            &mut sender_keys,
            &own,
            group.0,
            &pad(plaintext),
            &mut rand::rng(),
        ))
        .map_err(|e| group_error(e, group, own_address))?;
        Ok(message.serialized().to_vec())
    }

    /// Decrypt a group message from `sender`. A message whose distribution
    /// id names another group is rejected before any key is touched.
    pub async fn decrypt_group(
        &self,
        group: &GroupId,
        sender: &DeviceAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let message = SenderKeyMessage::try_from(ciphertext)
            .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;
        if message.distribution_id() != group.0 {
            return Err(CryptoError::InvalidMessage(format!(
                "sender key message is not for group {group}"
            )));
        }

        let _guard = lock_key(&self.group_locks, (*group, *sender)).await;
        let remote = protocol_address(sender)?;
        let mut sender_keys = self.signal();
        let padded = block_on(group_decrypt(ciphertext, &mut sender_keys, &remote))
            .map_err(|e| group_error(e, group, sender))?;
        Ok(unpad(&padded)?.to_vec())
    }
}
