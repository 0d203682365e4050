//! libsignal's store traits over any [`ProtocolStore`].
//!
//! libsignal drives its stores through `?Send` futures and `&mut` borrows,
//! one borrow per store role. `SignalStore` is a cheap view over a shared
//! store, so a caller builds one per role and runs the libsignal call with
//! `futures::executor::block_on`.

use async_trait::async_trait;
use courier_shared::ids::GroupId;
use libsignal_protocol::{
    self as signal, Direction, IdentityChange, IdentityKey, IdentityKeyPair, KyberPreKeyId,
    KyberPreKeyRecord, PreKeyId, PreKeyRecord, ProtocolAddress, PublicKey, SenderKeyRecord,
    SessionRecord, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord,
};
use uuid::Uuid;

use crate::error::CryptoError;
use crate::session::device_address;
use crate::storage::{
    IdentityKeyStore as _, KyberPreKeyStore as _, PreKeyStore as _, ProtocolStore,
    SenderKeyStore as _, SessionStore as _, SignedPreKeyStore as _,
};

#[derive(Clone, Copy)]
pub struct SignalStore<'a> {
    store: &'a dyn ProtocolStore,
}

impl<'a> SignalStore<'a> {
    pub fn new(store: &'a dyn ProtocolStore) -> Self {
        Self { store }
    }
}

fn state(op: &'static str) -> impl Fn(CryptoError) -> SignalProtocolError {
    move |e| SignalProtocolError::InvalidState(op, e.to_string())
}

#[async_trait(?Send)]
impl signal::IdentityKeyStore for SignalStore<'_> {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        self.store
            .get_identity_key_pair()
            .await
            .map_err(state("get_identity_key_pair"))?
            .ok_or_else(|| {
                SignalProtocolError::InvalidState(
                    "get_identity_key_pair",
                    "no identity key stored".into(),
                )
            })
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        self.store
            .get_local_registration_id()
            .await
            .map_err(state("get_local_registration_id"))?
            .ok_or_else(|| {
                SignalProtocolError::InvalidState(
                    "get_local_registration_id",
                    "no registration id stored".into(),
                )
            })
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, SignalProtocolError> {
        let address = device_address(address).map_err(state("save_identity"))?;
        self.store
            .save_identity(&address, identity)
            .await
            .map_err(state("save_identity"))
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        let address = device_address(address).map_err(state("is_trusted_identity"))?;
        self.store
            .is_trusted_identity(&address, identity)
            .await
            .map_err(state("is_trusted_identity"))
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        let address = device_address(address).map_err(state("get_identity"))?;
        self.store
            .get_identity(&address)
            .await
            .map_err(state("get_identity"))
    }
}

#[async_trait(?Send)]
impl signal::PreKeyStore for SignalStore<'_> {
    async fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        self.store
            .get_pre_key(prekey_id.into())
            .await
            .map_err(state("get_pre_key"))?
            .ok_or(SignalProtocolError::InvalidPreKeyId)
    }

    async fn save_pre_key(
        &mut self,
        _prekey_id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store
            .save_pre_keys(std::slice::from_ref(record))
            .await
            .map_err(state("save_pre_key"))
    }

    async fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<(), SignalProtocolError> {
        let id: u32 = prekey_id.into();
        self.store
            .remove_pre_key(id)
            .await
            .map_err(state("remove_pre_key"))?;
        tracing::debug!(pre_key_id = id, "consumed one-time pre-key");
        Ok(())
    }
}

#[async_trait(?Send)]
impl signal::SignedPreKeyStore for SignalStore<'_> {
    async fn get_signed_pre_key(
        &self,
        signed_prekey_id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        self.store
            .get_signed_pre_key(signed_prekey_id.into())
            .await
            .map_err(state("get_signed_pre_key"))?
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)
    }

    async fn save_signed_pre_key(
        &mut self,
        _signed_prekey_id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store
            .save_signed_pre_key(record)
            .await
            .map_err(state("save_signed_pre_key"))
    }
}

#[async_trait(?Send)]
impl signal::KyberPreKeyStore for SignalStore<'_> {
    async fn get_kyber_pre_key(
        &self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        self.store
            .get_kyber_pre_key(kyber_prekey_id.into())
            .await
            .map_err(state("get_kyber_pre_key"))?
            .ok_or_else(|| {
                SignalProtocolError::InvalidState("get_kyber_pre_key", "key not found".into())
            })
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store
            .save_kyber_pre_key(record)
            .await
            .map_err(state("save_kyber_pre_key"))
    }

    /// Every Kyber key is last-resort, so nothing is consumed.
    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _ec_prekey_id: SignedPreKeyId,
        _base_key: &PublicKey,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}

#[async_trait(?Send)]
impl signal::SessionStore for SignalStore<'_> {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        let address = device_address(address).map_err(state("load_session"))?;
        self.store
            .load_session(&address)
            .await
            .map_err(state("load_session"))
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        let address = device_address(address).map_err(state("store_session"))?;
        self.store
            .store_session(&address, record)
            .await
            .map_err(state("store_session"))
    }
}

/// The distribution id of a group's sender keys is the group id itself.
#[async_trait(?Send)]
impl signal::SenderKeyStore for SignalStore<'_> {
    async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let sender = device_address(sender).map_err(state("store_sender_key"))?;
        self.store
            .store_sender_key(&GroupId(distribution_id), &sender, record)
            .await
            .map_err(state("store_sender_key"))
    }

    async fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, SignalProtocolError> {
        let sender = device_address(sender).map_err(state("load_sender_key"))?;
        self.store
            .load_sender_key(&GroupId(distribution_id), &sender)
            .await
            .map_err(state("load_sender_key"))
    }
}
