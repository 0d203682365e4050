//! Courier device addresses as libsignal protocol addresses, and remote
//! bundles as libsignal pre-key bundles.
//!
//! libsignal device ids start at 1 while Courier numbers devices from 0
//! (the primary), so the protocol device id is always the Courier index
//! plus one.

use courier_shared::ids::{DeviceAddress, UserId};
use libsignal_protocol::{
    kem, DeviceId, IdentityKey, KyberPreKeyId, PreKeyBundle, PreKeyId, ProtocolAddress,
    PublicKey, SignedPreKeyId,
};

use crate::error::CryptoError;
use crate::prekeys::SerializedPreKeyBundle;

fn protocol_device_id(device: u32) -> Result<DeviceId, CryptoError> {
    device
        .checked_add(1)
        .and_then(|id| u8::try_from(id).ok())
        .and_then(|id| DeviceId::new(id).ok())
        .ok_or_else(|| CryptoError::InvalidMessage(format!("device index {device} out of range")))
}

pub fn protocol_address(address: &DeviceAddress) -> Result<ProtocolAddress, CryptoError> {
    Ok(ProtocolAddress::new(
        address.user.to_string(),
        protocol_device_id(address.device)?,
    ))
}

pub fn device_address(address: &ProtocolAddress) -> Result<DeviceAddress, CryptoError> {
    let user: UserId = address
        .name()
        .parse()
        .map_err(|_| CryptoError::InvalidMessage(format!("bad address name {}", address.name())))?;
    let device: u32 = address.device_id().into();
    let device = device
        .checked_sub(1)
        .ok_or_else(|| CryptoError::InvalidMessage("device id 0".into()))?;
    Ok(DeviceAddress::new(user, device))
}

/// Rebuild the libsignal bundle for `address` from its wire form.
pub(crate) fn pre_key_bundle(
    address: &DeviceAddress,
    bundle: &SerializedPreKeyBundle,
) -> Result<PreKeyBundle, CryptoError> {
    let invalid = |e: libsignal_protocol::SignalProtocolError| CryptoError::InvalidKey(e.to_string());

    let identity_key = IdentityKey::decode(&bundle.identity_key).map_err(invalid)?;
    let signed_pre_key = PublicKey::deserialize(&bundle.signed_pre_key).map_err(invalid)?;
    let kyber_pre_key = kem::PublicKey::deserialize(&bundle.kyber_pre_key)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid kyber key: {e}")))?;
    let pre_key = bundle
        .pre_key
        .as_ref()
        .map(|key| {
            PublicKey::deserialize(&key.public_key)
                .map(|public| (PreKeyId::from(key.key_id), public))
                .map_err(invalid)
        })
        .transpose()?;

    Ok(PreKeyBundle::new(
        bundle.registration_id,
        protocol_device_id(address.device)?,
        pre_key,
        SignedPreKeyId::from(bundle.signed_pre_key_id),
        signed_pre_key,
        bundle.signed_pre_key_signature.clone(),
        KyberPreKeyId::from(bundle.kyber_pre_key_id),
        kyber_pre_key,
        bundle.kyber_pre_key_signature.clone(),
        identity_key,
    )?)
}
