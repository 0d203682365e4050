//! Wire form of app-state snapshots and patches, and the MACs that bind
//! them.
//!
//! A record's `value_blob` is `nonce || AES-256-GCM(action) || value_mac`.

use std::collections::HashMap;

use courier_crypto::aead::{self, NONCE_LEN};
use courier_crypto::kdf::{hmac_sha256, verify_hmac_sha256};
use courier_crypto::storage::SyncKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::ExpandedKeys;
use super::lthash::LtHash;
use crate::error::ClientError;
use crate::events::MutationOperation;

const MAC_LEN: usize = 32;

/// The decrypted content of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAction {
    pub index: Vec<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub index_mac: Vec<u8>,
    pub value_blob: Vec<u8>,
    pub key_id: Vec<u8>,
}

impl SyncRecord {
    pub fn value_mac(&self) -> Option<&[u8]> {
        let at = self.value_blob.len().checked_sub(MAC_LEN)?;
        Some(&self.value_blob[at..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMutation {
    pub operation: MutationOperation,
    pub record: SyncRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchWire {
    pub version: u64,
    pub mutations: Vec<SyncMutation>,
    pub snapshot_mac: Vec<u8>,
    pub patch_mac: Vec<u8>,
    pub key_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWire {
    pub version: u64,
    pub records: Vec<SyncRecord>,
    pub mac: Vec<u8>,
    pub key_id: Vec<u8>,
}

fn op_byte(operation: MutationOperation) -> u8 {
    match operation {
        MutationOperation::Set => 0x01,
        MutationOperation::Remove => 0x02,
    }
}

fn value_mac_parts<'a>(
    operation: &'a [u8; 1],
    key_id: &'a [u8],
    content: &'a [u8],
    trailer: &'a [u8; 8],
) -> [&'a [u8]; 4] {
    [operation, key_id, content, trailer]
}

fn key_id_trailer(key_id: &[u8]) -> [u8; 8] {
    (key_id.len() as u64 + 1).to_be_bytes()
}

pub fn index_mac(keys: &ExpandedKeys, index: &[String]) -> Result<[u8; 32], ClientError> {
    let encoded = serde_json::to_vec(index)?;
    Ok(hmac_sha256(&keys.index, &[encoded.as_slice()])?)
}

pub fn snapshot_mac(
    keys: &ExpandedKeys,
    hash: &LtHash,
    version: u64,
    name: &str,
) -> Result<[u8; 32], ClientError> {
    Ok(hmac_sha256(
        &keys.snapshot_mac,
        &[hash.as_bytes(), &version.to_be_bytes(), name.as_bytes()],
    )?)
}

fn patch_mac_parts<'a>(
    snapshot_mac: &'a [u8],
    value_macs: &'a [Vec<u8>],
    version: &'a [u8; 8],
    name: &'a str,
) -> Vec<&'a [u8]> {
    let mut parts = Vec::with_capacity(value_macs.len() + 3);
    parts.push(snapshot_mac);
    parts.extend(value_macs.iter().map(Vec::as_slice));
    parts.push(version);
    parts.push(name.as_bytes());
    parts
}

pub fn patch_mac(
    keys: &ExpandedKeys,
    snapshot_mac: &[u8],
    value_macs: &[Vec<u8>],
    version: u64,
    name: &str,
) -> Result<[u8; 32], ClientError> {
    let version = version.to_be_bytes();
    Ok(hmac_sha256(
        &keys.patch_mac,
        &patch_mac_parts(snapshot_mac, value_macs, &version, name),
    )?)
}

pub fn verify_snapshot_mac(
    keys: &ExpandedKeys,
    hash: &LtHash,
    version: u64,
    name: &str,
    expected: &[u8],
) -> bool {
    verify_hmac_sha256(
        &keys.snapshot_mac,
        &[hash.as_bytes(), &version.to_be_bytes(), name.as_bytes()],
        expected,
    )
    .is_ok()
}

pub fn verify_patch_mac(
    keys: &ExpandedKeys,
    patch: &PatchWire,
    value_macs: &[Vec<u8>],
    name: &str,
) -> bool {
    let version = patch.version.to_be_bytes();
    verify_hmac_sha256(
        &keys.patch_mac,
        &patch_mac_parts(&patch.snapshot_mac, value_macs, &version, name),
        &patch.patch_mac,
    )
    .is_ok()
}

pub fn encrypt_mutation(
    keys: &ExpandedKeys,
    key_id: &[u8],
    operation: MutationOperation,
    action: &SyncAction,
) -> Result<SyncMutation, ClientError> {
    let index_mac = index_mac(keys, &action.index)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext = aead::seal(
        &keys.value_encryption,
        &nonce,
        &serde_json::to_vec(action)?,
        &index_mac,
    )?;

    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    let op = [op_byte(operation)];
    let trailer = key_id_trailer(key_id);
    let mac = hmac_sha256(&keys.value_mac, &value_mac_parts(&op, key_id, &blob, &trailer))?;
    blob.extend_from_slice(&mac);

    Ok(SyncMutation {
        operation,
        record: SyncRecord {
            index_mac: index_mac.to_vec(),
            value_blob: blob,
            key_id: key_id.to_vec(),
        },
    })
}

pub struct Decrypted {
    pub index_mac: Vec<u8>,
    pub value_mac: Vec<u8>,
    pub action: SyncAction,
}

/// Check the value MAC, decrypt, then check the index MAC against the
/// decrypted index. The error names the check that failed.
pub fn decrypt_mutation(
    keys: &ExpandedKeys,
    operation: MutationOperation,
    record: &SyncRecord,
) -> Result<Decrypted, &'static str> {
    let blob = &record.value_blob;
    if blob.len() < NONCE_LEN + MAC_LEN {
        return Err("value blob too short");
    }
    let (content, mac) = blob.split_at(blob.len() - MAC_LEN);
    let op = [op_byte(operation)];
    let trailer = key_id_trailer(&record.key_id);
    verify_hmac_sha256(
        &keys.value_mac,
        &value_mac_parts(&op, &record.key_id, content, &trailer),
        mac,
    )
    .map_err(|_| "value mac")?;

    let (nonce, ciphertext) = content.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| "nonce")?;
    let plaintext = aead::open(&keys.value_encryption, &nonce, ciphertext, &record.index_mac)
        .map_err(|_| "value decryption")?;
    let action: SyncAction = serde_json::from_slice(&plaintext).map_err(|_| "value encoding")?;

    let expected = index_mac(keys, &action.index).map_err(|_| "index encoding")?;
    if expected[..] != record.index_mac[..] {
        return Err("index mac");
    }
    Ok(Decrypted {
        index_mac: record.index_mac.clone(),
        value_mac: mac.to_vec(),
        action,
    })
}

/// A patch moving a category from `base` to `version`. `previous` maps
/// index MACs to the value MAC currently stored for them.
pub fn build_patch(
    key: &SyncKey,
    name: &str,
    base: &LtHash,
    version: u64,
    actions: &[(MutationOperation, SyncAction)],
    previous: &HashMap<Vec<u8>, Vec<u8>>,
) -> Result<(PatchWire, LtHash), ClientError> {
    let keys = ExpandedKeys::derive(&key.key_data)?;
    let mut hash = base.clone();
    let mut current: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
    let mut mutations = Vec::with_capacity(actions.len());
    let mut value_macs = Vec::with_capacity(actions.len());

    for (operation, action) in actions {
        let mutation = encrypt_mutation(&keys, &key.key_id, *operation, action)?;
        let index = mutation.record.index_mac.clone();
        let value_mac = mutation
            .record
            .value_mac()
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        let prior = match current.get(&index) {
            Some(entry) => entry.clone(),
            None => previous.get(&index).cloned(),
        };
        if let Some(prior) = prior {
            hash.subtract(&prior)?;
        }
        match operation {
            MutationOperation::Set => {
                hash.add(&value_mac)?;
                current.insert(index, Some(value_mac.clone()));
            }
            MutationOperation::Remove => {
                current.insert(index, None);
            }
        }
        value_macs.push(value_mac);
        mutations.push(mutation);
    }

    let snapshot_mac = snapshot_mac(&keys, &hash, version, name)?;
    let patch_mac = patch_mac(&keys, &snapshot_mac, &value_macs, version, name)?;
    Ok((
        PatchWire {
            version,
            mutations,
            snapshot_mac: snapshot_mac.to_vec(),
            patch_mac: patch_mac.to_vec(),
            key_id: key.key_id.clone(),
        },
        hash,
    ))
}

/// A full snapshot holding exactly `actions`.
pub fn build_snapshot(
    key: &SyncKey,
    name: &str,
    version: u64,
    actions: &[SyncAction],
) -> Result<SnapshotWire, ClientError> {
    let keys = ExpandedKeys::derive(&key.key_data)?;
    let mut hash = LtHash::default();
    let mut records = Vec::with_capacity(actions.len());
    for action in actions {
        let mutation = encrypt_mutation(&keys, &key.key_id, MutationOperation::Set, action)?;
        if let Some(value_mac) = mutation.record.value_mac() {
            hash.add(value_mac)?;
        }
        records.push(mutation.record);
    }
    Ok(SnapshotWire {
        version,
        records,
        mac: snapshot_mac(&keys, &hash, version, name)?.to_vec(),
        key_id: key.key_id.clone(),
    })
}
