//! Outbound fan-out: one logical message becomes one ciphertext per
//! recipient device (or one sender-key ciphertext plus pairwise key
//! distribution for groups).

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use courier_crypto::cipher::CiphertextType;
use courier_crypto::error::CryptoError;
use courier_crypto::identity::sign_device_identity;
use courier_crypto::kdf::sha256;
use courier_shared::constants::ENC_VERSION;
use courier_shared::ids::{DeviceAddress, GroupId, Jid, MessageId};
use courier_shared::node::Node;
use dashmap::DashMap;

use crate::client::ClientInner;
use crate::devices;
use crate::error::ClientError;
use crate::payload::{MessagePayload, SenderKeyDistribution};
use crate::prekeys;

/// What happened to each device of one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
    pub message_id: String,
    pub delivered_to: Vec<DeviceAddress>,
    /// Devices we could not encrypt for, with the reason.
    pub failed: Vec<(DeviceAddress, String)>,
}

/// Devices that already hold our current sender key, per group.
#[derive(Default)]
pub struct GroupDistribution {
    sent: DashMap<GroupId, (u32, HashSet<DeviceAddress>)>,
}

impl GroupDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which of `devices` still need sender key `key_id`. A new key id
    /// starts the set over.
    pub fn missing(
        &self,
        group: &GroupId,
        key_id: u32,
        devices: &[DeviceAddress],
    ) -> Vec<DeviceAddress> {
        match self.sent.get(group) {
            Some(entry) if entry.0 == key_id => devices
                .iter()
                .copied()
                .filter(|d| !entry.1.contains(d))
                .collect(),
            _ => devices.to_vec(),
        }
    }

    pub fn mark(&self, group: GroupId, key_id: u32, devices: impl IntoIterator<Item = DeviceAddress>) {
        let mut entry = self.sent.entry(group).or_insert_with(|| (key_id, HashSet::new()));
        if entry.0 != key_id {
            *entry = (key_id, HashSet::new());
        }
        entry.1.extend(devices);
    }

    pub fn forget(&self, group: &GroupId) {
        self.sent.remove(group);
    }
}

/// Hash over the sorted device set of a group send, so the relay can tell
/// us when our view of the membership is stale.
pub fn participant_hash(devices: &[DeviceAddress]) -> String {
    let mut names: Vec<String> = devices.iter().map(ToString::to_string).collect();
    names.sort();
    let parts: Vec<&[u8]> = names.iter().map(|n| n.as_bytes()).collect();
    let digest = sha256(&parts);
    format!("2:{}", STANDARD.encode(&digest[..6]))
}

pub(crate) fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

pub(crate) fn enc_node(kind: CiphertextType, ciphertext: Vec<u8>) -> Node {
    Node::new("enc")
        .attr("v", ENC_VERSION)
        .attr("type", kind.as_str())
        .with_bytes(ciphertext)
}

/// Signed proof that our identity key belongs to this device. Sent beside
/// every first-session message.
pub(crate) async fn device_identity_node(inner: &ClientInner) -> Result<Node, ClientError> {
    let proof = sign_device_identity(&**inner.store(), inner.own).await?;
    Ok(Node::new("device-identity").with_bytes(proof.encode()?))
}

pub(crate) fn message_type(payload: &MessagePayload) -> &'static str {
    if payload.is_protocol_only() {
        "protocol"
    } else {
        "text"
    }
}

struct Encrypted {
    device: DeviceAddress,
    kind: CiphertextType,
    ciphertext: Vec<u8>,
}

#[derive(Default)]
struct FanOut {
    encrypted: Vec<Encrypted>,
    failed: Vec<(DeviceAddress, String)>,
}

impl FanOut {
    fn has_pre_key_message(&self) -> bool {
        self.encrypted.iter().any(|e| e.kind == CiphertextType::PreKey)
    }

    fn participants_node(&mut self) -> Node {
        Node::new("participants").with_children(
            self.encrypted
                .drain(..)
                .map(|e| {
                    Node::new("to")
                        .attr("jid", e.device)
                        .with_children(vec![enc_node(e.kind, e.ciphertext)])
                })
                .collect(),
        )
    }
}

/// Encrypt each target's plaintext. Devices without a session are collected
/// and served from one batched bundle fetch.
async fn encrypt_fanout(
    inner: &ClientInner,
    targets: Vec<(DeviceAddress, Vec<u8>)>,
) -> FanOut {
    let mut out = FanOut::default();
    let mut missing = Vec::new();

    for (device, plaintext) in targets {
        match inner.cipher.encrypt_for_device(&device, &plaintext, None).await {
            Ok((kind, ciphertext)) => out.encrypted.push(Encrypted {
                device,
                kind,
                ciphertext,
            }),
            Err(CryptoError::SessionNotFound { .. }) => missing.push((device, plaintext)),
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "encrypt failed");
                out.failed.push((device, e.to_string()));
            }
        }
    }
    if missing.is_empty() {
        return out;
    }

    let addresses: Vec<DeviceAddress> = missing.iter().map(|(d, _)| *d).collect();
    let mut bundles = match prekeys::fetch_bundles(inner, &addresses).await {
        Ok(bundles) => bundles,
        Err(e) => {
            tracing::warn!(devices = addresses.len(), error = %e, "pre-key fetch failed");
            out.failed
                .extend(addresses.into_iter().map(|d| (d, e.to_string())));
            return out;
        }
    };

    for (device, plaintext) in missing {
        let bundle = match bundles.remove(&device) {
            Some(Ok(bundle)) => bundle,
            Some(Err(reason)) => {
                out.failed.push((device, reason));
                continue;
            }
            None => {
                out.failed.push((device, "relay returned no bundle".to_string()));
                continue;
            }
        };
        match inner
            .cipher
            .encrypt_for_device(&device, &plaintext, Some(&bundle))
            .await
        {
            Ok((kind, ciphertext)) => out.encrypted.push(Encrypted {
                device,
                kind,
                ciphertext,
            }),
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "encrypt with fetched bundle failed");
                out.failed.push((device, e.to_string()));
            }
        }
    }
    out
}

/// Send `payload` to `chat`. Holds the global send lock for the whole
/// fan-out.
pub(crate) async fn send_message(
    inner: &ClientInner,
    chat: Jid,
    payload: MessagePayload,
) -> Result<SendResult, ClientError> {
    let _guard = inner.send_lock.lock().await;
    let id = MessageId::new().to_string();
    let chat = match chat {
        Jid::Group(_) => chat,
        other => other.to_non_device(),
    };
    inner.recent.insert(chat, id.clone(), payload.clone()).await;

    match chat {
        Jid::Group(group) => send_group(inner, id, group, &payload).await,
        _ => send_direct(inner, id, chat, &payload).await,
    }
}

async fn send_direct(
    inner: &ClientInner,
    id: String,
    chat: Jid,
    payload: &MessagePayload,
) -> Result<SendResult, ClientError> {
    let recipient = chat
        .user()
        .ok_or_else(|| ClientError::UnexpectedResponse(format!("cannot send to {chat}")))?;
    let own_user = inner.own.user;
    let to_self = recipient == own_user;

    let plain = payload.encode()?;
    let wrapped = payload.clone().into_device_sent(chat).encode()?;
    let targets: Vec<(DeviceAddress, Vec<u8>)> =
        devices::resolve_devices(inner, &[recipient, own_user])
            .await?
            .into_iter()
            .filter(|d| *d != inner.own)
            .map(|d| {
                let plaintext = if d.user == own_user && !to_self {
                    wrapped.clone()
                } else {
                    plain.clone()
                };
                (d, plaintext)
            })
            .collect();

    let fanout = encrypt_fanout(inner, targets).await;
    deliver(inner, id, chat, message_type(payload), fanout, None, None).await
}

async fn send_group(
    inner: &ClientInner,
    id: String,
    group: GroupId,
    payload: &MessagePayload,
) -> Result<SendResult, ClientError> {
    let mut users = devices::group_participants(inner, &group).await?;
    users.push(inner.own.user);
    let all = devices::resolve_devices(inner, &users).await?;
    let phash = participant_hash(&all);
    let recipients: Vec<DeviceAddress> = all.into_iter().filter(|d| *d != inner.own).collect();

    // The distribution message must be taken before the sender key
    // advances for this message.
    let distribution = inner
        .cipher
        .create_distribution_message(&group, &inner.own)
        .await?;
    let key_id = distribution.chain_id()?;
    let group_ciphertext = inner
        .cipher
        .encrypt_for_group(&group, &inner.own, &payload.encode()?)
        .await?;

    let needs_key = inner
        .distribution
        .missing(&group, key_id, &recipients);
    let fanout = if needs_key.is_empty() {
        FanOut::default()
    } else {
        let plaintext = MessagePayload {
            sender_key_distribution: Some(SenderKeyDistribution {
                group,
                message: distribution.serialized().to_vec(),
            }),
            ..MessagePayload::default()
        }
        .encode()?;
        encrypt_fanout(
            inner,
            needs_key.into_iter().map(|d| (d, plaintext.clone())).collect(),
        )
        .await
    };
    let distributed: Vec<DeviceAddress> = fanout.encrypted.iter().map(|e| e.device).collect();

    let failed: HashSet<DeviceAddress> = fanout.failed.iter().map(|(d, _)| *d).collect();
    let mut result = deliver(
        inner,
        id,
        Jid::Group(group),
        message_type(payload),
        fanout,
        Some(enc_node(CiphertextType::SenderKey, group_ciphertext)),
        Some(phash),
    )
    .await?;
    inner
        .distribution
        .mark(group, key_id, distributed);
    // Everyone who already had the key reads the sender-key ciphertext.
    result.delivered_to = recipients
        .into_iter()
        .filter(|d| !failed.contains(d))
        .collect();
    Ok(result)
}

/// Assemble the message node and hand it to the writer.
async fn deliver(
    inner: &ClientInner,
    id: String,
    chat: Jid,
    kind: &str,
    mut fanout: FanOut,
    group_enc: Option<Node>,
    phash: Option<String>,
) -> Result<SendResult, ClientError> {
    let delivered_to: Vec<DeviceAddress> = fanout.encrypted.iter().map(|e| e.device).collect();
    if delivered_to.is_empty() && group_enc.is_none() {
        tracing::debug!(id = %id, chat = %chat, "no device to send to");
        return Ok(SendResult {
            message_id: id,
            delivered_to,
            failed: fanout.failed,
        });
    }

    let needs_identity = fanout.has_pre_key_message();
    let mut children = vec![fanout.participants_node()];
    children.extend(group_enc);
    if needs_identity {
        children.push(device_identity_node(inner).await?);
    }

    let node = Node::new("message")
        .attr("id", id.as_str())
        .attr("to", chat)
        .attr("type", kind)
        .attr("t", now_secs())
        .opt_attr("phash", phash.clone())
        .with_children(children);
    inner.send_node(node).await?;

    if let Some(phash) = phash {
        inner.sent_phash.insert(id.clone(), (chat, phash));
    }
    tracing::debug!(
        id = %id,
        chat = %chat,
        devices = delivered_to.len(),
        failed = fanout.failed.len(),
        "message sent"
    );
    Ok(SendResult {
        message_id: id,
        delivered_to,
        failed: fanout.failed,
    })
}

/// Send protocol-only plumbing (key shares, key requests) to specific
/// devices.
pub(crate) async fn send_protocol_message(
    inner: &ClientInner,
    devices: &[DeviceAddress],
    payload: &MessagePayload,
) -> Result<SendResult, ClientError> {
    let _guard = inner.send_lock.lock().await;
    let plaintext = payload.encode()?;
    let targets = devices
        .iter()
        .filter(|d| **d != inner.own)
        .map(|d| (*d, plaintext.clone()))
        .collect();
    let fanout = encrypt_fanout(inner, targets).await;
    let chat = Jid::User(inner.own.user);
    deliver(
        inner,
        MessageId::new().to_string(),
        chat,
        "protocol",
        fanout,
        None,
        None,
    )
    .await
}

/// The relay acks each group message with the participant hash it saw. A
/// different hash means our device view of the group is stale.
pub(crate) fn handle_ack(inner: &ClientInner, node: &Node) -> Result<(), ClientError> {
    if node.get_str("class") != Some("message") {
        return Ok(());
    }
    let id = node.str_attr("id")?;
    let Some((chat, sent)) = inner.sent_phash.remove(id) else {
        return Ok(());
    };
    if let (Jid::Group(group), Some(seen)) = (chat, node.get_str("phash")) {
        if seen != sent {
            tracing::info!(group = %group, "participant hash changed, refreshing devices");
            inner.devices.invalidate_group(&group);
            inner.distribution.forget(&group);
        }
    }
    Ok(())
}
