//! Inbound messages: decrypt every payload a message carries, deliver what
//! decrypts, ask for the rest again.

use courier_crypto::cipher::CiphertextType;
use courier_crypto::error::CryptoError;
use courier_crypto::identity::DeviceIdentity;
use courier_shared::constants::{ENC_VERSION, LEGACY_ENC_VERSION};
use courier_shared::ids::{DeviceAddress, Jid};
use courier_shared::node::Node;
use libsignal_protocol::{PreKeySignalMessage, SenderKeyDistributionMessage};

use crate::appstate;
use crate::client::ClientInner;
use crate::dispatch::send_ack;
use crate::error::ClientError;
use crate::events::{Event, MessageEvent, UndecryptableKind};
use crate::payload::MessagePayload;
use crate::retry::{self, RetryOutcome};

/// Where a message came from, shared by all of its payloads.
struct Envelope {
    id: String,
    chat: Jid,
    sender: DeviceAddress,
    timestamp: u64,
}

enum Failure {
    Decrypt(CryptoError),
    Verify(String),
    /// Decrypted, but the plaintext is not a payload we can read.
    Decode(String),
}

pub(crate) async fn handle_message(inner: &ClientInner, node: Node) -> Result<(), ClientError> {
    let result = process_message(inner, &node).await;
    send_ack(inner, &node, "message").await;
    result
}

/// Every ciphertext on the node, pairwise ones first so a distribution
/// message they carry is in place before the sender-key payload.
fn collect_payloads(node: &Node) -> Result<Vec<(CiphertextType, &[u8])>, ClientError> {
    let mut payloads = Vec::new();
    if let Some(bytes) = node.bytes() {
        if node.get_str("v") == Some(LEGACY_ENC_VERSION) {
            payloads.push((parse_kind(node.str_attr("enc")?)?, bytes));
        }
    }
    for enc in node.children_by_tag("enc") {
        match enc.get_str("v") {
            Some(ENC_VERSION) | Some(LEGACY_ENC_VERSION) => {
                payloads.push((parse_kind(enc.str_attr("type")?)?, enc.require_bytes()?));
            }
            other => tracing::warn!(version = ?other, "skipping unsupported enc version"),
        }
    }
    payloads.sort_by_key(|(kind, _)| *kind == CiphertextType::SenderKey);
    Ok(payloads)
}

fn parse_kind(value: &str) -> Result<CiphertextType, ClientError> {
    CiphertextType::parse(value)
        .ok_or_else(|| ClientError::UnexpectedResponse(format!("unknown ciphertext type {value}")))
}

/// A first-session message must come with a proof that the identity key it
/// carries belongs to the sending device.
fn verify_device_identity(
    node: &Node,
    sender: &DeviceAddress,
    ciphertext: &[u8],
) -> Result<(), String> {
    let message = PreKeySignalMessage::try_from(ciphertext).map_err(|e| e.to_string())?;
    let proof = node
        .child("device-identity")
        .and_then(Node::bytes)
        .ok_or_else(|| "first message without device identity".to_string())?;
    DeviceIdentity::decode(proof)
        .and_then(|identity| identity.verify_for(sender, message.identity_key()))
        .map_err(|e| e.to_string())
}

async fn decrypt_one(
    inner: &ClientInner,
    node: &Node,
    envelope: &Envelope,
    kind: CiphertextType,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Failure> {
    match kind {
        CiphertextType::SenderKey => {
            let Jid::Group(group) = envelope.chat else {
                return Err(Failure::Decrypt(CryptoError::InvalidMessage(
                    "sender-key message outside a group".into(),
                )));
            };
            inner
                .cipher
                .decrypt_group(&group, &envelope.sender, ciphertext)
                .await
                .map_err(Failure::Decrypt)
        }
        CiphertextType::PreKey | CiphertextType::Signal => {
            if kind == CiphertextType::PreKey {
                verify_device_identity(node, &envelope.sender, ciphertext).map_err(Failure::Verify)?;
            }
            inner
                .cipher
                .decrypt_direct(&envelope.sender, ciphertext, kind)
                .await
                .map_err(Failure::Decrypt)
        }
    }
}

async fn process_message(inner: &ClientInner, node: &Node) -> Result<(), ClientError> {
    let Jid::Device(sender) = node.jid_attr("from")? else {
        return Err(ClientError::UnexpectedResponse(
            "message from a non-device jid".into(),
        ));
    };
    let envelope = Envelope {
        id: node.str_attr("id")?.to_string(),
        chat: node.opt_jid_attr("chat")?.unwrap_or(Jid::User(sender.user)),
        sender,
        timestamp: node.opt_u64_attr("t")?.unwrap_or_default(),
    };

    let payloads = collect_payloads(node)?;
    if payloads.is_empty() {
        if node.child("unavailable").is_some() {
            tracing::info!(id = %envelope.id, sender = %sender, "message unavailable for this device");
            inner.emit(undecryptable(&envelope, true, UndecryptableKind::Unavailable));
        } else {
            tracing::debug!(id = %envelope.id, "message without payload");
        }
        return Ok(());
    }

    let mut failure = None;
    for (kind, ciphertext) in payloads {
        match decrypt_one(inner, node, &envelope, kind, ciphertext).await {
            Ok(plaintext) => match MessagePayload::decode(&plaintext) {
                Ok(payload) => {
                    if let Err(e) = deliver(inner, &envelope, payload).await {
                        tracing::warn!(id = %envelope.id, error = %e, "failed to deliver payload");
                    }
                }
                Err(e) => {
                    failure.get_or_insert(Failure::Decode(e.to_string()));
                }
            },
            Err(Failure::Decrypt(CryptoError::DuplicatedMessage { .. })) => {
                tracing::debug!(id = %envelope.id, sender = %sender, kind = %kind, "ignoring duplicate");
            }
            Err(e) => failure = Some(e),
        }
    }

    match failure {
        None => {
            inner.retries.clear(&envelope.id);
            Ok(())
        }
        Some(Failure::Verify(reason)) => {
            tracing::warn!(id = %envelope.id, sender = %sender, reason = %reason, "device identity rejected");
            inner.emit(undecryptable(&envelope, false, UndecryptableKind::VerifyFailed(reason)));
            Ok(())
        }
        Some(Failure::Decode(reason)) => {
            tracing::warn!(id = %envelope.id, sender = %sender, reason = %reason, "undecodable plaintext");
            inner.retries.clear(&envelope.id);
            inner.emit(undecryptable(&envelope, false, UndecryptableKind::DecodeFailed(reason)));
            Ok(())
        }
        Some(Failure::Decrypt(e)) => {
            tracing::warn!(id = %envelope.id, sender = %sender, error = %e, "decrypt failed");
            inner.emit(undecryptable(
                &envelope,
                false,
                UndecryptableKind::DecryptFailed(e.to_string()),
            ));
            if !e.is_recoverable_by_retry() {
                return Ok(());
            }
            let force_keys = matches!(e, CryptoError::SessionNotFound { .. });
            match retry::send_retry_receipt(inner, &envelope.id, envelope.chat, sender, force_keys)
                .await?
            {
                RetryOutcome::Sent { count } => {
                    tracing::debug!(id = %envelope.id, count, "asked sender to retry");
                }
                RetryOutcome::Exhausted => {}
            }
            Ok(())
        }
    }
}

fn undecryptable(envelope: &Envelope, unavailable: bool, kind: UndecryptableKind) -> Event {
    Event::Undecryptable {
        id: envelope.id.clone(),
        chat: envelope.chat,
        sender: envelope.sender,
        unavailable,
        kind,
    }
}

/// Apply the protocol parts of a decrypted payload and hand the visible
/// part to the application.
async fn deliver(
    inner: &ClientInner,
    envelope: &Envelope,
    payload: MessagePayload,
) -> Result<(), ClientError> {
    let from_own_user = envelope.sender.user == inner.own.user;

    if let Some(distribution) = &payload.sender_key_distribution {
        let message = SenderKeyDistributionMessage::try_from(distribution.message.as_slice())?;
        inner
            .cipher
            .process_distribution_message(&distribution.group, &envelope.sender, &message)
            .await?;
    }

    if let Some(share) = &payload.app_state_key_share {
        if from_own_user {
            appstate::store_key_share(inner, &share.keys).await?;
        } else {
            tracing::warn!(sender = %envelope.sender, "ignoring app-state keys from another user");
        }
    }

    if let Some(request) = &payload.app_state_key_request {
        if from_own_user && envelope.sender != inner.own {
            appstate::answer_key_request(inner, envelope.sender, request).await?;
        }
    }

    let (chat, payload, from_own_device) = match payload.device_sent {
        Some(sent) if from_own_user => (sent.destination, *sent.message, true),
        Some(_) => {
            tracing::warn!(sender = %envelope.sender, "device_sent payload from another user");
            return Ok(());
        }
        None => (envelope.chat, payload, from_own_user),
    };
    if payload.body.is_none() {
        return Ok(());
    }
    inner.emit(Event::Message(MessageEvent {
        id: envelope.id.clone(),
        chat,
        sender: envelope.sender,
        timestamp: envelope.timestamp,
        payload,
        from_own_device,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairwise_payloads_come_before_sender_key() {
        let node = Node::new("message").with_children(vec![
            Node::new("enc")
                .attr("v", ENC_VERSION)
                .attr("type", "skmsg")
                .with_bytes(vec![1]),
            Node::new("enc")
                .attr("v", ENC_VERSION)
                .attr("type", "pkmsg")
                .with_bytes(vec![2]),
        ]);
        let payloads = collect_payloads(&node).unwrap();
        let kinds: Vec<CiphertextType> = payloads.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![CiphertextType::PreKey, CiphertextType::SenderKey]);
    }

    #[test]
    fn legacy_single_payload_is_read() {
        let node = Node::new("message")
            .attr("v", LEGACY_ENC_VERSION)
            .attr("enc", "msg")
            .with_bytes(vec![9, 9]);
        let payloads = collect_payloads(&node).unwrap();
        assert_eq!(payloads, vec![(CiphertextType::Signal, &[9u8, 9][..])]);
    }

    #[test]
    fn unknown_versions_are_skipped() {
        let node = Node::new("message").with_children(vec![Node::new("enc")
            .attr("v", "9")
            .attr("type", "msg")
            .with_bytes(vec![1])]);
        assert!(collect_payloads(&node).unwrap().is_empty());
    }

    #[test]
    fn first_message_without_proof_is_rejected() {
        let sender = DeviceAddress::new(courier_shared::ids::UserId::new(), 1);
        let node = Node::new("message");
        assert!(verify_device_identity(&node, &sender, b"not a message").is_err());
    }
}
