//! Retry receipts in both directions: asking a sender to re-encrypt what we
//! could not read, and answering such requests for messages we sent.

use std::time::{Duration, Instant};

use courier_crypto::cipher::CiphertextType;
use courier_crypto::identity::get_registration_id;
use courier_crypto::prekeys::generate_pre_key_bundle;
use courier_shared::ids::{DeviceAddress, Jid};
use courier_shared::node::Node;
use dashmap::DashMap;

use crate::client::ClientInner;
use crate::error::ClientError;
use crate::events::Event;
use crate::msgcache::BoundedMap;
use crate::payload::SenderKeyDistribution;
use crate::prekeys;
use crate::send::{device_identity_node, enc_node, message_type, now_secs};

/// Result of asking for a message again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Sent { count: u32 },
    /// The ceiling was reached; no receipt went out.
    Exhausted,
}

/// Per-message retry counts for messages we failed to decrypt. Only the
/// most recent `capacity` message ids are remembered.
pub struct RetryCounters {
    counts: BoundedMap<String, u32>,
    ceiling: u32,
}

impl RetryCounters {
    /// Counters that stop at `ceiling` retries per message.
    pub fn new(ceiling: u32, capacity: usize) -> Self {
        Self {
            counts: BoundedMap::new(capacity),
            ceiling,
        }
    }

    /// The next count for `message_id`, or `None` once the ceiling is hit.
    pub fn bump(&self, message_id: &str) -> Option<u32> {
        let ceiling = self.ceiling;
        self.counts.with_entry(message_id.to_string(), |count| {
            if *count >= ceiling {
                return None;
            }
            *count += 1;
            Some(*count)
        })
    }

    /// Retries asked for so far; zero for ids never seen or already evicted.
    pub fn get(&self, message_id: &str) -> u32 {
        self.counts.get(message_id).unwrap_or(0)
    }

    /// Forget `message_id`, once it decrypted or will never be retried.
    pub fn clear(&self, message_id: &str) {
        self.counts.remove(message_id);
    }
}

/// When we last rebuilt a session for each device, so repeated retries do
/// not throw away sessions in a loop.
pub struct RecreateTracker {
    last: DashMap<DeviceAddress, Instant>,
    min_retry: u32,
    cooldown: Duration,
}

impl RecreateTracker {
    pub fn new(min_retry: u32, cooldown: Duration) -> Self {
        Self {
            last: DashMap::new(),
            min_retry,
            cooldown,
        }
    }

    /// Rebuild when there is no session at all, or when the peer has asked
    /// more than `min_retry` times and the cooldown since the last rebuild
    /// for that device has passed.
    pub fn should_recreate(
        &self,
        device: &DeviceAddress,
        retry_count: u32,
        has_session: bool,
        now: Instant,
    ) -> bool {
        if !has_session {
            return true;
        }
        if retry_count <= self.min_retry {
            return false;
        }
        match self.last.get(device) {
            Some(at) => now.saturating_duration_since(*at) >= self.cooldown,
            None => true,
        }
    }

    pub fn record(&self, device: DeviceAddress, now: Instant) {
        self.last.insert(device, now);
    }
}

/// Ask `sender` to re-send `message_id`. From the second attempt on, a fresh
/// bundle rides along so the sender can rebuild the session without a
/// relay round trip.
pub(crate) async fn send_retry_receipt(
    inner: &ClientInner,
    message_id: &str,
    chat: Jid,
    sender: DeviceAddress,
    force_keys: bool,
) -> Result<RetryOutcome, ClientError> {
    let Some(count) = inner.retries.bump(message_id) else {
        tracing::info!(id = %message_id, sender = %sender, "retry limit reached, giving up");
        return Ok(RetryOutcome::Exhausted);
    };

    let store = inner.store();
    let mut children = vec![
        Node::new("retry")
            .attr("count", count)
            .attr("id", message_id)
            .attr("t", now_secs())
            .attr("v", "1"),
        Node::new("registration").attr("value", get_registration_id(&**store).await?),
    ];
    if count > 1 || force_keys {
        let bundle = generate_pre_key_bundle(&**store, true).await?;
        children.push(
            Node::new("keys").with_children(vec![prekeys::bundle_to_node(&inner.own, &bundle)]),
        );
        children.push(device_identity_node(inner).await?);
    }

    let mut receipt = Node::new("receipt")
        .attr("id", message_id)
        .attr("to", sender)
        .attr("type", "retry");
    if chat.is_group() {
        receipt = receipt.attr("chat", chat);
    }
    inner.send_node(receipt.with_children(children)).await?;
    tracing::debug!(id = %message_id, sender = %sender, count, "sent retry receipt");
    Ok(RetryOutcome::Sent { count })
}

/// A peer device could not decrypt something we sent: re-encrypt it for
/// exactly that device.
pub(crate) async fn handle_retry_receipt(inner: &ClientInner, node: &Node) -> Result<(), ClientError> {
    let id = node.str_attr("id")?.to_string();
    let Jid::Device(requester) = node.jid_attr("from")? else {
        return Err(ClientError::UnexpectedResponse(
            "retry receipt from a non-device jid".into(),
        ));
    };
    let chat = node
        .opt_jid_attr("chat")?
        .unwrap_or(Jid::User(requester.user));
    let count = u32::try_from(node.require_child("retry")?.u64_attr("count")?).unwrap_or(u32::MAX);
    let their_registration = node
        .child("registration")
        .map(|r| r.u64_attr("value"))
        .transpose()?
        .and_then(|v| u32::try_from(v).ok());
    let supplied = node
        .child("keys")
        .and_then(|keys| keys.child("user"))
        .map(prekeys::bundle_from_node)
        .transpose()?;

    // Our own devices name no chat for direct messages, so the cache is
    // searched by id before the application is asked.
    let from_own_user = requester.user == inner.own.user;
    let cached = if from_own_user && !chat.is_group() {
        inner.recent.find_by_id(&id).await
    } else {
        None
    };
    let (chat, payload) = match cached {
        Some(found) => found,
        None => match inner.recent.find(inner.lookup.as_deref(), &chat, &id).await {
            Some(payload) => (chat, payload),
            None => return Err(ClientError::RetryPayloadMissing { message_id: id }),
        },
    };

    let _guard = inner.send_lock.lock().await;
    let now = Instant::now();
    let bundle = match supplied {
        Some(bundle) => {
            inner.recreates.record(requester, now);
            Some(bundle)
        }
        None => {
            let has_session = inner.cipher.has_session(&requester).await?;
            let reinstalled = match (their_registration, inner.cipher.remote_registration_id(&requester).await?) {
                (Some(theirs), Some(known)) => theirs != known,
                _ => false,
            };
            if reinstalled || inner.recreates.should_recreate(&requester, count, has_session, now) {
                let bundle = prekeys::fetch_bundles(inner, &[requester])
                    .await?
                    .remove(&requester)
                    .unwrap_or_else(|| Err("relay returned no bundle".to_string()))
                    .map_err(|reason| {
                        ClientError::UnexpectedResponse(format!(
                            "cannot rebuild session with {requester}: {reason}"
                        ))
                    })?;
                inner.recreates.record(requester, now);
                tracing::info!(device = %requester, count, "rebuilding session for retry");
                Some(bundle)
            } else {
                None
            }
        }
    };

    let mut resend = payload;
    if let Jid::Group(group) = chat {
        let distribution = inner
            .cipher
            .create_distribution_message(&group, &inner.own)
            .await?;
        resend.sender_key_distribution = Some(SenderKeyDistribution {
            group,
            message: distribution.serialized().to_vec(),
        });
    } else if from_own_user && chat != Jid::User(inner.own.user) {
        resend = resend.into_device_sent(chat);
    }

    let (kind, ciphertext) = inner
        .cipher
        .encrypt_for_device(&requester, &resend.encode()?, bundle.as_ref())
        .await?;
    let mut children = vec![enc_node(kind, ciphertext).attr("count", count)];
    if kind == CiphertextType::PreKey {
        children.push(device_identity_node(inner).await?);
    }
    let mut message = Node::new("message")
        .attr("id", id.as_str())
        .attr("to", requester)
        .attr("type", message_type(&resend))
        .attr("t", now_secs());
    if chat.is_group() {
        message = message.attr("chat", chat);
    }
    inner.send_node(message.with_children(children)).await?;

    tracing::info!(id = %id, device = %requester, count, kind = %kind, "re-sent message");
    inner.emit(Event::RetryResent {
        id,
        device: requester,
        count,
    });
    Ok(())
}
