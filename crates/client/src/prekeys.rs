//! Pre-key bundles on the wire, bundle fetches, and keeping our own
//! one-time pre-keys stocked on the relay.

use std::collections::HashMap;

use courier_crypto::error::CryptoError;
use courier_crypto::identity::{get_identity, get_registration_id};
use courier_crypto::prekeys::{self, SerializedPreKey, SerializedPreKeyBundle};
use courier_crypto::storage::PreKeyStore;
use courier_shared::ids::{DeviceAddress, Jid};
use courier_shared::node::Node;
use libsignal_protocol::{GenericSignedPreKey, IdentityKey};

use crate::client::ClientInner;
use crate::error::ClientError;

/// Serialized Curve25519 public key: type byte plus point.
const EC_KEY_LEN: usize = 33;

fn ec_key_bytes(node: &Node, attr: &str) -> Result<Vec<u8>, ClientError> {
    let bytes = node.bytes_attr(attr)?;
    if bytes.len() != EC_KEY_LEN {
        return Err(ClientError::UnexpectedResponse(format!(
            "<{}> {attr} is not a {EC_KEY_LEN}-byte key",
            node.tag
        )));
    }
    Ok(bytes.to_vec())
}

fn u32_attr(node: &Node, attr: &str) -> Result<u32, ClientError> {
    let value = node.u64_attr(attr)?;
    u32::try_from(value)
        .map_err(|_| ClientError::UnexpectedResponse(format!("{attr} {value} out of range")))
}

fn identity_bytes(node: &Node) -> Result<Vec<u8>, ClientError> {
    let bytes = node.require_child("identity")?.require_bytes()?;
    IdentityKey::decode(bytes).map_err(CryptoError::from)?;
    Ok(bytes.to_vec())
}

fn signed_key_node(tag: &str, id: u32, key: &[u8], signature: &[u8]) -> Node {
    Node::new(tag)
        .attr("id", id)
        .attr("value", key.to_vec())
        .attr("signature", signature.to_vec())
}

/// `(id, value, signature)` of an `<skey>` or `<kyber>` child.
fn parse_signed_key(node: &Node, tag: &str) -> Result<(u32, Vec<u8>, Vec<u8>), ClientError> {
    let key = node.require_child(tag)?;
    let value = if tag == "skey" {
        ec_key_bytes(key, "value")?
    } else {
        key.bytes_attr("value")?.to_vec()
    };
    if value.is_empty() {
        return Err(ClientError::UnexpectedResponse(format!("<{tag}> has an empty key")));
    }
    Ok((u32_attr(key, "id")?, value, key.bytes_attr("signature")?.to_vec()))
}

fn one_time_key_node(key: &SerializedPreKey) -> Node {
    Node::new("key")
        .attr("id", key.key_id)
        .attr("value", key.public_key.clone())
}

fn parse_one_time_key(node: &Node) -> Result<SerializedPreKey, ClientError> {
    Ok(SerializedPreKey {
        key_id: u32_attr(node, "id")?,
        public_key: ec_key_bytes(node, "value")?,
    })
}

/// `<user jid=..>` carrying one device's bundle.
pub fn bundle_to_node(address: &DeviceAddress, bundle: &SerializedPreKeyBundle) -> Node {
    let mut children = vec![
        Node::new("registration").attr("value", bundle.registration_id),
        Node::new("identity").with_bytes(bundle.identity_key.clone()),
        signed_key_node(
            "skey",
            bundle.signed_pre_key_id,
            &bundle.signed_pre_key,
            &bundle.signed_pre_key_signature,
        ),
        signed_key_node(
            "kyber",
            bundle.kyber_pre_key_id,
            &bundle.kyber_pre_key,
            &bundle.kyber_pre_key_signature,
        ),
    ];
    if let Some(key) = &bundle.pre_key {
        children.push(one_time_key_node(key));
    }
    Node::new("user")
        .attr("jid", *address)
        .with_children(children)
}

pub fn bundle_from_node(node: &Node) -> Result<SerializedPreKeyBundle, ClientError> {
    let (signed_pre_key_id, signed_pre_key, signed_pre_key_signature) =
        parse_signed_key(node, "skey")?;
    let (kyber_pre_key_id, kyber_pre_key, kyber_pre_key_signature) =
        parse_signed_key(node, "kyber")?;
    Ok(SerializedPreKeyBundle {
        registration_id: u32_attr(node.require_child("registration")?, "value")?,
        identity_key: identity_bytes(node)?,
        signed_pre_key_id,
        signed_pre_key,
        signed_pre_key_signature,
        kyber_pre_key_id,
        kyber_pre_key,
        kyber_pre_key_signature,
        pre_key: node.child("key").map(parse_one_time_key).transpose()?,
    })
}

/// What a device publishes so others can start sessions with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyUpload {
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub kyber_pre_key_id: u32,
    pub kyber_pre_key: Vec<u8>,
    pub kyber_pre_key_signature: Vec<u8>,
    pub pre_keys: Vec<SerializedPreKey>,
}

impl PreKeyUpload {
    pub fn to_node(&self) -> Node {
        Node::new("iq")
            .attr("type", "set")
            .attr("xmlns", "encrypt")
            .with_children(vec![
                Node::new("registration").attr("value", self.registration_id),
                Node::new("identity").with_bytes(self.identity_key.clone()),
                Node::new("list")
                    .with_children(self.pre_keys.iter().map(one_time_key_node).collect()),
                signed_key_node(
                    "skey",
                    self.signed_pre_key_id,
                    &self.signed_pre_key,
                    &self.signed_pre_key_signature,
                ),
                signed_key_node(
                    "kyber",
                    self.kyber_pre_key_id,
                    &self.kyber_pre_key,
                    &self.kyber_pre_key_signature,
                ),
            ])
    }

    pub fn from_node(node: &Node) -> Result<Self, ClientError> {
        let (signed_pre_key_id, signed_pre_key, signed_pre_key_signature) =
            parse_signed_key(node, "skey")?;
        let (kyber_pre_key_id, kyber_pre_key, kyber_pre_key_signature) =
            parse_signed_key(node, "kyber")?;
        Ok(Self {
            registration_id: u32_attr(node.require_child("registration")?, "value")?,
            identity_key: identity_bytes(node)?,
            signed_pre_key_id,
            signed_pre_key,
            signed_pre_key_signature,
            kyber_pre_key_id,
            kyber_pre_key,
            kyber_pre_key_signature,
            pre_keys: match node.child("list") {
                Some(list) => list
                    .children_by_tag("key")
                    .map(parse_one_time_key)
                    .collect::<Result<_, _>>()?,
                None => Vec::new(),
            },
        })
    }

    /// The bundle a fetch for this device would return, with `pre_key` as
    /// its one-time key.
    pub fn bundle(&self, pre_key: Option<SerializedPreKey>) -> SerializedPreKeyBundle {
        SerializedPreKeyBundle {
            registration_id: self.registration_id,
            identity_key: self.identity_key.clone(),
            signed_pre_key_id: self.signed_pre_key_id,
            signed_pre_key: self.signed_pre_key.clone(),
            signed_pre_key_signature: self.signed_pre_key_signature.clone(),
            kyber_pre_key_id: self.kyber_pre_key_id,
            kyber_pre_key: self.kyber_pre_key.clone(),
            kyber_pre_key_signature: self.kyber_pre_key_signature.clone(),
            pre_key,
        }
    }
}

pub(crate) fn bundle_request(addresses: &[DeviceAddress]) -> Node {
    Node::new("iq")
        .attr("type", "get")
        .attr("xmlns", "encrypt")
        .with_children(vec![Node::new("key").with_children(
            addresses
                .iter()
                .map(|a| Node::new("user").attr("jid", *a))
                .collect(),
        )])
}

/// Fetch bundles for `addresses` in one request. Devices the relay has no
/// keys for come back as per-device errors.
pub(crate) async fn fetch_bundles(
    inner: &ClientInner,
    addresses: &[DeviceAddress],
) -> Result<HashMap<DeviceAddress, Result<SerializedPreKeyBundle, String>>, ClientError> {
    let response = inner.send_iq(bundle_request(addresses)).await?;
    let mut bundles = HashMap::new();
    for user in response.require_child("list")?.children_by_tag("user") {
        let Jid::Device(address) = user.jid_attr("jid")? else {
            continue;
        };
        let entry = match user.child("error") {
            Some(error) => Err(format!(
                "no pre-keys: {}",
                error.get_str("text").unwrap_or("unknown")
            )),
            None => bundle_from_node(user).map_err(|e| e.to_string()),
        };
        bundles.insert(address, entry);
    }
    for address in addresses {
        bundles
            .entry(*address)
            .or_insert_with(|| Err("relay returned no bundle".to_string()));
    }
    Ok(bundles)
}

/// One-time pre-keys the relay still holds for us.
pub(crate) async fn query_pre_key_count(inner: &ClientInner) -> Result<usize, ClientError> {
    let request = Node::new("iq")
        .attr("type", "get")
        .attr("xmlns", "encrypt")
        .with_children(vec![Node::new("count")]);
    let response = inner.send_iq(request).await?;
    let count = response.require_child("count")?.u64_attr("value")?;
    Ok(usize::try_from(count).unwrap_or(usize::MAX))
}

/// Generate `count` fresh one-time pre-keys and publish them with our
/// current signed pre-key.
pub(crate) async fn upload_pre_keys(inner: &ClientInner, count: u32) -> Result<(), ClientError> {
    let store = inner.store();
    let identity = get_identity(&**store).await?;
    let registration_id = get_registration_id(&**store).await?;
    let (signed, kyber) = prekeys::current_signed_pre_keys(&**store).await?;
    let pre_keys = prekeys::generate_one_time_pre_keys(&**store, count).await?;

    let signed_pre_key_id = u32::from(signed.id()?);
    let upload = PreKeyUpload {
        registration_id,
        identity_key: identity.identity_key().serialize().to_vec(),
        signed_pre_key_id,
        signed_pre_key: signed.public_key()?.serialize().to_vec(),
        signed_pre_key_signature: signed.signature()?,
        kyber_pre_key_id: u32::from(kyber.id()?),
        kyber_pre_key: kyber.public_key()?.serialize().to_vec(),
        kyber_pre_key_signature: kyber.signature()?,
        pre_keys,
    };
    inner.send_iq(upload.to_node()).await?;

    let ids: Vec<u32> = upload.pre_keys.iter().map(|k| k.key_id).collect();
    store.mark_pre_keys_uploaded(&ids).await?;
    tracing::info!(count = ids.len(), signed_pre_key_id, "uploaded pre-keys");
    Ok(())
}

/// Top up one-time pre-keys below the threshold and rotate a stale signed
/// pre-key.
pub(crate) async fn maintain_pre_keys(inner: &ClientInner) -> Result<(), ClientError> {
    let store = inner.store();
    let max_age_days = inner.config.signed_pre_key_max_age_days;
    let rotated = if prekeys::is_signed_pre_key_stale(&**store, max_age_days).await? {
        let record = prekeys::rotate_signed_pre_key(&**store).await?;
        let signed_pre_key_id = u32::from(record.id()?);
        tracing::info!(signed_pre_key_id, "rotated signed pre-key");
        true
    } else {
        false
    };

    let count = query_pre_key_count(inner).await?;
    if count < inner.config.pre_key_upload_threshold {
        tracing::debug!(count, "relay pre-key count below threshold");
        upload_pre_keys(inner, inner.config.pre_key_upload_batch).await
    } else if rotated {
        upload_pre_keys(inner, 0).await
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_crypto::identity::generate_identity;
    use courier_crypto::storage::MemoryStore;
    use courier_shared::ids::UserId;

    #[tokio::test]
    async fn bundle_survives_the_wire() {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        let bundle = prekeys::generate_pre_key_bundle(&store, true).await.unwrap();
        let address = DeviceAddress::new(UserId::new(), 2);

        let node = bundle_to_node(&address, &bundle);
        assert_eq!(node.jid_attr("jid").unwrap(), Jid::Device(address));
        let parsed = bundle_from_node(&node).unwrap();
        assert_eq!(parsed, bundle);
        parsed.verify().unwrap();
    }

    #[tokio::test]
    async fn bundle_without_one_time_key() {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        let bundle = prekeys::generate_pre_key_bundle(&store, false).await.unwrap();
        let node = bundle_to_node(&DeviceAddress::new(UserId::new(), 0), &bundle);
        assert!(node.child("key").is_none());
        assert!(bundle_from_node(&node).unwrap().pre_key.is_none());
    }

    #[tokio::test]
    async fn upload_node_parses_back_and_yields_verifiable_bundles() {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        let bundle = prekeys::generate_pre_key_bundle(&store, false).await.unwrap();
        let upload = PreKeyUpload {
            registration_id: bundle.registration_id,
            identity_key: bundle.identity_key.clone(),
            signed_pre_key_id: bundle.signed_pre_key_id,
            signed_pre_key: bundle.signed_pre_key.clone(),
            signed_pre_key_signature: bundle.signed_pre_key_signature.clone(),
            kyber_pre_key_id: bundle.kyber_pre_key_id,
            kyber_pre_key: bundle.kyber_pre_key.clone(),
            kyber_pre_key_signature: bundle.kyber_pre_key_signature.clone(),
            pre_keys: prekeys::generate_one_time_pre_keys(&store, 2).await.unwrap(),
        };

        let parsed = PreKeyUpload::from_node(&upload.to_node()).unwrap();
        assert_eq!(parsed, upload);
        let rebuilt = parsed.bundle(parsed.pre_keys.first().cloned());
        rebuilt.verify().unwrap();
        assert_eq!(rebuilt.pre_key.unwrap().key_id, upload.pre_keys[0].key_id);
    }

    #[test]
    fn short_key_is_rejected() {
        let node = Node::new("key").attr("id", 1u32).attr("value", vec![0u8; 5]);
        assert!(parse_one_time_key(&node).is_err());
    }

    #[tokio::test]
    async fn bundle_with_garbage_identity_is_rejected() {
        let store = MemoryStore::new();
        generate_identity(&store).await.unwrap();
        let mut bundle = prekeys::generate_pre_key_bundle(&store, false).await.unwrap();
        bundle.identity_key = vec![0xAA; 33];
        let node = bundle_to_node(&DeviceAddress::new(UserId::new(), 0), &bundle);
        assert!(bundle_from_node(&node).is_err());
    }
}
