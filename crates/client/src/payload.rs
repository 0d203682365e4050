//! The plaintext carried inside every encrypted message.

use courier_crypto::storage::SyncKey;
use courier_shared::ids::{GroupId, Jid};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// A message our own other devices receive on our behalf: the original
/// payload plus the chat it was sent to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSent {
    pub destination: Jid,
    pub message: Box<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub group: GroupId,
    /// Serialized `SenderKeyDistributionMessage`.
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateKeyShare {
    pub keys: Vec<SyncKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateKeyRequest {
    pub key_ids: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_sent: Option<DeviceSent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_distribution: Option<SenderKeyDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state_key_share: Option<AppStateKeyShare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state_key_request: Option<AppStateKeyRequest>,
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ClientError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClientError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Wrap for delivery to our own other devices.
    pub fn into_device_sent(self, destination: Jid) -> Self {
        Self {
            device_sent: Some(DeviceSent {
                destination,
                message: Box::new(self),
            }),
            ..Self::default()
        }
    }

    /// Nothing an application would show; only protocol plumbing.
    pub fn is_protocol_only(&self) -> bool {
        self.body.is_none() && self.device_sent.is_none()
    }
}
