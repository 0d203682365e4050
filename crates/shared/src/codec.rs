//! Frame encoding for nodes.
//!
//! The binary tree encoding used on the production wire is external to this
//! workspace; the client only depends on the `NodeCodec` trait. `JsonCodec` is
//! a self-describing stand-in used by tests and local tooling.

use crate::error::NodeError;
use crate::node::Node;

/// Encodes nodes to frame payloads and back.
pub trait NodeCodec: Send + Sync {
    fn encode(&self, node: &Node) -> Result<Vec<u8>, NodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Node, NodeError>;
}

/// JSON node encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl NodeCodec for JsonCodec {
    fn encode(&self, node: &Node) -> Result<Vec<u8>, NodeError> {
        Ok(serde_json::to_vec(node)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Node, NodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
