//! Routing of inbound nodes to their handlers.

use std::sync::Arc;

use courier_shared::node::Node;

use crate::appstate;
use crate::client::ClientInner;
use crate::devices;
use crate::error::ClientError;
use crate::events::Event;
use crate::prekeys;
use crate::receive;
use crate::retry;
use crate::send;

/// Every top-level node the relay may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Message,
    Receipt,
    Notification,
    Iq,
    Success,
    Failure,
    StreamError,
    Ack,
    Unknown,
}

impl InboundKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "message" => InboundKind::Message,
            "receipt" => InboundKind::Receipt,
            "notification" => InboundKind::Notification,
            "iq" => InboundKind::Iq,
            "success" => InboundKind::Success,
            "failure" => InboundKind::Failure,
            "stream:error" => InboundKind::StreamError,
            "ack" => InboundKind::Ack,
            _ => InboundKind::Unknown,
        }
    }
}

/// Handle one inbound node. Errors are logged; nothing here may take the
/// connection down.
pub(crate) async fn handle_node(inner: &Arc<ClientInner>, node: Node) {
    let kind = InboundKind::from_tag(&node.tag);
    let tag = node.tag.clone();
    let result = match kind {
        InboundKind::Message => receive::handle_message(inner, node).await,
        InboundKind::Receipt => handle_receipt(inner, node).await,
        InboundKind::Notification => handle_notification(inner, node).await,
        InboundKind::Iq => handle_server_iq(inner, node).await,
        InboundKind::Success => {
            handle_success(inner).await;
            Ok(())
        }
        InboundKind::Ack => send::handle_ack(inner, &node),
        InboundKind::Failure | InboundKind::StreamError => Ok(()),
        InboundKind::Unknown => {
            tracing::debug!(tag = %tag, "ignoring unknown node");
            Ok(())
        }
    };
    if let Err(e) = result {
        tracing::warn!(tag = %tag, error = %e, "failed to handle inbound node");
    }
}

/// Login accepted: make sure the relay can hand out our pre-keys, then tell
/// the application we are online.
async fn handle_success(inner: &ClientInner) {
    if let Err(e) = prekeys::maintain_pre_keys(inner).await {
        tracing::warn!(error = %e, "pre-key maintenance failed");
    }
    inner.emit(Event::Connected);
}

fn ack_for(node: &Node, class: &str) -> Option<Node> {
    let id = node.get_str("id")?;
    let mut ack = Node::new("ack").attr("class", class).attr("id", id);
    if let Ok(Some(from)) = node.opt_jid_attr("from") {
        ack = ack.attr("to", from);
    }
    if let Some(kind) = node.get_str("type") {
        ack = ack.attr("type", kind);
    }
    Some(ack)
}

pub(crate) async fn send_ack(inner: &ClientInner, node: &Node, class: &str) {
    if let Some(ack) = ack_for(node, class) {
        if let Err(e) = inner.send_node(ack).await {
            tracing::debug!(class, error = %e, "could not acknowledge node");
        }
    }
}

async fn handle_receipt(inner: &ClientInner, node: Node) -> Result<(), ClientError> {
    let result = match node.get_str("type") {
        Some("retry") => retry::handle_retry_receipt(inner, &node).await,
        _ => Ok(()),
    };
    send_ack(inner, &node, "receipt").await;
    result
}

async fn handle_notification(inner: &ClientInner, node: Node) -> Result<(), ClientError> {
    let result = match node.get_str("type") {
        Some("server_sync") => {
            let names: Vec<String> = node
                .children_by_tag("collection")
                .filter_map(|c| c.get_str("name").map(str::to_owned))
                .collect();
            send_ack(inner, &node, "notification").await;
            for name in names {
                if let Err(e) = appstate::fetch_app_state(inner, &name, false).await {
                    tracing::warn!(name = %name, error = %e, "app-state sync failed");
                }
            }
            return Ok(());
        }
        Some("encrypt") => prekeys::maintain_pre_keys(inner).await,
        Some("devices") => devices::handle_devices_notification(inner, &node),
        other => {
            tracing::debug!(kind = ?other, "ignoring notification");
            Ok(())
        }
    };
    send_ack(inner, &node, "notification").await;
    result
}

/// Requests the relay makes of us. Only pings are expected.
async fn handle_server_iq(inner: &ClientInner, node: Node) -> Result<(), ClientError> {
    if node.get_str("type") != Some("get") || node.child("ping").is_none() {
        tracing::debug!(xmlns = ?node.get_str("xmlns"), "ignoring relay request");
        return Ok(());
    }
    let id = node.str_attr("id")?;
    inner
        .send_node(Node::new("iq").attr("id", id).attr("type", "result"))
        .await
}
