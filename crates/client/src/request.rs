//! Request/response correlation for IQ nodes.
//!
//! The reader task hands every `iq` result or error to [`PendingRequests::resolve`];
//! the caller waiting on the matching id gets it through a oneshot. Each
//! waiter is released exactly once: by its response, by the drop guard when
//! the caller gives up, or by [`PendingRequests::fail_all`] when the
//! connection goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_shared::node::Node;
use dashmap::DashMap;
use tokio::sync::{oneshot, watch};

use crate::error::ClientError;

pub struct PendingRequests {
    waiters: DashMap<String, oneshot::Sender<Node>>,
    counter: AtomicU64,
    prefix: String,
}

/// Removes the waiter for `id` when dropped, whatever the outcome.
pub struct PendingGuard<'a> {
    requests: &'a PendingRequests,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.requests.waiters.remove(&self.id);
    }
}

fn is_response(node: &Node) -> bool {
    node.tag == "iq" && matches!(node.get_str("type"), Some("result") | Some("error"))
}

impl PendingRequests {
    pub fn new() -> Self {
        let prefix: u32 = rand::random();
        Self {
            waiters: DashMap::new(),
            counter: AtomicU64::new(1),
            prefix: format!("{prefix:08x}"),
        }
    }

    pub fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, id: String) -> (PendingGuard<'_>, oneshot::Receiver<Node>) {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.clone(), tx);
        (PendingGuard { requests: self, id }, rx)
    }

    /// Deliver a response to its waiter. Anything that is not a response to
    /// a pending request is handed back.
    pub fn resolve(&self, node: Node) -> Option<Node> {
        if !is_response(&node) {
            return Some(node);
        }
        let Some(id) = node.get_str("id").map(str::to_owned) else {
            return Some(node);
        };
        match self.waiters.remove(&id) {
            Some((_, waiter)) => {
                if waiter.send(node).is_err() {
                    tracing::debug!(id = %id, "response arrived after the waiter left");
                }
                None
            }
            None => Some(node),
        }
    }

    /// Drop every waiter; their callers see `ConnectionClosed`.
    pub fn fail_all(&self) {
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a registered response, distinguishing timeout, cancellation and
/// connection loss.
pub async fn wait_response(
    rx: oneshot::Receiver<Node>,
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Node, ClientError> {
    if *shutdown.borrow_and_update() {
        return Err(ClientError::Cancelled);
    }
    tokio::select! {
        result = tokio::time::timeout(timeout, rx) => match result {
            Ok(Ok(node)) => Ok(node),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        },
        _ = shutdown.changed() => Err(ClientError::Cancelled),
    }
}

/// Turn an `iq type="error"` response into `ClientError::Iq`.
pub fn check_iq_error(node: Node) -> Result<Node, ClientError> {
    if node.get_str("type") != Some("error") {
        return Ok(node);
    }
    let (code, text) = match node.child("error") {
        Some(error) => (
            error
                .opt_u64_attr("code")
                .ok()
                .flatten()
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500),
            error.get_str("text").unwrap_or_default().to_string(),
        ),
        None => (500, String::new()),
    };
    Err(ClientError::Iq { code, text })
}
