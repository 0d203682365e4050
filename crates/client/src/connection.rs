//! The connection loop: one handshake, then reader, writer, dispatcher and
//! keepalive tasks until one of them ends the connection.

use std::sync::Arc;
use std::time::Duration;

use courier_crypto::identity::{get_identity, get_registration_id};
use courier_crypto::keys::KeyPair;
use courier_shared::codec::NodeCodec;
use courier_shared::node::Node;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::client::ClientInner;
use crate::dispatch::{self, InboundKind};
use crate::error::ClientError;
use crate::events::Event;
use crate::socket::{self, ClientPayload, SecureSink, SecureStream};

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Reconnect with bounded exponential backoff until shutdown or logout.
pub(crate) async fn run(inner: &Arc<ClientInner>) -> Result<(), ClientError> {
    let initial = Duration::from_millis(inner.config.reconnect_initial_delay_ms);
    let max = Duration::from_millis(inner.config.reconnect_max_delay_ms);
    let mut delay = initial;
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let mut established = false;
        match run_connection(inner, &mut established).await {
            Ok(()) => return Ok(()),
            Err(ClientError::LoggedOut) => {
                tracing::warn!(address = %inner.own, "relay revoked this device, not reconnecting");
                inner.emit(Event::LoggedOut);
                return Err(ClientError::LoggedOut);
            }
            Err(e) => {
                if established {
                    delay = initial;
                }
                tracing::warn!(
                    address = %inner.own,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, reconnecting"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
        delay = (delay * 2).min(max);
    }
}

fn flatten(result: Result<Result<(), ClientError>, tokio::task::JoinError>) -> Result<(), ClientError> {
    match result {
        Ok(inner) => inner,
        Err(e) => {
            tracing::error!(error = %e, "connection task failed");
            Err(ClientError::ConnectionClosed)
        }
    }
}

/// One connection from handshake to teardown. `Ok(())` means we were asked
/// to disconnect.
async fn run_connection(
    inner: &Arc<ClientInner>,
    established: &mut bool,
) -> Result<(), ClientError> {
    let store = inner.store();
    let static_key = KeyPair::from_identity(&get_identity(&**store).await?)?;
    let payload = ClientPayload {
        address: inner.own,
        registration_id: get_registration_id(&**store).await?,
        passive: inner.config.passive,
    };
    let trusted_root = inner.config.trusted_root()?;
    let (sink, stream) = socket::connect(
        &*inner.transport,
        static_key,
        trusted_root,
        &payload,
        inner.config.handshake_timeout(),
    )
    .await?;
    *established = true;
    tracing::info!(address = %inner.own, "transport handshake complete");

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let (hop_tx, hop_rx) = mpsc::unbounded_channel();
    let (work_tx, work_rx) = mpsc::channel(inner.config.work_queue_capacity);
    inner.set_outbound(Some(out_tx)).await;

    let mut writer = tokio::spawn(writer_loop(sink, out_rx, inner.codec.clone()));
    let mut reader = tokio::spawn(reader_loop(inner.clone(), stream, hop_tx));
    let forwarder = tokio::spawn(forward_loop(hop_rx, work_tx));
    let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), work_rx));
    let mut keepalive = tokio::spawn(keepalive_loop(inner.clone()));
    let mut shutdown = inner.shutdown.subscribe();

    // Whichever task ends first decides how the connection ended.
    let result = tokio::select! {
        r = &mut reader => flatten(r),
        r = &mut writer => flatten(r),
        r = &mut keepalive => flatten(r),
        _ = shutdown.changed() => Ok(()),
    };

    teardown(inner, [reader, writer, keepalive, forwarder, dispatcher]).await;
    let reason = match &result {
        Ok(()) => "disconnected".to_string(),
        Err(e) => e.to_string(),
    };
    inner.emit(Event::Disconnected { reason });
    result
}

async fn teardown(inner: &ClientInner, tasks: [JoinHandle<Result<(), ClientError>>; 5]) {
    inner.set_outbound(None).await;
    for task in tasks {
        task.abort();
    }
    inner.pending.fail_all();
}

async fn writer_loop(
    mut sink: SecureSink,
    mut rx: mpsc::Receiver<Node>,
    codec: Arc<dyn NodeCodec>,
) -> Result<(), ClientError> {
    while let Some(node) = rx.recv().await {
        let frame = match codec.encode(&node) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(tag = %node.tag, error = %e, "failed to encode outbound node");
                continue;
            }
        };
        sink.send(&frame).await?;
    }
    sink.close().await;
    Err(ClientError::ConnectionClosed)
}

/// A `failure` or `stream:error` node ends the connection. Code 401 means
/// this device was logged out.
pub(crate) fn stream_failure(node: &Node) -> ClientError {
    let code = node
        .opt_u64_attr("code")
        .ok()
        .flatten()
        .or_else(|| node.opt_u64_attr("reason").ok().flatten())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    if code == 401 {
        return ClientError::LoggedOut;
    }
    ClientError::StreamError {
        code,
        text: node.get_str("text").unwrap_or_default().to_string(),
    }
}

/// Never waits on the work queue: IQ responses must keep resolving while
/// every handler is busy, since handlers themselves wait on IQs.
async fn reader_loop(
    inner: Arc<ClientInner>,
    mut stream: SecureStream,
    work: mpsc::UnboundedSender<Node>,
) -> Result<(), ClientError> {
    loop {
        let frame = stream.next().await?.ok_or(ClientError::ConnectionClosed)?;
        let node = match inner.codec.decode(&frame) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };

        if matches!(
            InboundKind::from_tag(&node.tag),
            InboundKind::Failure | InboundKind::StreamError
        ) {
            return Err(stream_failure(&node));
        }

        if let Some(node) = inner.pending.resolve(node) {
            work.send(node).map_err(|_| ClientError::ConnectionClosed)?;
        }
    }
}

/// Feeds the bounded work queue. Back-pressure from busy handlers stops
/// here instead of in the reader.
async fn forward_loop(
    mut hop: mpsc::UnboundedReceiver<Node>,
    work: mpsc::Sender<Node>,
) -> Result<(), ClientError> {
    while let Some(node) = hop.recv().await {
        work.send(node)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
    }
    Ok(())
}

async fn dispatch_loop(
    inner: Arc<ClientInner>,
    mut work: mpsc::Receiver<Node>,
) -> Result<(), ClientError> {
    let limit = Arc::new(Semaphore::new(inner.config.max_concurrent_handlers));
    while let Some(node) = work.recv().await {
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatch::handle_node(&inner, node).await;
        });
    }
    Ok(())
}

fn ping() -> Node {
    Node::new("iq")
        .attr("type", "get")
        .attr("xmlns", "w:p")
        .with_children(vec![Node::new("ping")])
}

async fn keepalive_loop(inner: Arc<ClientInner>) -> Result<(), ClientError> {
    let (min, max) = (inner.config.keepalive_min_secs, inner.config.keepalive_max_secs);
    loop {
        let wait = rand::rng().random_range(min..=max);
        tokio::time::sleep(Duration::from_secs(wait)).await;

        match inner
            .send_iq_with_timeout(ping(), inner.config.keepalive_timeout())
            .await
        {
            Ok(_) | Err(ClientError::Iq { .. }) => {}
            Err(ClientError::Timeout) => {
                tracing::warn!(address = %inner.own, "keepalive unanswered");
                return Err(ClientError::KeepaliveTimeout);
            }
            Err(e) => return Err(e),
        }
    }
}
