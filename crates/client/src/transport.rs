//! The physical duplex link to the relay.
//!
//! Implementations deliver complete frames only; framing over a byte stream
//! is their business. `MemoryTransport` connects a client to an in-process
//! listener and is what the tests run on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait FrameStream: Send {
    /// The next frame, or `None` once the peer has closed the link.
    async fn next(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

const MEMORY_CHANNEL_CAPACITY: usize = 256;

pub struct MemorySink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

pub struct MemoryStream {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The relay's end of one memory connection.
pub struct MemoryConnection {
    pub sink: MemorySink,
    pub stream: MemoryStream,
}

fn memory_pipe() -> (MemoryConnection, MemoryConnection) {
    let (client_tx, relay_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
    let (relay_tx, client_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
    (
        MemoryConnection {
            sink: MemorySink { tx: Some(client_tx) },
            stream: MemoryStream { rx: client_rx },
        },
        MemoryConnection {
            sink: MemorySink { tx: Some(relay_tx) },
            stream: MemoryStream { rx: relay_rx },
        },
    )
}

/// Client side: every `open` hands a fresh pipe to the paired listener.
#[derive(Clone)]
pub struct MemoryTransport {
    listener: mpsc::UnboundedSender<MemoryConnection>,
}

pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { listener: tx },
            MemoryListener { incoming: rx },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let (client, relay) = memory_pipe();
        self.listener
            .send(relay)
            .map_err(|_| TransportError::Io("listener is gone".into()))?;
        Ok((Box::new(client.sink), Box::new(client.stream)))
    }
}

impl MemoryListener {
    /// Wait for the next client to open a connection.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut listener) = MemoryTransport::pair();
        let (mut sink, mut stream) = transport.open().await.unwrap();
        let mut relay = listener.accept().await.unwrap();

        sink.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(relay.stream.next().await.unwrap().unwrap(), b"ping");

        relay.sink.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn closing_ends_the_peer_stream() {
        let (transport, mut listener) = MemoryTransport::pair();
        let (mut sink, _stream) = transport.open().await.unwrap();
        let mut relay = listener.accept().await.unwrap();

        sink.close().await;
        assert!(relay.stream.next().await.is_none());
        assert!(matches!(
            sink.send(vec![1]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn open_fails_without_listener() {
        let (transport, listener) = MemoryTransport::pair();
        drop(listener);
        assert!(transport.open().await.is_err());
    }
}
