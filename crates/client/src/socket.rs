//! Secure socket: drives the Noise handshake over a transport and wraps the
//! resulting transport ciphers around its frame sink and stream.

use std::time::Duration;

use courier_crypto::error::CryptoError;
use courier_crypto::handshake::{
    ClientHandshake, NoiseCertificate, NoiseCipher, ServerHandshake,
};
use courier_crypto::keys::{KeyPair, KEY_LEN};
use courier_shared::ids::DeviceAddress;
use libsignal_protocol::IdentityKey;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, TransportError};
use crate::transport::{FrameSink, FrameStream, Transport};

/// The hello the client sends inside the last handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPayload {
    pub address: DeviceAddress,
    pub registration_id: u32,
    pub passive: bool,
}

/// Encrypting half. Owned by the connection's writer task.
pub struct SecureSink {
    sink: Box<dyn FrameSink>,
    cipher: NoiseCipher,
}

impl SecureSink {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ClientError> {
        let frame = self.cipher.encrypt(plaintext)?;
        self.sink.send(frame).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.sink.close().await;
    }

    pub fn frames_sent(&self) -> u64 {
        self.cipher.counter()
    }
}

/// Decrypting half. Owned by the connection's reader task.
pub struct SecureStream {
    stream: Box<dyn FrameStream>,
    cipher: NoiseCipher,
}

impl SecureStream {
    /// The next decrypted frame; `Ok(None)` when the peer closed cleanly.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        let frame = match self.stream.next().await {
            Some(frame) => frame?,
            None => return Ok(None),
        };
        let plaintext = self.cipher.decrypt(&frame).map_err(|e| {
            TransportError::Io(format!("frame {} rejected: {e}", self.cipher.counter()))
        })?;
        Ok(Some(plaintext))
    }
}

fn handshake_error(err: CryptoError) -> ClientError {
    match err {
        CryptoError::Handshake(msg) => ClientError::Handshake(msg),
        other => ClientError::Handshake(other.to_string()),
    }
}

async fn read_handshake_frame(stream: &mut dyn FrameStream) -> Result<Vec<u8>, ClientError> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(ClientError::Handshake(format!("transport failed: {e}"))),
        None => Err(ClientError::Handshake(
            "transport closed during handshake".into(),
        )),
    }
}

async fn write_handshake_frame(sink: &mut dyn FrameSink, frame: Vec<u8>) -> Result<(), ClientError> {
    sink.send(frame)
        .await
        .map_err(|e| ClientError::Handshake(format!("transport failed: {e}")))
}

/// Open a transport and run the initiator side of the handshake.
pub async fn connect(
    transport: &dyn Transport,
    static_key: KeyPair,
    trusted_root: Option<IdentityKey>,
    payload: &ClientPayload,
    timeout: Duration,
) -> Result<(SecureSink, SecureStream), ClientError> {
    let payload = serde_json::to_vec(payload)?;
    let attempt = async {
        let (mut sink, mut stream) = transport
            .open()
            .await
            .map_err(|e| ClientError::Handshake(format!("transport failed: {e}")))?;

        let (handshake, hello) =
            ClientHandshake::start(static_key, trusted_root).map_err(handshake_error)?;
        write_handshake_frame(&mut *sink, hello).await?;

        let server_hello = read_handshake_frame(&mut *stream).await?;
        let (finish, ciphers) = handshake
            .process_server_hello(&server_hello, &payload)
            .map_err(handshake_error)?;
        write_handshake_frame(&mut *sink, finish).await?;

        Ok::<_, ClientError>((
            SecureSink {
                sink,
                cipher: ciphers.send,
            },
            SecureStream {
                stream,
                cipher: ciphers.recv,
            },
        ))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Handshake(format!(
            "no answer within {}s",
            timeout.as_secs()
        ))),
    }
}

/// A connection accepted by the responder side.
pub struct AcceptedSocket {
    pub sink: SecureSink,
    pub stream: SecureStream,
    pub remote_static: [u8; KEY_LEN],
    pub payload: ClientPayload,
}

/// Run the responder side over an already-open link. Used by relays and test
/// harnesses.
pub async fn accept(
    mut sink: Box<dyn FrameSink>,
    mut stream: Box<dyn FrameStream>,
    static_key: &KeyPair,
    certificate: &NoiseCertificate,
) -> Result<AcceptedSocket, ClientError> {
    let client_hello = read_handshake_frame(&mut *stream).await?;
    let (handshake, server_hello) =
        ServerHandshake::accept(static_key, certificate, &client_hello).map_err(handshake_error)?;
    write_handshake_frame(&mut *sink, server_hello).await?;

    let finish = read_handshake_frame(&mut *stream).await?;
    let accepted = handshake.complete(&finish).map_err(handshake_error)?;
    let payload: ClientPayload = serde_json::from_slice(&accepted.payload)
        .map_err(|e| ClientError::Handshake(format!("malformed client payload: {e}")))?;

    Ok(AcceptedSocket {
        sink: SecureSink {
            sink,
            cipher: accepted.ciphers.send,
        },
        stream: SecureStream {
            stream,
            cipher: accepted.ciphers.recv,
        },
        remote_static: accepted.remote_static,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use libsignal_protocol::IdentityKeyPair;
    use courier_shared::ids::UserId;

    fn certificate(root: &IdentityKeyPair, relay: &KeyPair, expires: i64) -> NoiseCertificate {
        NoiseCertificate::issue(root, "relay", relay.public_bytes(), expires).unwrap()
    }

    fn payload() -> ClientPayload {
        ClientPayload {
            address: DeviceAddress::new(UserId::new(), 3),
            registration_id: 77,
            passive: false,
        }
    }

    #[tokio::test]
    async fn handshake_then_frames_in_both_directions() {
        let (transport, mut listener) = MemoryTransport::pair();
        let root = IdentityKeyPair::generate(&mut rand::rng());
        let relay_key = KeyPair::generate();
        let cert = certificate(&root, &relay_key, i64::MAX);
        let client_key = KeyPair::generate();
        let client_public = client_key.public_bytes();

        let relay = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let accepted = accept(
                Box::new(conn.sink),
                Box::new(conn.stream),
                &relay_key,
                &cert,
            )
            .await
            .unwrap();
            (accepted, listener)
        });

        let hello = payload();
        let (mut sink, mut stream) = connect(
            &transport,
            client_key,
            Some(*root.identity_key()),
            &hello,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let (mut accepted, _listener) = relay.await.unwrap();
        assert_eq!(accepted.payload, hello);
        assert_eq!(accepted.remote_static, client_public);

        sink.send(b"up").await.unwrap();
        sink.send(b"up again").await.unwrap();
        assert_eq!(accepted.stream.next().await.unwrap().unwrap(), b"up");
        assert_eq!(accepted.stream.next().await.unwrap().unwrap(), b"up again");
        assert_eq!(sink.frames_sent(), 2);

        accepted.sink.send(b"down").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"down");
    }

    #[tokio::test]
    async fn silent_relay_times_out() {
        let (transport, mut listener) = MemoryTransport::pair();
        let _hold = tokio::spawn(async move {
            let conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(conn);
        });
        let result = connect(
            &transport,
            KeyPair::generate(),
            None,
            &payload(),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }

    #[tokio::test]
    async fn relay_closing_mid_handshake_is_fatal() {
        let (transport, mut listener) = MemoryTransport::pair();
        tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let _ = conn.stream.next().await;
        });
        let result = connect(
            &transport,
            KeyPair::generate(),
            None,
            &payload(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }

    #[tokio::test]
    async fn untrusted_certificate_is_rejected() {
        let (transport, mut listener) = MemoryTransport::pair();
        let relay_key = KeyPair::generate();
        let cert = certificate(&IdentityKeyPair::generate(&mut rand::rng()), &relay_key, i64::MAX);
        tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let _ = accept(
                Box::new(conn.sink),
                Box::new(conn.stream),
                &relay_key,
                &cert,
            )
            .await;
        });
        let result = connect(
            &transport,
            KeyPair::generate(),
            Some(*IdentityKeyPair::generate(&mut rand::rng()).identity_key()),
            &payload(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }
}
