//! Connection establishment and sealed framing
//!
//! Pre-handshake frames travel in plaintext; after HANDSHAKE_OK both
//! directions switch to AEAD-sealed bodies under fresh session keys. The
//! read half is owned by the connection's read loop; the write half sits
//! behind an async mutex so watcher-driven sends, chunk streaming, and
//! heartbeats never interleave frames.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::auth::session::{
    handshake_mac, verify_handshake_mac, OpenKey, Role, SealKey, SessionCrypto, TAG_SIZE,
};
use crate::auth::{AuthError, PairingRecord};
use crate::transport::frame::{
    ChallengeHeader, HelloHeader, Message, ProtocolError, ResponseHeader, MAX_FRAME_LEN,
};
use crate::transport::{Result, TransportError, HANDSHAKE_TIMEOUT};

/// An authenticated connection, split into its two halves.
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub reader: ConnectionReader,
    pub sender: ConnectionSender,
}

/// Read half. Owned by the connection's single read loop.
pub struct ConnectionReader {
    half: OwnedReadHalf,
    open: Option<OpenKey>,
}

impl ConnectionReader {
    /// Read, unseal, and decode the next frame.
    pub async fn next(&mut self) -> Result<Message> {
        let len = match self.half.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(TransportError::ConnectionLost(e.to_string())),
        };
        if len == 0 || len as u64 > MAX_FRAME_LEN as u64 + TAG_SIZE as u64 {
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(
                len as u64,
            )));
        }

        let mut buf = vec![0u8; len as usize];
        match self.half.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(TransportError::ConnectionLost(e.to_string())),
        }

        let body = match &mut self.open {
            Some(key) => key.open(&buf)?,
            None => buf,
        };
        Ok(Message::decode_body(&body)?)
    }
}

/// Cloneable write half; every frame goes through one mutex.
#[derive(Clone)]
pub struct ConnectionSender {
    inner: Arc<Mutex<SendHalf>>,
}

struct SendHalf {
    half: OwnedWriteHalf,
    seal: Option<SealKey>,
}

impl ConnectionSender {
    /// Encode, seal, and write one frame.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let body = message.encode_body()?;
        let mut guard = self.inner.lock().await;
        let out = match &mut guard.seal {
            Some(key) => key.seal(&body)?,
            None => body,
        };
        guard
            .half
            .write_u32(out.len() as u32)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        guard
            .half
            .write_all(&out)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        Ok(())
    }

    /// Shut down the write side, unblocking the peer's read loop.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        let _ = guard.half.shutdown().await;
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same_channel(&self, other: &ConnectionSender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Connection {
    /// Dial `addr` and run the connector side of the handshake.
    pub async fn connect(addr: SocketAddr, record: &PairingRecord, secure: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::Connect)?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::connect_handshake(stream, record, secure))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?
    }

    async fn connect_handshake(
        stream: TcpStream,
        record: &PairingRecord,
        secure: bool,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        let (mut rd, mut wr) = stream.into_split();

        let nonce_c: [u8; 16] = rand::random();
        write_plain(
            &mut wr,
            &Message::Hello(HelloHeader {
                nonce: hex::encode(nonce_c),
                device_id: record.device_id.clone(),
                secure,
            }),
        )
        .await?;

        let challenge = match read_plain(&mut rd).await? {
            Message::Challenge(h) => h,
            other => {
                return Err(TransportError::Protocol(ProtocolError::Unexpected {
                    phase: "handshake",
                    got: other.name(),
                }))
            }
        };
        let nonce_s = parse_nonce(&challenge.nonce)?;
        let challenge_bytes = hex::decode(&challenge.challenge)
            .map_err(|_| AuthError::HandshakeFailed("bad challenge encoding".into()))?;

        let secret = record.shared_secret()?;
        let mac = if secure {
            hex::encode(handshake_mac(&secret, &challenge_bytes, &nonce_c, &nonce_s))
        } else {
            String::new()
        };
        write_plain(&mut wr, &Message::Response(ResponseHeader { mac })).await?;

        match read_plain(&mut rd).await? {
            Message::HandshakeOk => {}
            other => {
                return Err(TransportError::Auth(AuthError::HandshakeFailed(format!(
                    "peer refused with {}",
                    other.name()
                ))))
            }
        }

        debug!(peer = %peer_addr, secure, "handshake complete (connector)");
        Ok(Self::assemble(
            peer_addr,
            rd,
            wr,
            secure,
            &secret,
            &nonce_c,
            &nonce_s,
            Role::Connector,
        )?)
    }

    /// Run the acceptor side of the handshake on an incoming stream.
    pub async fn accept(stream: TcpStream, record: &PairingRecord, secure: bool) -> Result<Self> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::accept_handshake(stream, record, secure))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?
    }

    async fn accept_handshake(
        stream: TcpStream,
        record: &PairingRecord,
        secure: bool,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        let (mut rd, mut wr) = stream.into_split();

        let hello = match read_plain(&mut rd).await? {
            Message::Hello(h) => h,
            other => {
                return Err(TransportError::Protocol(ProtocolError::Unexpected {
                    phase: "handshake",
                    got: other.name(),
                }))
            }
        };
        if hello.device_id != record.peer_device_id {
            return Err(TransportError::Auth(AuthError::PeerMismatch {
                expected: record.peer_device_id.clone(),
                actual: hello.device_id,
            }));
        }
        if hello.secure != secure {
            return Err(TransportError::Auth(AuthError::HandshakeFailed(
                "security mode mismatch".into(),
            )));
        }
        let nonce_c = parse_nonce(&hello.nonce)?;

        let nonce_s: [u8; 16] = rand::random();
        let challenge_bytes: [u8; 32] = rand::random();
        write_plain(
            &mut wr,
            &Message::Challenge(ChallengeHeader {
                nonce: hex::encode(nonce_s),
                challenge: hex::encode(challenge_bytes),
            }),
        )
        .await?;

        let response = match read_plain(&mut rd).await? {
            Message::Response(h) => h,
            other => {
                return Err(TransportError::Protocol(ProtocolError::Unexpected {
                    phase: "handshake",
                    got: other.name(),
                }))
            }
        };

        let secret = record.shared_secret()?;
        if secure {
            let claimed = hex::decode(&response.mac)
                .map_err(|_| AuthError::HandshakeFailed("bad response encoding".into()))?;
            if !verify_handshake_mac(&secret, &challenge_bytes, &nonce_c, &nonce_s, &claimed) {
                return Err(TransportError::Auth(AuthError::HandshakeFailed(
                    "response MAC mismatch".into(),
                )));
            }
        }

        write_plain(&mut wr, &Message::HandshakeOk).await?;

        debug!(peer = %peer_addr, secure, "handshake complete (acceptor)");
        Ok(Self::assemble(
            peer_addr,
            rd,
            wr,
            secure,
            &secret,
            &nonce_c,
            &nonce_s,
            Role::Acceptor,
        )?)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        peer_addr: SocketAddr,
        rd: OwnedReadHalf,
        wr: OwnedWriteHalf,
        secure: bool,
        secret: &crate::auth::SharedSecret,
        nonce_c: &[u8; 16],
        nonce_s: &[u8; 16],
        role: Role,
    ) -> Result<Self> {
        let (seal, open) = if secure {
            let crypto = SessionCrypto::derive(secret, nonce_c, nonce_s, role)?;
            let (seal, open) = crypto.split();
            (Some(seal), Some(open))
        } else {
            (None, None)
        };
        Ok(Self {
            peer_addr,
            reader: ConnectionReader { half: rd, open },
            sender: ConnectionSender {
                inner: Arc::new(Mutex::new(SendHalf { half: wr, seal })),
            },
        })
    }
}

fn parse_nonce(encoded: &str) -> Result<[u8; 16]> {
    let raw = hex::decode(encoded)
        .map_err(|_| AuthError::HandshakeFailed("bad nonce encoding".into()))?;
    raw.try_into()
        .map_err(|_| AuthError::HandshakeFailed("nonce is not 16 bytes".into()).into())
}

/// Write a plaintext frame (handshake and pairing phases only).
pub(crate) async fn write_plain<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let body = message.encode_body()?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Read a plaintext frame (handshake and pairing phases only).
pub(crate) async fn read_plain<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(TransportError::ConnectionLost(e.to_string())),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(
            len as u64,
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
    Ok(Message::decode_body(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecret;
    use chrono::Utc;
    use tokio::net::TcpListener;

    fn record_pair() -> (PairingRecord, PairingRecord) {
        let secret = SharedSecret::new([9u8; 32]).to_base64();
        let a = PairingRecord {
            device_id: "aaaa".into(),
            device_name: "a".into(),
            peer_device_id: "bbbb".into(),
            peer_name: "b".into(),
            shared_secret_b64: secret.clone(),
            created_at: Utc::now(),
            last_seen: None,
        };
        let b = PairingRecord {
            device_id: "bbbb".into(),
            device_name: "b".into(),
            peer_device_id: "aaaa".into(),
            peer_name: "a".into(),
            shared_secret_b64: secret,
            created_at: Utc::now(),
            last_seen: None,
        };
        (a, b)
    }

    async fn connected_pair(secure: bool) -> (Connection, Connection) {
        let (a, b) = record_pair();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &a, secure).await
        });
        let client = Connection::connect(addr, &b, secure).await.unwrap();
        let server = server.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn sealed_messages_roundtrip_both_directions() {
        let (mut client, mut server) = connected_pair(true).await;

        client
            .sender
            .send(&Message::Text {
                content: "from client".into(),
            })
            .await
            .unwrap();
        match server.reader.next().await.unwrap() {
            Message::Text { content } => assert_eq!(content, "from client"),
            other => panic!("wrong message: {}", other.name()),
        }

        server
            .sender
            .send(&Message::Text {
                content: "from server".into(),
            })
            .await
            .unwrap();
        match client.reader.next().await.unwrap() {
            Message::Text { content } => assert_eq!(content, "from server"),
            other => panic!("wrong message: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn plaintext_mode_roundtrips() {
        let (client, mut server) = connected_pair(false).await;
        client.sender.send(&Message::Heartbeat).await.unwrap();
        assert_eq!(server.reader.next().await.unwrap(), Message::Heartbeat);
    }

    #[tokio::test]
    async fn wrong_secret_fails_handshake() {
        let (a, mut b) = record_pair();
        b.shared_secret_b64 = SharedSecret::new([1u8; 32]).to_base64();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &a, true).await
        });
        let client = Connection::connect(addr, &b, true).await;
        assert!(client.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn unknown_peer_identity_is_rejected() {
        let (a, mut b) = record_pair();
        b.device_id = "cccc".into();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &a, true).await
        });
        let _ = Connection::connect(addr, &b, true).await;
        match server.await.unwrap() {
            Err(TransportError::Auth(AuthError::PeerMismatch { actual, .. })) => {
                assert_eq!(actual, "cccc")
            }
            Err(e) => panic!("expected peer mismatch, got a different error: {e:?}"),
            Ok(_) => panic!("expected peer mismatch, got Ok"),
        }
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_closed() {
        let (client, mut server) = connected_pair(true).await;
        client.sender.close().await;
        drop(client);
        assert!(matches!(
            server.reader.next().await,
            Err(TransportError::Closed)
        ));
    }
}
