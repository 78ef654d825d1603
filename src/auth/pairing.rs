//! PIN-bootstrapped device pairing
//!
//! One device hosts (`yank pair`): it prints a 6-digit PIN and waits on
//! the service port. The other joins (`yank join <ip> <pin>`). Three
//! messages authenticate both directions under a key derived from the
//! PIN, after which both sides derive and persist the same 32-byte
//! shared secret. A wrong PIN is rejected before anything is written.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::session::{
    derive_pin_key, derive_shared_secret, generate_pin, pairing_mac, verify_pairing_mac,
};
use super::{local_device_name, new_device_id, AuthError, PairingRecord, PairingStore};
use crate::transport::connection::{read_plain, write_plain};
use crate::transport::frame::{
    Message, PairConfirmHeader, PairRejectHeader, PairRequestHeader, PairResponseHeader,
};

const REQ_CONTEXT: &[u8] = b"yank/pair-req";
const RESP_CONTEXT: &[u8] = b"yank/pair-resp";
const CONFIRM_CONTEXT: &[u8] = b"yank/pair-confirm";

/// Default window a pairing host waits for a joiner.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(120);

/// Host side of the pairing exchange.
pub struct PairingHost {
    listener: TcpListener,
    pin: String,
}

impl PairingHost {
    /// Bind the service port and generate a PIN.
    pub async fn start(port: u16) -> Result<Self, AuthError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            listener,
            pin: generate_pin(),
        })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for one joiner, run the exchange, and persist the pairing.
    pub async fn wait_for_joiner(
        &self,
        store: &PairingStore,
        timeout: Duration,
    ) -> Result<PairingRecord, AuthError> {
        let (stream, addr) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| AuthError::PairingFailed("timed out waiting for a device".into()))??;
        info!(peer = %addr, "pairing connection received");
        self.exchange(stream, store).await
    }

    async fn exchange(
        &self,
        stream: TcpStream,
        store: &PairingStore,
    ) -> Result<PairingRecord, AuthError> {
        let (mut rd, mut wr) = stream.into_split();

        let request = match read_plain(&mut rd).await.map_err(pairing_io)? {
            Message::PairRequest(h) => h,
            other => {
                return Err(AuthError::PairingFailed(format!(
                    "unexpected {} during pairing",
                    other.name()
                )))
            }
        };

        let salt = hex::decode(&request.salt)
            .map_err(|_| AuthError::PairingFailed("bad salt encoding".into()))?;
        let joiner_random: [u8; 32] = hex::decode(&request.random)
            .map_err(|_| AuthError::PairingFailed("bad random encoding".into()))?
            .try_into()
            .map_err(|_| AuthError::PairingFailed("random is not 32 bytes".into()))?;
        let claimed = hex::decode(&request.mac)
            .map_err(|_| AuthError::PairingFailed("bad MAC encoding".into()))?;

        let pin_key = derive_pin_key(&self.pin, &salt)?;
        let authentic = verify_pairing_mac(
            &pin_key,
            &[REQ_CONTEXT, request.device_id.as_bytes(), &joiner_random],
            &claimed,
        );
        if !authentic {
            warn!("pairing rejected: wrong PIN");
            let reject = Message::PairReject(PairRejectHeader {
                reason: "invalid PIN".into(),
            });
            let _ = write_plain(&mut wr, &reject).await;
            return Err(AuthError::PairingFailed("joiner presented a wrong PIN".into()));
        }

        let device_id = new_device_id();
        let device_name = local_device_name();
        let host_random: [u8; 32] = rand::random();
        let mac = pairing_mac(
            &pin_key,
            &[
                RESP_CONTEXT,
                device_id.as_bytes(),
                &host_random,
                &joiner_random,
            ],
        );
        write_plain(
            &mut wr,
            &Message::PairResponse(PairResponseHeader {
                device_id: device_id.clone(),
                device_name: device_name.clone(),
                random: hex::encode(host_random),
                mac: hex::encode(mac),
            }),
        )
        .await
        .map_err(pairing_io)?;

        let secret = derive_shared_secret(&pin_key, &joiner_random, &host_random)?;

        let confirm = match read_plain(&mut rd).await.map_err(pairing_io)? {
            Message::PairConfirm(h) => h,
            Message::PairReject(h) => {
                return Err(AuthError::PairingFailed(format!(
                    "joiner rejected pairing: {}",
                    h.reason
                )))
            }
            other => {
                return Err(AuthError::PairingFailed(format!(
                    "unexpected {} during pairing",
                    other.name()
                )))
            }
        };
        let claimed = hex::decode(&confirm.mac)
            .map_err(|_| AuthError::PairingFailed("bad MAC encoding".into()))?;
        if !verify_pairing_mac(secret.as_bytes(), &[CONFIRM_CONTEXT], &claimed) {
            return Err(AuthError::PairingFailed(
                "joiner confirmation failed verification".into(),
            ));
        }

        let record = PairingRecord {
            device_id,
            device_name,
            peer_device_id: request.device_id,
            peer_name: request.device_name,
            shared_secret_b64: secret.to_base64(),
            created_at: chrono::Utc::now(),
            last_seen: None,
        };
        store.save(&record)?;
        info!(peer = %record.peer_name, "paired successfully");
        Ok(record)
    }
}

/// Join a host that is in pairing mode, entering its PIN.
pub async fn join_with_pin(
    store: &PairingStore,
    host: &str,
    port: u16,
    pin: &str,
    timeout: Duration,
) -> Result<PairingRecord, AuthError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| AuthError::PairingFailed("connection timed out".into()))?
        .map_err(|e| AuthError::PairingFailed(format!("could not connect to {host}:{port}: {e}")))?;
    let (mut rd, mut wr) = stream.into_split();

    let salt: [u8; 16] = rand::random();
    let joiner_random: [u8; 32] = rand::random();
    let pin_key = derive_pin_key(pin, &salt)?;

    let device_id = new_device_id();
    let device_name = local_device_name();
    let mac = pairing_mac(&pin_key, &[REQ_CONTEXT, device_id.as_bytes(), &joiner_random]);
    write_plain(
        &mut wr,
        &Message::PairRequest(PairRequestHeader {
            device_id: device_id.clone(),
            device_name: device_name.clone(),
            salt: hex::encode(salt),
            random: hex::encode(joiner_random),
            mac: hex::encode(mac),
        }),
    )
    .await
    .map_err(pairing_io)?;

    let response = match read_plain(&mut rd).await.map_err(pairing_io)? {
        Message::PairResponse(h) => h,
        Message::PairReject(h) => {
            return Err(AuthError::PairingFailed(format!(
                "host rejected pairing: {}",
                h.reason
            )))
        }
        other => {
            return Err(AuthError::PairingFailed(format!(
                "unexpected {} during pairing",
                other.name()
            )))
        }
    };

    let host_random: [u8; 32] = hex::decode(&response.random)
        .map_err(|_| AuthError::PairingFailed("bad random encoding".into()))?
        .try_into()
        .map_err(|_| AuthError::PairingFailed("random is not 32 bytes".into()))?;
    let claimed = hex::decode(&response.mac)
        .map_err(|_| AuthError::PairingFailed("bad MAC encoding".into()))?;
    let authentic = verify_pairing_mac(
        &pin_key,
        &[
            RESP_CONTEXT,
            response.device_id.as_bytes(),
            &host_random,
            &joiner_random,
        ],
        &claimed,
    );
    if !authentic {
        return Err(AuthError::PairingFailed(
            "host response failed verification (wrong PIN?)".into(),
        ));
    }

    let secret = derive_shared_secret(&pin_key, &joiner_random, &host_random)?;
    let mac = pairing_mac(secret.as_bytes(), &[CONFIRM_CONTEXT]);
    write_plain(
        &mut wr,
        &Message::PairConfirm(PairConfirmHeader {
            mac: hex::encode(mac),
        }),
    )
    .await
    .map_err(pairing_io)?;

    let record = PairingRecord {
        device_id,
        device_name,
        peer_device_id: response.device_id,
        peer_name: response.device_name,
        shared_secret_b64: secret.to_base64(),
        created_at: chrono::Utc::now(),
        last_seen: None,
    };
    store.save(&record)?;
    info!(peer = %record.peer_name, "paired successfully");
    Ok(record)
}

fn pairing_io(err: crate::transport::TransportError) -> AuthError {
    AuthError::PairingFailed(err.to_string())
}
