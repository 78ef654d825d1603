//! Session key derivation and AEAD framing primitives
//!
//! Every connection derives fresh AES-256-GCM keys, one per direction,
//! from the persistent shared secret and the nonces exchanged in the
//! handshake. Frame nonces are deterministic: a zero prefix followed by a
//! per-direction big-endian counter, incremented per frame and never
//! reused within a session.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use super::{AuthError, SharedSecret};

type HmacSha256 = Hmac<Sha256>;

/// AEAD key size in bytes.
pub const KEY_SIZE: usize = 32;
/// GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// Handshake nonce size in bytes.
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

const SESSION_INFO: &[u8] = b"yank/v1";
const PAIR_PIN_INFO: &[u8] = b"yank/pair-v1";
const PAIR_SECRET_INFO: &[u8] = b"yank/shared-v1";

/// Which side of the handshake this endpoint played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connector,
    Acceptor,
}

/// Sealing half of a session: key plus monotone send counter.
pub struct SealKey {
    cipher: Aes256Gcm,
    counter: u64,
}

impl SealKey {
    /// Seal one frame body. The counter advances exactly once per call.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let nonce = frame_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| AuthError::Crypto("send nonce counter exhausted".into()))?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AuthError::Crypto("AEAD seal failed".into()))
    }

    /// Frames sealed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Opening half of a session: key plus expected receive counter.
pub struct OpenKey {
    cipher: Aes256Gcm,
    counter: u64,
}

impl OpenKey {
    /// Open one frame body. Any failure is an authentication failure and
    /// must close the connection.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let nonce = frame_nonce(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| AuthError::Crypto("AEAD open failed".into()))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| AuthError::Crypto("recv nonce counter exhausted".into()))?;
        Ok(plaintext)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Per-connection key pair, derived identically by both endpoints.
pub struct SessionCrypto {
    send: SealKey,
    recv: OpenKey,
}

impl SessionCrypto {
    /// Derive both direction keys.
    ///
    /// `session_material = HKDF-SHA256(ikm = shared_secret,
    /// salt = nonce_c || nonce_s, info = "yank/v1")`, split into the
    /// client-to-server key followed by the server-to-client key.
    pub fn derive(
        secret: &SharedSecret,
        nonce_c: &[u8; HANDSHAKE_NONCE_SIZE],
        nonce_s: &[u8; HANDSHAKE_NONCE_SIZE],
        role: Role,
    ) -> Result<Self, AuthError> {
        let mut salt = [0u8; HANDSHAKE_NONCE_SIZE * 2];
        salt[..HANDSHAKE_NONCE_SIZE].copy_from_slice(nonce_c);
        salt[HANDSHAKE_NONCE_SIZE..].copy_from_slice(nonce_s);

        let hk = Hkdf::<Sha256>::new(Some(&salt), secret.as_bytes());
        let mut okm = [0u8; KEY_SIZE * 2];
        hk.expand(SESSION_INFO, &mut okm)
            .map_err(|_| AuthError::Crypto("session key expansion failed".into()))?;

        let (c2s, s2c) = okm.split_at(KEY_SIZE);
        let c2s = new_cipher(c2s)?;
        let s2c = new_cipher(s2c)?;

        let (send, recv) = match role {
            Role::Connector => (c2s, s2c),
            Role::Acceptor => (s2c, c2s),
        };

        Ok(Self {
            send: SealKey {
                cipher: send,
                counter: 0,
            },
            recv: OpenKey {
                cipher: recv,
                counter: 0,
            },
        })
    }

    /// Split into independently owned halves for the read and write sides.
    pub fn split(self) -> (SealKey, OpenKey) {
        (self.send, self.recv)
    }
}

fn new_cipher(key: &[u8]) -> Result<Aes256Gcm, AuthError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| AuthError::Crypto("bad AEAD key length".into()))
}

/// Frame nonce layout: `u32 zero || u64 counter_be`.
fn frame_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// MAC proving knowledge of the shared secret over the handshake
/// transcript: `HMAC(shared_secret, challenge || nonce_c || nonce_s)`.
pub fn handshake_mac(
    secret: &SharedSecret,
    challenge: &[u8],
    nonce_c: &[u8; HANDSHAKE_NONCE_SIZE],
    nonce_s: &[u8; HANDSHAKE_NONCE_SIZE],
) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.update(nonce_c);
    mac.update(nonce_s);
    mac.finalize().into_bytes().into()
}

/// Constant-time verification of a handshake MAC.
pub fn verify_handshake_mac(
    secret: &SharedSecret,
    challenge: &[u8],
    nonce_c: &[u8; HANDSHAKE_NONCE_SIZE],
    nonce_s: &[u8; HANDSHAKE_NONCE_SIZE],
    claimed: &[u8],
) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.update(nonce_c);
    mac.update(nonce_s);
    mac.verify_slice(claimed).is_ok()
}

/// Keyed MAC used inside the pairing exchange.
pub fn pairing_mac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time verification for [`pairing_mac`].
pub fn verify_pairing_mac(key: &[u8; 32], parts: &[&[u8]], claimed: &[u8]) -> bool {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(claimed).is_ok()
}

/// Derive the ephemeral PIN key used to authenticate the pairing exchange.
pub fn derive_pin_key(pin: &str, salt: &[u8]) -> Result<[u8; 32], AuthError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), pin.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(PAIR_PIN_INFO, &mut key)
        .map_err(|_| AuthError::Crypto("PIN key expansion failed".into()))?;
    Ok(key)
}

/// Derive the persistent shared secret from both parties' randoms,
/// bound to the PIN key so a passive observer without the PIN learns
/// nothing usable.
pub fn derive_shared_secret(
    pin_key: &[u8; 32],
    joiner_random: &[u8; 32],
    host_random: &[u8; 32],
) -> Result<SharedSecret, AuthError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(joiner_random);
    ikm[32..].copy_from_slice(host_random);

    let hk = Hkdf::<Sha256>::new(Some(pin_key), &ikm);
    let mut secret = [0u8; 32];
    hk.expand(PAIR_SECRET_INFO, &mut secret)
        .map_err(|_| AuthError::Crypto("shared secret expansion failed".into()))?;
    Ok(SharedSecret::new(secret))
}

/// Generate a 6-decimal-digit pairing PIN.
pub fn generate_pin() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::new([42u8; 32])
    }

    #[test]
    fn both_roles_derive_matching_keys() {
        let nonce_c = [1u8; 16];
        let nonce_s = [2u8; 16];
        let client =
            SessionCrypto::derive(&secret(), &nonce_c, &nonce_s, Role::Connector).unwrap();
        let server =
            SessionCrypto::derive(&secret(), &nonce_c, &nonce_s, Role::Acceptor).unwrap();

        let (mut c_send, _) = client.split();
        let (_, mut s_recv) = server.split();

        let sealed = c_send.seal(b"clipboard bytes").unwrap();
        let opened = s_recv.open(&sealed).unwrap();
        assert_eq!(opened, b"clipboard bytes");
    }

    #[test]
    fn seal_open_is_identity_in_order() {
        let crypto =
            SessionCrypto::derive(&secret(), &[3u8; 16], &[4u8; 16], Role::Connector).unwrap();
        let peer =
            SessionCrypto::derive(&secret(), &[3u8; 16], &[4u8; 16], Role::Acceptor).unwrap();
        let (mut send, _) = crypto.split();
        let (_, mut recv) = peer.split();

        for i in 0..20u32 {
            let frame = format!("frame {i}");
            let sealed = send.seal(frame.as_bytes()).unwrap();
            assert_eq!(recv.open(&sealed).unwrap(), frame.as_bytes());
        }
        assert_eq!(send.counter(), 20);
        assert_eq!(recv.counter(), 20);
    }

    #[test]
    fn nonces_are_distinct_and_monotone() {
        // N sealed frames must consume N distinct nonces; the counter is
        // the nonce, so monotonicity covers uniqueness.
        let crypto =
            SessionCrypto::derive(&secret(), &[5u8; 16], &[6u8; 16], Role::Connector).unwrap();
        let (mut send, _) = crypto.split();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let before = send.counter();
            send.seal(b"x").unwrap();
            assert_eq!(send.counter(), before + 1);
            assert!(seen.insert(before));
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let crypto =
            SessionCrypto::derive(&secret(), &[7u8; 16], &[8u8; 16], Role::Connector).unwrap();
        let peer =
            SessionCrypto::derive(&secret(), &[7u8; 16], &[8u8; 16], Role::Acceptor).unwrap();
        let (mut send, _) = crypto.split();
        let (_, mut recv) = peer.split();

        let mut sealed = send.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert!(recv.open(&sealed).is_err());
    }

    #[test]
    fn out_of_order_frame_fails_open() {
        let crypto =
            SessionCrypto::derive(&secret(), &[9u8; 16], &[10u8; 16], Role::Connector).unwrap();
        let peer =
            SessionCrypto::derive(&secret(), &[9u8; 16], &[10u8; 16], Role::Acceptor).unwrap();
        let (mut send, _) = crypto.split();
        let (_, mut recv) = peer.split();

        let _first = send.seal(b"one").unwrap();
        let second = send.seal(b"two").unwrap();
        // Receiver still expects counter 0.
        assert!(recv.open(&second).is_err());
    }

    #[test]
    fn fresh_nonces_change_session_keys() {
        let a = SessionCrypto::derive(&secret(), &[1u8; 16], &[2u8; 16], Role::Connector).unwrap();
        let b = SessionCrypto::derive(&secret(), &[1u8; 16], &[3u8; 16], Role::Acceptor).unwrap();
        let (mut send, _) = a.split();
        let (_, mut recv) = b.split();

        let sealed = send.seal(b"hello").unwrap();
        assert!(recv.open(&sealed).is_err());
    }

    #[test]
    fn handshake_mac_verifies_and_rejects() {
        let challenge = [0xabu8; 32];
        let nonce_c = [1u8; 16];
        let nonce_s = [2u8; 16];
        let mac = handshake_mac(&secret(), &challenge, &nonce_c, &nonce_s);

        assert!(verify_handshake_mac(
            &secret(),
            &challenge,
            &nonce_c,
            &nonce_s,
            &mac
        ));

        let other = SharedSecret::new([43u8; 32]);
        assert!(!verify_handshake_mac(
            &other, &challenge, &nonce_c, &nonce_s, &mac
        ));
        assert!(!verify_handshake_mac(
            &secret(),
            &[0u8; 32],
            &nonce_c,
            &nonce_s,
            &mac
        ));
    }

    #[test]
    fn pin_derivations_agree_across_sides() {
        let salt = [9u8; 16];
        let k1 = derive_pin_key("123456", &salt).unwrap();
        let k2 = derive_pin_key("123456", &salt).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, derive_pin_key("123457", &salt).unwrap());

        let s1 = derive_shared_secret(&k1, &[1u8; 32], &[2u8; 32]).unwrap();
        let s2 = derive_shared_secret(&k2, &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn generated_pins_are_six_digits() {
        for _ in 0..50 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
