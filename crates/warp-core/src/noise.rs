//! WireGuard handshake initiation
//!
//! Implements the initiator's first message of the Noise_IKpsk2 pattern
//! (X25519, ChaCha20-Poly1305, BLAKE2s) and recognition of the
//! responder's reply. That is all the scanner and the bundled builder
//! need: a peer that answers a valid initiation is reachable, and the
//! time until it answers is the round trip.
//!
//! # Message layout (148 bytes)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | type = 1 |
//! | 1 | 3 | reserved (WARP client id bytes) |
//! | 4 | 4 | sender index, LE |
//! | 8 | 32 | ephemeral public key |
//! | 40 | 48 | encrypted static key |
//! | 88 | 28 | encrypted TAI64N timestamp |
//! | 116 | 16 | mac1 |
//! | 132 | 16 | mac2 (zero, no cookie) |

use crate::keys::{KeyPair, PrivateKey, PublicKey};
use blake2::digest::consts::U16;
use blake2::digest::{KeyInit, Mac};
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::SimpleHmac;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::trace;

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
const LABEL_MAC1: &[u8] = b"mac1----";

/// TAI64 label of the unix epoch (2^62 + 10 leap seconds)
const TAI64_EPOCH: u64 = 0x4000_0000_0000_000a;

const MSG_INITIATION: u8 = 1;
const MSG_RESPONSE: u8 = 2;

pub const INITIATION_LEN: usize = 148;
pub const RESPONSE_LEN: usize = 92;

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake encryption failed")]
    Encrypt,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A built initiation and the sender index it carries
#[derive(Clone)]
pub struct Initiation {
    pub bytes: [u8; INITIATION_LEN],
    pub sender_index: u32,
}

/// Indices from a handshake response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Index the responder chose for itself
    pub sender_index: u32,
    /// Echo of our sender index
    pub receiver_index: u32,
}

impl HandshakeResponse {
    /// Recognize a handshake response datagram
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != RESPONSE_LEN || buf[0] != MSG_RESPONSE {
            return None;
        }

        Some(Self {
            sender_index: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            receiver_index: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Build a handshake initiation from `local` to `peer`
pub fn build_initiation(
    local: &KeyPair,
    peer: &PublicKey,
    reserved: [u8; 3],
    sender_index: u32,
    now: SystemTime,
) -> Result<Initiation, HandshakeError> {
    let mut msg = [0u8; INITIATION_LEN];
    msg[0] = MSG_INITIATION;
    msg[1..4].copy_from_slice(&reserved);
    msg[4..8].copy_from_slice(&sender_index.to_le_bytes());

    let chain = hash(&[CONSTRUCTION]);
    let mut h = hash(&[&chain, IDENTIFIER]);
    h = hash(&[&h, peer.as_bytes()]);

    // e
    let ephemeral = PrivateKey::generate();
    let ephemeral_pub = ephemeral.public_key();
    let chain = kdf1(&chain, ephemeral_pub.as_bytes());
    msg[8..40].copy_from_slice(ephemeral_pub.as_bytes());
    h = hash(&[&h, ephemeral_pub.as_bytes()]);

    // es, s
    let (chain, key) = kdf2(&chain, &ephemeral.diffie_hellman(peer));
    let sealed_static = seal(&key, local.public.as_bytes(), &h)?;
    msg[40..88].copy_from_slice(&sealed_static);
    h = hash(&[&h, &sealed_static]);

    // ss, timestamp
    let (_, key) = kdf2(&chain, &local.private.diffie_hellman(peer));
    let sealed_time = seal(&key, &tai64n(now), &h)?;
    msg[88..116].copy_from_slice(&sealed_time);

    let mac1 = mac(&hash(&[LABEL_MAC1, peer.as_bytes()]), &msg[..116]);
    msg[116..132].copy_from_slice(&mac1);

    Ok(Initiation { bytes: msg, sender_index })
}

/// Check mac1 of an initiation addressed to `peer`
pub fn verify_mac1(msg: &[u8], peer: &PublicKey) -> bool {
    msg.len() == INITIATION_LEN
        && mac(&hash(&[LABEL_MAC1, peer.as_bytes()]), &msg[..116]) == msg[116..132]
}

/// UDP socket bound to the wildcard address of `peer`'s family, connected to `peer`
pub async fn connect_udp(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

/// Send one initiation on a connected socket and wait for its response
///
/// Unrelated datagrams are skipped. No timeout is applied here; callers
/// bound the exchange themselves.
pub async fn exchange(
    socket: &UdpSocket,
    local: &KeyPair,
    peer: &PublicKey,
    reserved: [u8; 3],
) -> Result<(HandshakeResponse, Duration), HandshakeError> {
    let initiation = build_initiation(local, peer, reserved, rand::random(), SystemTime::now())?;

    let start = Instant::now();
    socket.send(&initiation.bytes).await?;

    let mut buf = [0u8; 256];
    loop {
        let n = socket.recv(&mut buf).await?;
        match HandshakeResponse::parse(&buf[..n]) {
            Some(response) if response.receiver_index == initiation.sender_index => {
                return Ok((response, start.elapsed()));
            }
            _ => trace!("Ignoring {} byte datagram while waiting for handshake", n),
        }
    }
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn hmac(key: &[u8], input: &[u8]) -> [u8; 32] {
    let mut mac = <SimpleHmac<Blake2s256> as KeyInit>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(input);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn mac(key: &[u8; 32], input: &[u8]) -> [u8; 16] {
    let mut mac = <Blake2sMac<U16> as KeyInit>::new_from_slice(key)
        .expect("BLAKE2s accepts 32-byte keys");
    mac.update(input);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn kdf1(chain: &[u8; 32], input: &[u8]) -> [u8; 32] {
    let prk = hmac(chain, input);
    hmac(&prk, &[0x1])
}

fn kdf2(chain: &[u8; 32], input: &[u8]) -> ([u8; 32], [u8; 32]) {
    let prk = hmac(chain, input);
    let t1 = hmac(&prk, &[0x1]);
    let mut t1_2 = [0u8; 33];
    t1_2[..32].copy_from_slice(&t1);
    t1_2[32] = 0x2;
    (t1, hmac(&prk, &t1_2))
}

/// ChaCha20-Poly1305 with a zero counter, as every handshake field uses
fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let cipher = <ChaCha20Poly1305 as KeyInit>::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: plaintext, aad })
        .map_err(|_| HandshakeError::Encrypt)
}

fn tai64n(now: SystemTime) -> [u8; 12] {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&(TAI64_EPOCH + since_epoch.as_secs()).to_be_bytes());
    out[8..].copy_from_slice(&since_epoch.subsec_nanos().to_be_bytes());
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Loopback peer that answers every initiation it receives
    pub(crate) async fn spawn_responder() -> SocketAddr {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((n, from)) = responder.recv_from(&mut buf).await {
                if n != INITIATION_LEN || buf[0] != MSG_INITIATION {
                    continue;
                }
                let mut reply = [0u8; RESPONSE_LEN];
                reply[0] = MSG_RESPONSE;
                reply[4..8].copy_from_slice(&1u32.to_le_bytes());
                reply[8..12].copy_from_slice(&buf[4..8]);
                let _ = responder.send_to(&reply, from).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_udp_exchange() {
        let peer = spawn_responder().await;
        let socket = connect_udp(peer).await.unwrap();

        assert_eq!(socket.peer_addr().unwrap(), peer);
        assert!(socket.local_addr().unwrap().is_ipv4());

        let local = KeyPair::generate();
        let remote = KeyPair::generate();
        let (response, _) = exchange(&socket, &local, &remote.public, [0; 3]).await.unwrap();
        assert_eq!(response.sender_index, 1);
    }

    fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        let cipher = <ChaCha20Poly1305 as KeyInit>::new(Key::from_slice(key));
        cipher.decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: sealed, aad }).ok()
    }

    #[test]
    fn test_initiation_layout() {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();

        let init = build_initiation(&local, &peer.public, [1, 2, 3], 0xdead_beef, SystemTime::now())
            .unwrap();

        assert_eq!(init.bytes.len(), INITIATION_LEN);
        assert_eq!(init.bytes[0], MSG_INITIATION);
        assert_eq!(&init.bytes[1..4], &[1, 2, 3]);
        assert_eq!(&init.bytes[4..8], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(&init.bytes[132..], &[0u8; 16]);
        assert!(verify_mac1(&init.bytes, &peer.public));
        assert!(!verify_mac1(&init.bytes, &local.public));
    }

    #[test]
    fn test_responder_recovers_static_key() {
        let local = KeyPair::generate();
        let responder = KeyPair::generate();
        let init = build_initiation(&local, &responder.public, [0; 3], 1, SystemTime::now())
            .unwrap();
        let msg = &init.bytes;

        // Replay the responder's side of the first message
        let chain = hash(&[CONSTRUCTION]);
        let mut h = hash(&[&chain, IDENTIFIER]);
        h = hash(&[&h, responder.public.as_bytes()]);

        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&msg[8..40]);
        let ephemeral = PublicKey::from_bytes(ephemeral);
        let chain = kdf1(&chain, ephemeral.as_bytes());
        h = hash(&[&h, ephemeral.as_bytes()]);

        let (_, key) = kdf2(&chain, &responder.private.diffie_hellman(&ephemeral));
        let static_key = open(&key, &msg[40..88], &h).expect("static key decrypts");

        assert_eq!(static_key, local.public.as_bytes().to_vec());
    }

    #[test]
    fn test_tai64n_is_monotonic() {
        let earlier = tai64n(UNIX_EPOCH + Duration::from_secs(1_000));
        let later = tai64n(UNIX_EPOCH + Duration::from_secs(1_001));
        assert!(later > earlier);
        assert_eq!(&earlier[..8], &(TAI64_EPOCH + 1_000).to_be_bytes());
    }

    #[test]
    fn test_response_parse() {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0] = MSG_RESPONSE;
        buf[4..8].copy_from_slice(&7u32.to_le_bytes());
        buf[8..12].copy_from_slice(&42u32.to_le_bytes());

        assert_eq!(
            HandshakeResponse::parse(&buf),
            Some(HandshakeResponse { sender_index: 7, receiver_index: 42 })
        );
        assert!(HandshakeResponse::parse(&buf[..60]).is_none());

        buf[0] = MSG_INITIATION;
        assert!(HandshakeResponse::parse(&buf).is_none());
    }

    #[tokio::test]
    async fn test_exchange_with_fake_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, INITIATION_LEN);

            // Junk first, then a response echoing the sender index
            responder.send_to(b"noise", from).await.unwrap();
            let mut reply = [0u8; RESPONSE_LEN];
            reply[0] = MSG_RESPONSE;
            reply[4..8].copy_from_slice(&99u32.to_le_bytes());
            reply[8..12].copy_from_slice(&buf[4..8]);
            responder.send_to(&reply, from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(responder_addr).await.unwrap();

        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let (response, rtt) = tokio::time::timeout(
            Duration::from_secs(5),
            exchange(&socket, &local, &peer.public, [0; 3]),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.sender_index, 99);
        assert!(rtt < Duration::from_secs(5));
    }
}
