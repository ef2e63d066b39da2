//! Double ratchet with one chain per direction.
//!
//! Every message is sealed with a fresh key taken from a KDF chain, and the
//! chain key moves forward after each use, so a captured chain key cannot
//! decrypt anything sent before it. Once a sending chain has produced
//! `threshold` messages the sender rotates: it generates a fresh X25519 key,
//! mixes its DH with the peer's session key into that direction's root, and
//! starts a new chain. The receiver notices the new key in the header and
//! performs the matching step.
//!
//! ```text
//! header = [32 bytes: sender ratchet key] [8 bytes: pn] [8 bytes: n]
//! ```
//!
//! `pn` is the length of the sender's previous chain and `n` the index of
//! the message in the current one. Keys for messages that arrive late are
//! kept in a small cache so moderate reordering is tolerated.

use std::collections::VecDeque;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::exchange::diffie_hellman;
use crate::sealer::Sealer;
use crate::CryptoError;

/// Messages per sending chain before a rotation.
pub const DEFAULT_THRESHOLD: u64 = 64;
/// Largest number of message keys held for late messages.
pub const MAX_SKIP: u64 = 64;

const LABEL_ROOT: &[u8] = b"kestrel/ratchet/root";
const LABEL_CHAIN: &[u8] = b"kestrel/ratchet/chain";
const LABEL_MESSAGE: &[u8] = b"kestrel/ratchet/message";
const LABEL_LOW_TO_HIGH: &[u8] = b"kestrel/ratchet/low-to-high";
const LABEL_HIGH_TO_LOW: &[u8] = b"kestrel/ratchet/high-to-low";

type Key = [u8; 32];

/// Per-message ratchet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub dh: Key,
    pub pn: u64,
    pub n: u64,
}

impl Header {
    pub const SIZE: usize = 48;

    /// Encoded header, bound into each message as associated data.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..32].copy_from_slice(&self.dh);
        out[32..40].copy_from_slice(&self.pn.to_be_bytes());
        out[40..].copy_from_slice(&self.n.to_be_bytes());
        out
    }
}

fn labelled(label: &[u8], session_id: &str) -> Vec<u8> {
    let mut info = Vec::with_capacity(label.len() + session_id.len());
    info.extend_from_slice(label);
    info.extend_from_slice(session_id.as_bytes());
    info
}

fn split_pair(okm: &[u8; 64]) -> (Zeroizing<Key>, Zeroizing<Key>) {
    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    (first, second)
}

/// Mix `ikm` into `salt`, producing a (root, chain) pair.
fn kdf_pair(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<(Zeroizing<Key>, Zeroizing<Key>), CryptoError> {
    let mut okm = Zeroizing::new([0u8; 64]);
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm[..])
        .map_err(|_| CryptoError::Kdf)?;
    Ok(split_pair(&okm))
}

fn kdf_root(
    root: &Key,
    dh: &Key,
    session_id: &str,
) -> Result<(Zeroizing<Key>, Zeroizing<Key>), CryptoError> {
    kdf_pair(root, dh, &labelled(LABEL_ROOT, session_id))
}

/// Advance a chain: (next chain key, message key).
fn kdf_chain(chain: &Key) -> Result<(Zeroizing<Key>, Zeroizing<Key>), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain);
    let mut next = Zeroizing::new([0u8; 32]);
    let mut message = Zeroizing::new([0u8; 32]);
    hk.expand(LABEL_CHAIN, &mut next[..])
        .map_err(|_| CryptoError::Kdf)?;
    hk.expand(LABEL_MESSAGE, &mut message[..])
        .map_err(|_| CryptoError::Kdf)?;
    Ok((next, message))
}

fn seal_message(key: &Key, plaintext: &[u8], header: &Header) -> Result<Vec<u8>, CryptoError> {
    Sealer::new(key, None, LABEL_MESSAGE)?.seal(plaintext, &header.to_bytes())
}

fn open_message(key: &Key, ciphertext: &[u8], header: &Header) -> Result<Vec<u8>, CryptoError> {
    Sealer::new(key, None, LABEL_MESSAGE)?.open(ciphertext, &header.to_bytes())
}

fn public_of(secret: &StaticSecret) -> Key {
    X25519Public::from(secret).to_bytes()
}

/// Sending half of a ratchet.
#[derive(Clone)]
pub struct SendChain {
    session_id: String,
    threshold: u64,
    root: Zeroizing<Key>,
    chain: Zeroizing<Key>,
    key: StaticSecret,
    remote: Key,
    count: u64,
    previous: u64,
    force_rotation: bool,
}

impl SendChain {
    /// Seal `plaintext` with the next message key, rotating first if due.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, Vec<u8>), CryptoError> {
        if self.force_rotation || self.count >= self.threshold {
            self.rotate()?;
        }

        let (next, message_key) = kdf_chain(&self.chain)?;
        let header = Header {
            dh: public_of(&self.key),
            pn: self.previous,
            n: self.count,
        };
        let ciphertext = seal_message(&message_key, plaintext, &header)?;

        self.chain = next;
        self.count += 1;
        Ok((header, ciphertext))
    }

    fn rotate(&mut self) -> Result<(), CryptoError> {
        let fresh = StaticSecret::random_from_rng(OsRng);
        let dh = diffie_hellman(&fresh, &self.remote)?;
        let (root, chain) = kdf_root(&self.root, &dh, &self.session_id)?;

        self.root = root;
        self.chain = chain;
        self.key = fresh;
        self.previous = self.count;
        self.count = 0;
        self.force_rotation = false;
        Ok(())
    }

    /// Current sending ratchet public key.
    pub fn public_key(&self) -> Key {
        public_of(&self.key)
    }

    /// Messages sent on the current chain.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Key for a message that has not arrived yet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SkippedKey {
    dh: Key,
    n: u64,
    key: Key,
}

/// Receiving half of a ratchet.
#[derive(Clone)]
pub struct RecvChain {
    session_id: String,
    root: Zeroizing<Key>,
    chain: Zeroizing<Key>,
    local: StaticSecret,
    remote: Key,
    count: u64,
    skipped: VecDeque<SkippedKey>,
}

impl RecvChain {
    /// Open a message. State only changes if the message authenticates.
    pub fn decrypt(&mut self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.dh == header.dh && s.n == header.n)
        {
            let plaintext = open_message(&self.skipped[pos].key, ciphertext, header)?;
            self.skipped.remove(pos);
            return Ok(plaintext);
        }

        let mut next = self.clone();
        if header.dh != next.remote {
            next.skip_until(header.pn)?;
            let dh = diffie_hellman(&next.local, &header.dh)?;
            let (root, chain) = kdf_root(&next.root, &dh, &next.session_id)?;
            next.root = root;
            next.chain = chain;
            next.remote = header.dh;
            next.count = 0;
        }

        if header.n < next.count {
            return Err(CryptoError::StaleMessage(header.n));
        }
        next.skip_until(header.n)?;

        let (chain, message_key) = kdf_chain(&next.chain)?;
        let plaintext = open_message(&message_key, ciphertext, header)?;
        next.chain = chain;
        next.count += 1;

        *self = next;
        Ok(plaintext)
    }

    fn skip_until(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.count {
            return Ok(());
        }
        let gap = until - self.count;
        if gap > MAX_SKIP {
            return Err(CryptoError::TooManySkipped(gap));
        }

        while self.count < until {
            let (chain, key) = kdf_chain(&self.chain)?;
            self.skipped.push_back(SkippedKey {
                dh: self.remote,
                n: self.count,
                key: *key,
            });
            if self.skipped.len() > MAX_SKIP as usize {
                self.skipped.pop_front();
            }
            self.chain = chain;
            self.count += 1;
        }
        Ok(())
    }

    /// Messages received on the current chain.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Keys held for messages that have not arrived.
    pub fn pending_skipped(&self) -> usize {
        self.skipped.len()
    }
}

/// Both halves of a session's ratchet.
pub struct Ratchet {
    send: SendChain,
    recv: RecvChain,
}

impl Ratchet {
    /// Initialize from the handshake secret and both session ratchet keys.
    ///
    /// The side whose public key sorts lower sends on the "low-to-high"
    /// chain, so both peers derive matching chains without a role flag.
    pub fn new(
        secret: &[u8],
        local: StaticSecret,
        remote: Key,
        session_id: &str,
        threshold: u64,
    ) -> Result<Self, CryptoError> {
        let local_public = public_of(&local);
        if local_public == remote {
            return Err(CryptoError::InvalidKey(
                "peer reflected our ratchet key".into(),
            ));
        }

        let dh = diffie_hellman(&local, &remote)?;
        let up = kdf_pair(secret, &*dh, &labelled(LABEL_LOW_TO_HIGH, session_id))?;
        let down = kdf_pair(secret, &*dh, &labelled(LABEL_HIGH_TO_LOW, session_id))?;
        let ((send_root, send_chain), (recv_root, recv_chain)) = if local_public < remote {
            (up, down)
        } else {
            (down, up)
        };

        Ok(Self {
            send: SendChain {
                session_id: session_id.to_string(),
                threshold: threshold.max(1),
                root: send_root,
                chain: send_chain,
                key: local.clone(),
                remote,
                count: 0,
                previous: 0,
                force_rotation: false,
            },
            recv: RecvChain {
                session_id: session_id.to_string(),
                root: recv_root,
                chain: recv_chain,
                local,
                remote,
                count: 0,
                skipped: VecDeque::new(),
            },
        })
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, Vec<u8>), CryptoError> {
        self.send.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.recv.decrypt(header, ciphertext)
    }

    /// Separate the halves so each direction can be driven independently.
    pub fn split(self) -> (SendChain, RecvChain) {
        (self.send, self.recv)
    }

    pub fn from_parts(send: SendChain, recv: RecvChain) -> Self {
        Self { send, recv }
    }

    pub fn save(&self) -> RatchetState {
        RatchetState::capture(&self.send, &self.recv)
    }

    /// Rebuild a ratchet from saved state.
    ///
    /// The first message sent afterwards always starts a new chain.
    pub fn restore(state: &RatchetState) -> Result<Self, CryptoError> {
        let (send, recv) = state.restore()?;
        Ok(Self { send, recv })
    }
}

/// Serializable snapshot of a ratchet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    pub session_id: String,
    pub threshold: u64,
    pub send_root: Key,
    pub send_chain: Key,
    pub send_key: Key,
    pub send_remote: Key,
    pub send_count: u64,
    pub send_previous: u64,
    pub recv_root: Key,
    pub recv_chain: Key,
    pub recv_local: Key,
    pub recv_remote: Key,
    pub recv_count: u64,
    pub skipped: Vec<SkippedKey>,
}

impl RatchetState {
    pub fn capture(send: &SendChain, recv: &RecvChain) -> Self {
        Self {
            session_id: send.session_id.clone(),
            threshold: send.threshold,
            send_root: *send.root,
            send_chain: *send.chain,
            send_key: send.key.to_bytes(),
            send_remote: send.remote,
            send_count: send.count,
            send_previous: send.previous,
            recv_root: *recv.root,
            recv_chain: *recv.chain,
            recv_local: recv.local.to_bytes(),
            recv_remote: recv.remote,
            recv_count: recv.count,
            skipped: recv.skipped.iter().cloned().collect(),
        }
    }

    pub fn restore(&self) -> Result<(SendChain, RecvChain), CryptoError> {
        if self.session_id.is_empty() {
            return Err(CryptoError::InvalidState("missing session id".into()));
        }
        if self.skipped.len() > MAX_SKIP as usize {
            return Err(CryptoError::InvalidState("too many skipped keys".into()));
        }

        let send = SendChain {
            session_id: self.session_id.clone(),
            threshold: self.threshold.max(1),
            root: Zeroizing::new(self.send_root),
            chain: Zeroizing::new(self.send_chain),
            key: StaticSecret::from(self.send_key),
            remote: self.send_remote,
            count: self.send_count,
            previous: self.send_previous,
            force_rotation: true,
        };
        let recv = RecvChain {
            session_id: self.session_id.clone(),
            root: Zeroizing::new(self.recv_root),
            chain: Zeroizing::new(self.recv_chain),
            local: StaticSecret::from(self.recv_local),
            remote: self.recv_remote,
            count: self.recv_count,
            skipped: self.skipped.iter().cloned().collect(),
        };
        Ok((send, recv))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|e| CryptoError::InvalidState(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes).map_err(|e| CryptoError::InvalidState(e.to_string()))
    }
}
