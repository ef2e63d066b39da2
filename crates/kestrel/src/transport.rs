//! The established, ratchet-encrypted channel.
//!
//! # Wire format
//!
//! ```text
//! frame = RatchetFrame { dh, pn, n, seal(Envelope) }
//! Envelope = { Payload, signature, padding, route, metadata }
//! ```
//!
//! Each outgoing message is signed into an envelope, then the encoded
//! envelope is sealed with the next ratchet message key. The receiver opens
//! the frame, checks the envelope signature against the peer's identity key
//! and then the sequence number against a replay window.
//!
//! # Concurrency
//!
//! Sending and receiving each sit behind their own lock, so one task may
//! send while another receives. Where both are needed they are taken
//! receive-then-send, so a caller waiting on a pending read never holds up a
//! send. Sequence counters are atomics written under their half's lock and
//! read without it. `close` first raises a signal that wakes a pending
//! `receive`, so it never waits behind a blocked read.
//!
//! # Write timeouts
//!
//! A message is committed once it is encrypted: its frame is queued on the
//! writer and its sequence number is spent. If the write then times out the
//! frame stays queued and goes out ahead of the next send. Retrying a timed
//! out send means calling [`Transport::flush`], not sending again.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kestrel_common::{Error, Result};
use kestrel_core::{
    decode_msg, Envelope, Metadata, Payload, RatchetFrame, Route, SessionPhase, MAX_FRAME_SIZE,
    MESSAGE_PADDING,
};
use kestrel_crypto::ratchet::Header;
use kestrel_crypto::{
    Algorithm, CryptoError, Identity, PublicKey, RatchetState, RecvChain, ReplayWindow, SendChain,
};
use prost::Message;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{Timeouts, TransportKind};
use crate::conn::{with_deadline, Connection, FrameReader, FrameWriter};
use crate::envelope;
use crate::session::{blocking, SessionManager, SessionState};

/// Frame bytes spent on everything but the payload and the signature.
const FRAME_OVERHEAD: usize = 448;

/// Largest application payload an identity of `algorithm` can send.
pub const fn max_message_size(algorithm: Algorithm) -> usize {
    MAX_FRAME_SIZE - FRAME_OVERHEAD - algorithm.signature_len()
}

/// Largest application payload accepted by [`Transport::send`] for Ed25519
/// identities.
pub const MAX_MESSAGE_SIZE: usize = max_message_size(Algorithm::Ed25519);

/// Details of a sent or received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub route: Route,
}

impl MessageMetadata {
    fn from_wire(metadata: &Metadata, route: Route) -> Self {
        Self {
            id: metadata.id.clone(),
            timestamp: Utc
                .timestamp_micros(metadata.timestamp)
                .single()
                .unwrap_or_default(),
            sequence: metadata.sequence,
            route,
        }
    }
}

struct SendHalf {
    writer: Option<FrameWriter>,
    chain: Option<SendChain>,
}

struct RecvHalf {
    reader: Option<FrameReader>,
    chain: Option<RecvChain>,
    window: ReplayWindow,
}

/// Inputs assembled by the handshake or resumption code.
pub(crate) struct TransportParts {
    pub session_id: String,
    pub identity: Arc<Identity>,
    pub remote: PublicKey,
    pub is_initiator: bool,
    pub secret: Zeroizing<Vec<u8>>,
    pub conn: Connection,
    pub send_chain: SendChain,
    pub recv_chain: RecvChain,
    pub send_sequence: u64,
    pub recv_sequence: u64,
    pub timeouts: Timeouts,
    pub phase: SessionPhase,
    pub sessions: Option<Arc<SessionManager>>,
}

fn ratchet_error(e: CryptoError) -> Error {
    match e {
        CryptoError::Decryption => Error::auth("message authentication failed"),
        CryptoError::StaleMessage(n) => Error::protocol(format!("replayed message {}", n)),
        CryptoError::TooManySkipped(n) => {
            Error::protocol(format!("unresolvable gap of {} messages", n))
        }
        CryptoError::InvalidKey(_) | CryptoError::WeakSharedSecret => Error::protocol(e),
        other => Error::crypto(other),
    }
}

pub struct Transport {
    session_id: String,
    identity: Arc<Identity>,
    remote: PublicKey,
    is_initiator: bool,
    secret: Zeroizing<Vec<u8>>,
    peer_addr: SocketAddr,
    kind: TransportKind,
    read_timeout: Duration,
    write_timeout: Duration,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    send_sequence: AtomicU64,
    recv_sequence: AtomicU64,
    phase: AtomicI32,
    closing: watch::Sender<bool>,
    sessions: Option<Arc<SessionManager>>,
}

impl Transport {
    pub(crate) fn new(parts: TransportParts) -> Self {
        let peer_addr = parts.conn.peer_addr();
        let kind = parts.conn.kind();
        let (reader, writer) = parts.conn.into_split();
        let (closing, _) = watch::channel(false);

        Self {
            session_id: parts.session_id,
            identity: parts.identity,
            remote: parts.remote,
            is_initiator: parts.is_initiator,
            secret: parts.secret,
            peer_addr,
            kind,
            read_timeout: parts.timeouts.read,
            write_timeout: parts.timeouts.write,
            send: Mutex::new(SendHalf {
                writer: Some(writer),
                chain: Some(parts.send_chain),
            }),
            recv: Mutex::new(RecvHalf {
                reader: Some(reader),
                chain: Some(parts.recv_chain),
                window: ReplayWindow::starting_at(parts.recv_sequence),
            }),
            send_sequence: AtomicU64::new(parts.send_sequence),
            recv_sequence: AtomicU64::new(parts.recv_sequence),
            phase: AtomicI32::new(parts.phase as i32),
            closing,
            sessions: parts.sessions,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// This side's identity key.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::try_from(self.phase.load(Ordering::Acquire)).unwrap_or(SessionPhase::Invalid)
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) -> SessionPhase {
        let previous = self.phase.swap(phase as i32, Ordering::AcqRel);
        SessionPhase::try_from(previous).unwrap_or(SessionPhase::Invalid)
    }

    pub fn is_established(&self) -> bool {
        self.phase() == SessionPhase::Established
    }

    /// Current (send, receive) sequence numbers: the next sequence this side
    /// will send and the next it expects.
    pub fn sequences(&self) -> (u64, u64) {
        (
            self.send_sequence.load(Ordering::Acquire),
            self.recv_sequence.load(Ordering::Acquire),
        )
    }

    /// Sign, encrypt and write one message.
    ///
    /// On a write timeout the message is still delivered later, see the
    /// module docs.
    pub async fn send(&self, data: &[u8], route: Route) -> Result<MessageMetadata> {
        if !route.is_sendable() {
            return Err(Error::protocol("cannot send on the Invalid route"));
        }
        let limit = max_message_size(self.identity.algorithm());
        if data.len() > limit {
            return Err(Error::protocol(format!(
                "message of {} bytes exceeds {}",
                data.len(),
                limit
            )));
        }

        let mut guard = self.send.lock().await;
        let half = &mut *guard;
        let (Some(writer), Some(chain)) = (half.writer.as_mut(), half.chain.as_mut()) else {
            return Err(Error::Closed);
        };

        let sequence = self.send_sequence.load(Ordering::Acquire);
        let metadata = envelope::new_metadata(sequence);
        let payload = Payload {
            value: data.to_vec(),
        };
        let sealed = envelope::seal(
            &self.identity,
            route,
            payload.encode_to_vec(),
            Some(metadata.clone()),
            MESSAGE_PADDING,
        );
        let plaintext = Zeroizing::new(sealed.encode_to_vec());

        let (header, ciphertext) = chain.encrypt(&plaintext).map_err(ratchet_error)?;
        let frame = RatchetFrame {
            dh: header.dh.to_vec(),
            pn: header.pn,
            n: header.n,
            ciphertext,
        };
        writer.queue_frame(&frame.encode_to_vec())?;
        self.send_sequence.store(sequence + 1, Ordering::Release);

        with_deadline(self.write_timeout, "write", writer.flush()).await?;
        Ok(MessageMetadata::from_wire(&metadata, route))
    }

    /// Finish writing messages left queued by a timed out [`Transport::send`].
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.send.lock().await;
        let writer = guard.writer.as_mut().ok_or(Error::Closed)?;
        with_deadline(self.write_timeout, "flush", writer.flush()).await
    }

    /// Wait for the next message and copy its payload into `buf`.
    ///
    /// Authentication and protocol failures close the transport before the
    /// error is returned. A timeout leaves it usable.
    pub async fn receive(&self, buf: &mut Vec<u8>) -> Result<MessageMetadata> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            return Err(Error::Closed);
        }

        let mut guard = self.recv.lock().await;
        let result = self.receive_locked(&mut guard, buf, &mut closing).await;
        drop(guard);

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(session_id = %self.session_id, "closing transport: {}", e);
                let _ = self.close().await;
            } else if e.is_closed() && self.phase() != SessionPhase::Closed {
                debug!(session_id = %self.session_id, "peer closed the connection");
                let _ = self.close().await;
            }
        }
        result
    }

    /// Like [`Transport::receive`], but the message must carry `route`.
    pub async fn receive_expecting(&self, buf: &mut Vec<u8>, route: Route) -> Result<MessageMetadata> {
        let metadata = self.receive(buf).await?;
        if metadata.route != route {
            buf.clear();
            let err = Error::protocol(format!("expected route {}, got {}", route, metadata.route));
            let _ = self.close().await;
            return Err(err);
        }
        Ok(metadata)
    }

    async fn receive_locked(
        &self,
        half: &mut RecvHalf,
        buf: &mut Vec<u8>,
        closing: &mut watch::Receiver<bool>,
    ) -> Result<MessageMetadata> {
        let reader = half.reader.as_mut().ok_or(Error::Closed)?;
        let frame = tokio::select! {
            frame = with_deadline(self.read_timeout, "read", reader.read_frame()) => frame?,
            _ = closing.changed() => return Err(Error::Closed),
        };

        let frame: RatchetFrame = decode_msg(&frame).map_err(Error::protocol)?;
        let dh: [u8; 32] = frame
            .dh
            .as_slice()
            .try_into()
            .map_err(|_| Error::protocol("ratchet key must be 32 bytes"))?;
        let header = Header {
            dh,
            pn: frame.pn,
            n: frame.n,
        };

        let chain = half.chain.as_mut().ok_or(Error::Closed)?;
        let plaintext = Zeroizing::new(
            chain
                .decrypt(&header, &frame.ciphertext)
                .map_err(ratchet_error)?,
        );

        let sealed: Envelope = decode_msg(&plaintext).map_err(Error::protocol)?;
        envelope::verify(&sealed, &self.remote)?;

        let route = sealed.route();
        match self.phase() {
            SessionPhase::Handshaking if route != Route::Identity => {
                return Err(Error::protocol(format!(
                    "route {} is not allowed while handshaking",
                    route
                )));
            }
            _ if route == Route::Invalid => {
                return Err(Error::protocol("message carries the Invalid route"));
            }
            _ => {}
        }

        let metadata = sealed
            .metadata
            .clone()
            .ok_or_else(|| Error::protocol("message is missing metadata"))?;
        half.window
            .check_and_update(metadata.sequence)
            .map_err(Error::protocol)?;

        let payload: Payload = envelope::decode_data(&sealed)?;
        buf.clear();
        buf.extend_from_slice(&payload.value);

        self.recv_sequence
            .fetch_max(metadata.sequence + 1, Ordering::AcqRel);
        Ok(MessageMetadata::from_wire(&metadata, route))
    }

    fn capture(&self, recv: &RecvHalf, send: &SendHalf, phase: SessionPhase) -> Option<SessionState> {
        let (Some(send_chain), Some(recv_chain)) = (send.chain.as_ref(), recv.chain.as_ref()) else {
            return None;
        };
        let (send_sequence, recv_sequence) = self.sequences();
        let now = Utc::now();
        Some(SessionState {
            session_id: self.session_id.clone(),
            remote_public_key: self.remote.as_bytes().to_vec(),
            algorithm: self.remote.algorithm(),
            phase,
            shared_secret: self.secret.to_vec(),
            send_sequence,
            recv_sequence,
            is_initiator: self.is_initiator,
            ratchet_state: Some(RatchetState::capture(send_chain, recv_chain)),
            created_at: now,
            updated_at: now,
        })
    }

    /// Resumable state of this live transport.
    ///
    /// Waits for a pending `receive` to finish; sends are not held up.
    pub async fn snapshot(&self) -> Result<SessionState> {
        let recv = self.recv.lock().await;
        let send = self.send.lock().await;
        self.capture(&recv, &send, self.phase()).ok_or(Error::Closed)
    }

    /// Close the connection and wipe key material.
    ///
    /// An established session is saved first (when persistence is on) so it
    /// can be resumed later. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let previous = self.set_phase(SessionPhase::Closed);
        if previous == SessionPhase::Closed {
            return Ok(());
        }
        self.closing.send_replace(true);

        let mut recv = self.recv.lock().await;
        let mut send = self.send.lock().await;
        let snapshot = if previous == SessionPhase::Established {
            self.capture(&recv, &send, SessionPhase::Established)
        } else {
            None
        };

        recv.reader = None;
        recv.chain = None;
        send.chain = None;
        let writer = send.writer.take();
        drop(recv);
        drop(send);

        if let Some(mut writer) = writer {
            if let Err(e) = with_deadline(self.write_timeout, "shutdown", writer.shutdown()).await {
                debug!(session_id = %self.session_id, "shutdown failed: {}", e);
            }
        }

        if let (Some(state), Some(sessions)) = (snapshot, self.sessions.as_ref()) {
            if sessions.config().persist_sessions {
                let sessions = Arc::clone(sessions);
                blocking(move || sessions.save(&state)).await?;
            }
        }

        info!(session_id = %self.session_id, peer = %self.peer_addr, "transport closed");
        Ok(())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("session_id", &self.session_id)
            .field("remote", &self.remote)
            .field("peer_addr", &self.peer_addr)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
