//! Fresh handshake.
//!
//! ```text
//! initiator                                responder
//!   Introduction (signed, Route::Identity) ->
//!                                           verify signature, RemoteVerifier
//!                                        <- Introduction
//!   verify signature, RemoteVerifier
//!   KeyExchange {x25519, nonce}           ->
//!                                        <- KeyExchange {x25519, nonce}
//!   -- both derive session id, ratchet root, resumption secret --
//!   challenge C1 (ratchet)                ->
//!                                        <- echo C1
//!                                        <- challenge C2
//!   echo C2                               ->
//!   -- Established --
//! ```
//!
//! A verifier rejection ends the handshake before anything else is written.

use std::sync::Arc;

use kestrel_common::{Error, Result};
use kestrel_core::{
    random_bytes, Envelope, Introduction, KeyExchange, Route, SessionPhase, CHALLENGE_SIZE,
    HANDSHAKE_NONCE_SIZE, INTRODUCTION_PADDING, KEY_EXCHANGE_PADDING,
};
use kestrel_crypto::exchange::PUBLIC_KEY_SIZE;
use kestrel_crypto::{sealer, EphemeralKeypair, Identity, PublicKey, Ratchet};
use prost::Message;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::Timeouts;
use crate::conn::{with_deadline, Connection};
use crate::envelope;
use crate::session::{blocking, SessionManager};
use crate::storage::Storage;
use crate::transport::{Transport, TransportParts};
use crate::verifier::{introduced_key, RemoteVerifier};

const SESSION_ID_LABEL: &[u8] = b"kestrel/session-id";
const RATCHET_ROOT_LABEL: &[u8] = b"kestrel/ratchet-root/";
const RESUMPTION_LABEL: &[u8] = b"kestrel/resumption/";

/// Everything one side brings to a handshake.
#[derive(Clone)]
pub(crate) struct HandshakeContext {
    pub identity: Arc<Identity>,
    pub name: String,
    pub storage: Arc<Storage>,
    pub verifier: Arc<dyn RemoteVerifier>,
    /// Deadlines for handshake and resumption messages.
    pub timeouts: Timeouts,
    /// Deadlines handed to the established transport.
    pub transport_timeouts: Timeouts,
    pub ratchet_threshold: u64,
    pub sessions: Option<Arc<SessionManager>>,
}

impl HandshakeContext {
    fn introduction(&self) -> Introduction {
        Introduction {
            name: self.name.clone(),
            public_key: self.identity.public_key().as_bytes().to_vec(),
            algorithm: self.identity.algorithm().id(),
            padding: Vec::new(),
        }
    }

    async fn send<M: Message>(&self, conn: &mut Connection, msg: &M, padding: usize) -> Result<()> {
        self.send_on(conn, Route::Identity, msg, padding).await
    }

    pub(crate) async fn send_on<M: Message>(
        &self,
        conn: &mut Connection,
        route: Route,
        msg: &M,
        padding: usize,
    ) -> Result<()> {
        with_deadline(
            self.timeouts.write,
            "handshake write",
            envelope::send_signed(conn, &self.identity, route, msg, padding),
        )
        .await
    }

    pub(crate) async fn read(&self, conn: &mut Connection) -> Result<Envelope> {
        with_deadline(
            self.timeouts.read,
            "handshake read",
            envelope::read_envelope(conn),
        )
        .await
    }

    async fn verify_peer(&self, intro: &Introduction) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let verifier = Arc::clone(&self.verifier);
        let intro = intro.clone();
        blocking(move || verifier.verify(&storage, &intro)).await
    }
}

/// Parse an introduction envelope and check it is signed by the key it carries.
pub(crate) fn open_introduction(envelope: &Envelope) -> Result<(Introduction, PublicKey)> {
    envelope::expect_route(envelope, &[Route::Identity, Route::Invalid])?;
    let intro: Introduction = envelope::decode_data(envelope)?;
    let key = introduced_key(&intro)?;
    envelope::verify(envelope, &key)?;
    Ok((intro, key))
}

struct Contribution {
    key: [u8; PUBLIC_KEY_SIZE],
    nonce: [u8; HANDSHAKE_NONCE_SIZE],
}

fn parse_exchange(envelope: &Envelope, remote: &PublicKey) -> Result<Contribution> {
    envelope::expect_route(envelope, &[Route::Identity])?;
    let exchange: KeyExchange = envelope::open(envelope, remote)?;
    let key = exchange
        .key
        .as_slice()
        .try_into()
        .map_err(|_| Error::protocol("key exchange key must be 32 bytes"))?;
    let nonce = exchange
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| Error::protocol("key exchange nonce must be 16 bytes"))?;
    Ok(Contribution { key, nonce })
}

/// Hex of the first 16 bytes of a hash over the whole key agreement.
fn derive_session_id(
    initiator: &PublicKey,
    responder: &PublicKey,
    initiator_part: &Contribution,
    responder_part: &Contribution,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_ID_LABEL);
    hasher.update(initiator.as_bytes());
    hasher.update(responder.as_bytes());
    hasher.update(initiator_part.nonce);
    hasher.update(responder_part.nonce);
    hasher.update(initiator_part.key);
    hasher.update(responder_part.key);
    hex::encode(&hasher.finalize()[..16])
}

fn labelled(label: &[u8], session_id: &str) -> Vec<u8> {
    [label, session_id.as_bytes()].concat()
}

/// Agree on keys and build a transport still in the handshaking phase.
async fn agree(
    ctx: &HandshakeContext,
    mut conn: Connection,
    remote: PublicKey,
    is_initiator: bool,
) -> Result<Transport> {
    let ephemeral = EphemeralKeypair::generate();
    let local = Contribution {
        key: ephemeral.public_bytes(),
        nonce: random_bytes(),
    };
    let exchange = KeyExchange {
        key: local.key.to_vec(),
        nonce: local.nonce.to_vec(),
        padding: kestrel_core::padding(KEY_EXCHANGE_PADDING),
    };

    let peer = if is_initiator {
        ctx.send(&mut conn, &exchange, 0).await?;
        parse_exchange(&ctx.read(&mut conn).await?, &remote)?
    } else {
        let peer = parse_exchange(&ctx.read(&mut conn).await?, &remote)?;
        ctx.send(&mut conn, &exchange, 0).await?;
        peer
    };

    let local_key = ctx.identity.public_key();
    let (initiator, responder, initiator_part, responder_part) = if is_initiator {
        (&local_key, &remote, &local, &peer)
    } else {
        (&remote, &local_key, &peer, &local)
    };
    let session_id = derive_session_id(initiator, responder, initiator_part, responder_part);

    let shared = ephemeral.diffie_hellman(&peer.key).map_err(Error::protocol)?;
    let salt = [initiator_part.nonce, responder_part.nonce].concat();
    let root = sealer::derive_key(
        &shared[..],
        Some(salt.as_slice()),
        &labelled(RATCHET_ROOT_LABEL, &session_id),
    )
    .map_err(Error::crypto)?;
    let resumption = sealer::derive_key(
        &shared[..],
        Some(salt.as_slice()),
        &labelled(RESUMPTION_LABEL, &session_id),
    )
    .map_err(Error::crypto)?;

    let ratchet = Ratchet::new(
        &root[..],
        ephemeral.secret().clone(),
        peer.key,
        &session_id,
        ctx.ratchet_threshold,
    )
    .map_err(Error::protocol)?;
    let (send_chain, recv_chain) = ratchet.split();

    debug!(session_id = %session_id, "key agreement complete");
    Ok(Transport::new(TransportParts {
        session_id,
        identity: Arc::clone(&ctx.identity),
        remote,
        is_initiator,
        secret: Zeroizing::new(resumption.to_vec()),
        conn,
        send_chain,
        recv_chain,
        send_sequence: 0,
        recv_sequence: 0,
        timeouts: ctx.transport_timeouts,
        phase: SessionPhase::Handshaking,
        sessions: ctx.sessions.clone(),
    }))
}

async fn expect_echo(transport: &Transport, challenge: &[u8]) -> Result<()> {
    let mut echo = Vec::with_capacity(CHALLENGE_SIZE);
    transport.receive_expecting(&mut echo, Route::Identity).await?;
    if bool::from(echo.as_slice().ct_eq(challenge)) {
        Ok(())
    } else {
        Err(Error::auth("handshake challenge mismatch"))
    }
}

async fn echo_challenge(transport: &Transport) -> Result<()> {
    let mut challenge = Vec::with_capacity(CHALLENGE_SIZE);
    transport
        .receive_expecting(&mut challenge, Route::Identity)
        .await?;
    if challenge.len() != CHALLENGE_SIZE {
        return Err(Error::protocol("handshake challenge has the wrong size"));
    }
    transport.send(&challenge, Route::Identity).await?;
    Ok(())
}

async fn establish(ctx: &HandshakeContext, transport: Transport) -> Result<Transport> {
    transport.set_phase(SessionPhase::Established);
    if let Some(sessions) = &ctx.sessions {
        if sessions.config().persist_sessions {
            sessions.save_transport(&transport).await?;
        }
    }
    info!(
        session_id = %transport.session_id(),
        peer = %transport.remote_public_key().peer_id(),
        initiator = transport.is_initiator(),
        "session established"
    );
    Ok(transport)
}

async fn fail<T>(transport: Transport, err: Error) -> Result<T> {
    let _ = transport.close().await;
    Err(err)
}

/// Run the initiator side over a fresh connection.
///
/// With `expected` set, a peer introducing a different key is refused.
pub(crate) async fn initiate(
    ctx: &HandshakeContext,
    mut conn: Connection,
    expected: Option<&PublicKey>,
) -> Result<Transport> {
    let mut intro = ctx.introduction();
    intro.padding = kestrel_core::padding(INTRODUCTION_PADDING);
    ctx.send(&mut conn, &intro, 0).await?;

    let (remote_intro, remote) = open_introduction(&ctx.read(&mut conn).await?)?;
    if let Some(expected) = expected {
        if expected != &remote {
            return Err(Error::auth(format!(
                "expected peer {}, got {}",
                expected.peer_id(),
                remote.peer_id()
            )));
        }
    }
    ctx.verify_peer(&remote_intro).await?;
    debug!(peer = %remote.peer_id(), name = %remote_intro.name, "peer accepted");

    let transport = agree(ctx, conn, remote, true).await?;

    let challenge: [u8; CHALLENGE_SIZE] = random_bytes();
    let proof = async {
        transport.send(&challenge, Route::Identity).await?;
        expect_echo(&transport, &challenge).await?;
        echo_challenge(&transport).await
    };
    let outcome = proof.await;
    match outcome {
        Ok(()) => establish(ctx, transport).await,
        Err(e) => fail(transport, e).await,
    }
}

/// Run the responder side; `first` is the initiator's introduction.
pub(crate) async fn respond(
    ctx: &HandshakeContext,
    mut conn: Connection,
    first: Envelope,
) -> Result<Transport> {
    let (remote_intro, remote) = open_introduction(&first)?;
    ctx.verify_peer(&remote_intro).await?;
    debug!(peer = %remote.peer_id(), name = %remote_intro.name, "peer accepted");

    let mut intro = ctx.introduction();
    intro.padding = kestrel_core::padding(INTRODUCTION_PADDING);
    ctx.send(&mut conn, &intro, 0).await?;

    let transport = agree(ctx, conn, remote, false).await?;

    let challenge: [u8; CHALLENGE_SIZE] = random_bytes();
    let proof = async {
        echo_challenge(&transport).await?;
        transport.send(&challenge, Route::Identity).await?;
        expect_echo(&transport, &challenge).await
    };
    let outcome = proof.await;
    match outcome {
        Ok(()) => establish(ctx, transport).await,
        Err(e) => fail(transport, e).await,
    }
}
