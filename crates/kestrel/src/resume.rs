//! Session resumption.
//!
//! ```text
//! client                                              server
//!   ReconnectRequest {id, phase, send, recv, key, Cc} ->
//!                                                      look up session by key
//!                         <- ReconnectResponse {accepted, MAC(Cc), Cs, send, recv}
//!   check MAC(Cc)
//!   ReconnectVerify {MAC(Cs), verified}               ->
//!                                                      check MAC(Cs)
//!                         <- ReconnectComplete {success, send, recv}
//! ```
//!
//! Every message is signed with the sender's identity on `Route::Reconnect`.
//! The MAC key is the resumption secret derived during the original
//! handshake, so a captured request cannot be completed without it. No new
//! key agreement happens here; the stored ratchet continues and its first
//! send after resuming starts a fresh chain.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use kestrel_common::{Error, Result};
use kestrel_core::{
    random_bytes, Envelope, ReconnectComplete, ReconnectRequest, ReconnectResponse,
    ReconnectVerify, Route, SessionPhase, RESUME_CHALLENGE_SIZE,
};
use kestrel_crypto::{Algorithm, PublicKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::RESUMPTION_TIMEOUT;
use crate::conn::{with_deadline, Connection};
use crate::envelope;
use crate::handshake::HandshakeContext;
use crate::session::{blocking, Lookup, SessionManager, SessionState};
use crate::transport::{Transport, TransportParts};

type HmacSha256 = Hmac<Sha256>;

const RESUME_LABEL: &[u8] = b"kestrel-resume";

pub const REASON_NOT_FOUND: &str = "session not found";
pub const REASON_EXPIRED: &str = "session expired";
pub const REASON_ID_MISMATCH: &str = "session ID mismatch";
pub const REASON_NOT_ESTABLISHED: &str = "session not established";
pub const REASON_DISABLED: &str = "resumption disabled";

/// HMAC-SHA256 over the challenge and a fixed label.
pub fn challenge_response(secret: &[u8], challenge: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(Error::crypto)?;
    mac.update(challenge);
    mac.update(RESUME_LABEL);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn verify_challenge_response(secret: &[u8], challenge: &[u8], response: &[u8]) -> bool {
    match challenge_response(secret, challenge) {
        Ok(expected) => bool::from(expected.as_slice().ct_eq(response)),
        Err(_) => false,
    }
}

/// Resumed (send, recv) for one side.
///
/// Each direction continues from the larger of what this side recorded and
/// what the peer reports for the opposite direction.
pub fn reconcile(local_send: u64, local_recv: u64, peer_send: u64, peer_recv: u64) -> (u64, u64) {
    (local_send.max(peer_recv), local_recv.max(peer_send))
}

fn restore(
    ctx: &HandshakeContext,
    conn: Connection,
    state: &SessionState,
    remote: PublicKey,
    send_sequence: u64,
    recv_sequence: u64,
) -> Result<Transport> {
    let ratchet = state
        .ratchet_state
        .as_ref()
        .ok_or_else(|| Error::resumption("stored session has no ratchet state"))?;
    let (send_chain, recv_chain) = ratchet.restore().map_err(Error::resumption)?;

    Ok(Transport::new(TransportParts {
        session_id: state.session_id.clone(),
        identity: Arc::clone(&ctx.identity),
        remote,
        is_initiator: state.is_initiator,
        secret: Zeroizing::new(state.shared_secret.clone()),
        conn,
        send_chain,
        recv_chain,
        send_sequence,
        recv_sequence,
        timeouts: ctx.transport_timeouts,
        phase: SessionPhase::Established,
        sessions: ctx.sessions.clone(),
    }))
}

async fn persist(ctx: &HandshakeContext, transport: &Transport) -> Result<()> {
    if let Some(sessions) = &ctx.sessions {
        if sessions.config().persist_sessions {
            sessions.save_transport(transport).await?;
        }
    }
    Ok(())
}

async fn read_reconnect(ctx: &HandshakeContext, conn: &mut Connection) -> Result<Envelope> {
    let envelope = ctx.read(conn).await?;
    envelope::expect_route(&envelope, &[Route::Reconnect])?;
    Ok(envelope)
}

/// Client side. Any error means the caller should fall back to a fresh
/// handshake.
pub(crate) async fn initiate(
    ctx: &HandshakeContext,
    conn: Connection,
    state: SessionState,
) -> Result<Transport> {
    with_deadline(RESUMPTION_TIMEOUT, "resumption", initiate_inner(ctx, conn, state)).await
}

async fn initiate_inner(
    ctx: &HandshakeContext,
    mut conn: Connection,
    state: SessionState,
) -> Result<Transport> {
    if state.phase != SessionPhase::Established {
        return Err(Error::resumption(REASON_NOT_ESTABLISHED));
    }
    let server_key = state.remote_key()?;
    let client_challenge: [u8; RESUME_CHALLENGE_SIZE] = random_bytes();

    let request = ReconnectRequest {
        session_id: state.session_id.clone(),
        last_phase: state.phase as i32,
        last_send_sequence: state.send_sequence,
        last_recv_sequence: state.recv_sequence,
        remote_public_key: ctx.identity.public_key().as_bytes().to_vec(),
        resume_challenge: client_challenge.to_vec(),
    };
    ctx.send_on(&mut conn, Route::Reconnect, &request, 0).await?;

    let response: ReconnectResponse =
        envelope::open(&read_reconnect(ctx, &mut conn).await?, &server_key)?;
    if !response.accepted {
        return Err(Error::resumption(format!(
            "server rejected resumption: {}",
            response.error_message
        )));
    }
    if !verify_challenge_response(
        &state.shared_secret,
        &client_challenge,
        &response.challenge_response,
    ) {
        return Err(Error::auth("server failed the resumption challenge"));
    }
    if response.server_challenge.len() != RESUME_CHALLENGE_SIZE {
        return Err(Error::protocol("server challenge has the wrong size"));
    }

    let verify = ReconnectVerify {
        challenge_response: challenge_response(&state.shared_secret, &response.server_challenge)?,
        verified: true,
    };
    ctx.send_on(&mut conn, Route::Reconnect, &verify, 0).await?;

    let complete: ReconnectComplete =
        envelope::open(&read_reconnect(ctx, &mut conn).await?, &server_key)?;
    if !complete.success {
        return Err(Error::resumption(format!(
            "server did not complete resumption: {}",
            complete.error_message
        )));
    }

    // The server's view is authoritative; its send is our receive.
    let (local_send, local_recv) = reconcile(
        state.send_sequence,
        state.recv_sequence,
        response.server_send_sequence,
        response.server_recv_sequence,
    );
    let send = complete.resume_recv_sequence;
    let recv = complete.resume_send_sequence;
    if send < state.send_sequence || recv < state.recv_sequence {
        return Err(Error::resumption(format!(
            "server sequences ({}, {}) regress below recorded ({}, {})",
            send, recv, state.send_sequence, state.recv_sequence
        )));
    }
    if (send, recv) != (local_send, local_recv) {
        debug!(
            session_id = %state.session_id,
            local_send, local_recv, send, recv,
            "adopting server sequence numbers"
        );
    }

    let transport = restore(ctx, conn, &state, server_key, send, recv)?;
    persist(ctx, &transport).await?;
    info!(session_id = %transport.session_id(), send, recv, "session resumed");
    Ok(transport)
}

async fn reject(
    ctx: &HandshakeContext,
    conn: &mut Connection,
    reason: &'static str,
) -> Result<Transport> {
    debug!(reason, "rejecting resumption");
    let response = ReconnectResponse {
        accepted: false,
        error_message: reason.to_string(),
        ..Default::default()
    };
    ctx.send_on(conn, Route::Reconnect, &response, 0).await?;
    Err(Error::resumption(reason))
}

/// The identity key a reconnect request claims to come from.
fn claimed_key(bytes: &[u8]) -> Result<PublicKey> {
    let algorithm = Algorithm::for_public_key(bytes)
        .ok_or_else(|| Error::auth("reconnect request carries no usable public key"))?;
    PublicKey::from_bytes(algorithm, bytes).map_err(Error::auth)
}

/// Server side; `first` is the client's `ReconnectRequest` envelope.
pub(crate) async fn respond(
    ctx: &HandshakeContext,
    conn: Connection,
    first: Envelope,
) -> Result<Transport> {
    with_deadline(RESUMPTION_TIMEOUT, "resumption", respond_inner(ctx, conn, first)).await
}

async fn respond_inner(
    ctx: &HandshakeContext,
    mut conn: Connection,
    first: Envelope,
) -> Result<Transport> {
    envelope::expect_route(&first, &[Route::Reconnect])?;
    let request: ReconnectRequest = envelope::decode_data(&first)?;

    // Only the key's owner learns whether a session exists for it.
    let client_key = claimed_key(&request.remote_public_key)?;
    envelope::verify(&first, &client_key)?;

    let Some(sessions) = ctx.sessions.clone().filter(|s| s.config().enabled) else {
        return reject(ctx, &mut conn, REASON_DISABLED).await;
    };

    let lookup = {
        let sessions = Arc::clone(&sessions);
        let key = request.remote_public_key.clone();
        blocking(move || sessions.lookup(&key)).await?
    };
    let state = match lookup {
        Lookup::Found(state) => state,
        Lookup::Expired => return reject(ctx, &mut conn, REASON_EXPIRED).await,
        Lookup::Missing => return reject(ctx, &mut conn, REASON_NOT_FOUND).await,
    };

    if state.remote_key()? != client_key {
        return reject(ctx, &mut conn, REASON_NOT_FOUND).await;
    }
    if state.session_id != request.session_id {
        return reject(ctx, &mut conn, REASON_ID_MISMATCH).await;
    }
    if state.phase != SessionPhase::Established
        || request.last_phase() != SessionPhase::Established
        || state.shared_secret.is_empty()
        || state.ratchet_state.is_none()
    {
        return reject(ctx, &mut conn, REASON_NOT_ESTABLISHED).await;
    }

    let server_challenge: [u8; RESUME_CHALLENGE_SIZE] = random_bytes();
    let response = ReconnectResponse {
        accepted: true,
        error_message: String::new(),
        resume_from_phase: SessionPhase::Established as i32,
        challenge_response: challenge_response(&state.shared_secret, &request.resume_challenge)?,
        server_challenge: server_challenge.to_vec(),
        server_send_sequence: state.send_sequence,
        server_recv_sequence: state.recv_sequence,
    };
    ctx.send_on(&mut conn, Route::Reconnect, &response, 0).await?;

    let verify: ReconnectVerify =
        envelope::open(&read_reconnect(ctx, &mut conn).await?, &client_key)?;
    if !verify.verified
        || !verify_challenge_response(
            &state.shared_secret,
            &server_challenge,
            &verify.challenge_response,
        )
    {
        warn!(session_id = %state.session_id, "client failed the resumption challenge");
        let complete = ReconnectComplete {
            success: false,
            error_message: "challenge verification failed".to_string(),
            ..Default::default()
        };
        ctx.send_on(&mut conn, Route::Reconnect, &complete, 0).await?;
        discard(&sessions, &state).await;
        return Err(Error::auth("client failed the resumption challenge"));
    }

    let (send, recv) = reconcile(
        state.send_sequence,
        state.recv_sequence,
        request.last_send_sequence,
        request.last_recv_sequence,
    );
    let complete = ReconnectComplete {
        success: true,
        error_message: String::new(),
        resume_send_sequence: send,
        resume_recv_sequence: recv,
    };
    ctx.send_on(&mut conn, Route::Reconnect, &complete, 0).await?;

    let transport = restore(ctx, conn, &state, client_key, send, recv)?;
    persist(ctx, &transport).await?;
    info!(session_id = %transport.session_id(), send, recv, "session resumed");
    Ok(transport)
}

/// Remove a session that failed verification.
pub(crate) async fn discard(sessions: &Arc<SessionManager>, state: &SessionState) {
    let sessions = Arc::clone(sessions);
    let key = state.remote_public_key.clone();
    if let Err(e) = blocking(move || sessions.delete(&key)).await {
        warn!("failed to discard session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_response() {
        let secret = [7u8; 32];
        let challenge = [1u8; 32];
        let response = challenge_response(&secret, &challenge).unwrap();
        assert_eq!(response.len(), 32);

        assert!(verify_challenge_response(&secret, &challenge, &response));
        assert!(!verify_challenge_response(&[8u8; 32], &challenge, &response));
        assert!(!verify_challenge_response(&secret, &[2u8; 32], &response));
        assert!(!verify_challenge_response(&secret, &challenge, &response[..31]));
    }

    #[test]
    fn test_claimed_key() {
        let identity = kestrel_crypto::Identity::generate(Algorithm::Ed25519);
        let key = identity.public_key();
        assert_eq!(claimed_key(key.as_bytes()).unwrap(), key);
        assert!(matches!(claimed_key(&[1, 2, 3]), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_reconcile_never_regresses() {
        assert_eq!(reconcile(5, 3, 2, 7), (7, 3));
        assert_eq!(reconcile(5, 3, 9, 1), (5, 9));

        // both sides agree on the result from either point of view
        let (client_send, client_recv) = (10, 4);
        let (server_send, server_recv) = (6, 8);
        let server = reconcile(server_send, server_recv, client_send, client_recv);
        let client = reconcile(client_send, client_recv, server_send, server_recv);
        assert_eq!(client, (server.1, server.0));
        assert!(client.0 >= client_send && client.1 >= client_recv);
        assert!(server.0 >= server_send && server.1 >= server_recv);
    }
}
