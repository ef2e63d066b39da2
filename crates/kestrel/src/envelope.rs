//! Signed envelopes.
//!
//! Every protocol message is encoded on its own, placed in
//! [`Envelope::data`] and signed by the sender's identity. Receivers check
//! the signature against the key they expect before decoding `data`.

use chrono::Utc;
use kestrel_common::{Error, Result};
use kestrel_core::{decode_msg, padding, Envelope, Metadata, Route};
use kestrel_crypto::{Identity, PublicKey};
use prost::Message;
use uuid::Uuid;

use crate::conn::Connection;

/// Fresh metadata for an outgoing message.
pub fn new_metadata(sequence: u64) -> Metadata {
    Metadata {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now().timestamp_micros(),
        sequence,
    }
}

/// Wrap an encoded message in a signed, padded envelope.
pub fn seal(
    identity: &Identity,
    route: Route,
    data: Vec<u8>,
    metadata: Option<Metadata>,
    max_padding: usize,
) -> Envelope {
    let signature = identity.sign(&data);
    Envelope {
        data,
        signature,
        padding: padding(max_padding),
        route: route as i32,
        metadata,
    }
}

/// Check the envelope's signature against `key`.
pub fn verify(envelope: &Envelope, key: &PublicKey) -> Result<()> {
    if key.verify(&envelope.data, &envelope.signature) {
        Ok(())
    } else {
        Err(Error::auth("envelope signature verification failed"))
    }
}

/// Require the envelope's route to be one of `allowed`.
pub fn expect_route(envelope: &Envelope, allowed: &[Route]) -> Result<Route> {
    let route = envelope.route();
    if allowed.contains(&route) {
        Ok(route)
    } else {
        Err(Error::protocol(format!(
            "unexpected route {} (expected one of {:?})",
            route, allowed
        )))
    }
}

/// Decode the message carried in `data`.
pub fn decode_data<M: Message + Default>(envelope: &Envelope) -> Result<M> {
    decode_msg(&envelope.data).map_err(Error::protocol)
}

/// Verify, then decode.
pub fn open<M: Message + Default>(envelope: &Envelope, key: &PublicKey) -> Result<M> {
    verify(envelope, key)?;
    decode_data(envelope)
}

/// Sign `msg` and write it as one frame.
pub async fn send_signed<M: Message>(
    conn: &mut Connection,
    identity: &Identity,
    route: Route,
    msg: &M,
    max_padding: usize,
) -> Result<()> {
    let envelope = seal(identity, route, msg.encode_to_vec(), None, max_padding);
    conn.write(&envelope.encode_to_vec()).await
}

/// Read one frame and decode it as an envelope.
pub async fn read_envelope(conn: &mut Connection) -> Result<Envelope> {
    let frame = conn.read().await?;
    decode_msg(&frame).map_err(Error::protocol)
}
