//! Core Kestrel protocol types, framing, and constants.
//!
//! This crate provides:
//! - Protobuf wire messages for every protocol phase
//! - Route and session phase tags shared by both ends
//! - Length-prefixed framing for stream substrates
//! - Random padding used to blur message sizes

#![forbid(unsafe_code)]

pub mod frame;
pub mod wire;

pub use frame::{decode_frame, encode_frame, FRAME_HEADER_SIZE};
pub use wire::*;

use rand::{Rng, RngCore};

/// Largest frame accepted on the wire (10 KiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024;

/// Upper bound (exclusive) of the filler attached to introductions.
pub const INTRODUCTION_PADDING: usize = 512;
/// Upper bound (exclusive) of the filler attached to transport messages.
pub const MESSAGE_PADDING: usize = 128;
/// Upper bound (exclusive) of the filler attached to key exchange messages.
pub const KEY_EXCHANGE_PADDING: usize = 32;

/// Size of the random challenge echoed at the end of a fresh handshake.
pub const CHALLENGE_SIZE: usize = 32;
/// Size of each challenge exchanged during resumption.
pub const RESUME_CHALLENGE_SIZE: usize = 32;
/// Size of the nonce each side contributes to key agreement.
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Random filler of a random length below `max`.
pub fn padding(max: usize) -> Vec<u8> {
    if max == 0 {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    let mut pad = vec![0u8; rng.gen_range(0..max)];
    rng.fill_bytes(&mut pad);
    pad
}

/// Fill a fixed-size buffer from the thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}
