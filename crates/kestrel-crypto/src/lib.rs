//! Cryptographic primitives for Kestrel.
//!
//! This crate provides:
//! - Signing identities behind a closed set of algorithms (Ed25519, ML-DSA-65)
//! - X25519 ephemeral key agreement
//! - An XChaCha20-Poly1305 sealer keyed through HKDF
//! - A double ratchet with serializable state
//! - A sliding replay window for envelope sequence numbers
//! - Human-comparable key fingerprints
//!
//! # Design
//!
//! The ratchet keeps one chain per direction. Each side rotates only its own
//! sending chain, so both peers can send concurrently without ever having to
//! agree on who ratchets next. A rotation mixes a fresh X25519 key with the
//! peer's session key into that direction's root.

#![forbid(unsafe_code)]

pub mod exchange;
pub mod fingerprint;
pub mod identity;
pub mod ratchet;
pub mod replay;
pub mod sealer;

pub use exchange::EphemeralKeypair;
pub use identity::{Algorithm, Identity, MlDsaKey, PeerId, PublicKey};
pub use ratchet::{Header, Ratchet, RatchetState, RecvChain, SendChain};
pub use replay::{ReplayError, ReplayWindow};
pub use sealer::Sealer;

use thiserror::Error;

/// Errors raised by the primitives in this crate.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown algorithm id: {0}")]
    UnknownAlgorithm(u32),

    #[error("unknown algorithm: {0}")]
    UnknownAlgorithmName(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("key derivation failed")]
    Kdf,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("non-contributory key exchange")]
    WeakSharedSecret,

    #[error("message {0} was already consumed")]
    StaleMessage(u64),

    #[error("too many skipped messages: {0}")]
    TooManySkipped(u64),

    #[error("invalid ratchet state: {0}")]
    InvalidState(String),

    #[error("fingerprint rendering failed: {0}")]
    Fingerprint(String),
}
