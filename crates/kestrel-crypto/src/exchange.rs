//! X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::CryptoError;

/// X25519 public key length.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 keypair used for one handshake (and as the session's ratchet key).
#[derive(Clone)]
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Wrap an existing secret.
    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Derive the shared secret with a peer's public key.
    ///
    /// Rejects low-order peer keys that would force a known shared secret.
    pub fn diffie_hellman(&self, their_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        diffie_hellman(&self.secret, their_public)
    }
}

/// X25519 between `secret` and raw peer key bytes.
pub fn diffie_hellman(
    secret: &StaticSecret,
    their_public: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let raw: [u8; PUBLIC_KEY_SIZE] = their_public.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "expected {} byte X25519 key, got {}",
            PUBLIC_KEY_SIZE,
            their_public.len()
        ))
    })?;

    let shared = secret.diffie_hellman(&X25519Public::from(raw));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakSharedSecret);
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();

        let a = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let b = bob.diffie_hellman(&alice.public_bytes()).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_low_order_key_rejected() {
        let alice = EphemeralKeypair::generate();
        assert!(matches!(
            alice.diffie_hellman(&[0u8; 32]),
            Err(CryptoError::WeakSharedSecret)
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let alice = EphemeralKeypair::generate();
        assert!(matches!(
            alice.diffie_hellman(&[9u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
