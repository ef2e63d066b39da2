//! Authenticated encryption keyed through HKDF.
//!
//! ```text
//! [24 bytes: random nonce] [ciphertext] [16 bytes: Poly1305 tag]
//! ```
//!
//! XChaCha20's 192-bit nonce is large enough to pick at random for every
//! message, so a sealer needs no counter and can be shared freely.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::CryptoError;

/// Symmetric key size.
pub const KEY_SIZE: usize = 32;
/// Nonce prepended to every sealed message.
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// HKDF-SHA512 expansion of `secret` into `out`.
pub fn derive(
    secret: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    Hkdf::<Sha512>::new(salt, secret)
        .expand(info, out)
        .map_err(|_| CryptoError::Kdf)
}

/// HKDF-SHA512 derivation of a 32-byte key.
pub fn derive_key(
    secret: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    derive(secret, salt, info, &mut key[..])?;
    Ok(key)
}

/// XChaCha20-Poly1305 with random nonces.
pub struct Sealer {
    aead: XChaCha20Poly1305,
}

impl Sealer {
    /// Derive the cipher key from `secret` with HKDF-SHA512.
    pub fn new(secret: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<Self, CryptoError> {
        let key = derive_key(secret, salt, info)?;
        Ok(Self::from_key(&key))
    }

    /// Use `key` directly.
    pub fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt `plaintext`, binding `aad` into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a message produced by [`Sealer::seal`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.aead
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::Decryption)
    }
}
