//! Signing identities and peer ids.
//!
//! A **peer id** is the base64url-encoded public key of an identity. It is
//! only a display and logging handle; trust decisions always work on the raw
//! key bytes.
//!
//! Two schemes are supported: Ed25519 and the post-quantum ML-DSA-65. An
//! ML-DSA identity is stored as its 32-byte key generation seed.
//!
//! # Example
//!
//! ```
//! use kestrel_crypto::identity::{Algorithm, Identity};
//!
//! let identity = Identity::generate(Algorithm::Ed25519);
//! let signature = identity.sign(b"introduce me");
//!
//! assert!(identity.public_key().verify(b"introduce me", &signature));
//! println!("peer id: {}", identity.peer_id());
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ml_dsa::{
    EncodedSignature, EncodedVerifyingKey, KeyGen, KeyPair, MlDsa65, B32,
    Signature as MlDsaSignature, VerifyingKey as MlDsaVerifyingKey,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::CryptoError;

/// Signature schemes an identity can use.
///
/// The numeric id travels in introductions; adding a scheme means adding a
/// variant here and an arm in each match below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Ed25519,
    /// ML-DSA-65 (FIPS 204).
    MlDsa,
}

const MLDSA_PUBLIC_KEY_LEN: usize = 1952;
const MLDSA_SIGNATURE_LEN: usize = 3309;
const MLDSA_SEED_LEN: usize = 32;

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::Ed25519, Algorithm::MlDsa];

    /// Stable wire id.
    pub fn id(self) -> u32 {
        match self {
            Algorithm::Ed25519 => 1,
            Algorithm::MlDsa => 2,
        }
    }

    /// Parse a wire id.
    pub fn from_id(id: u32) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(Algorithm::Ed25519),
            2 => Ok(Algorithm::MlDsa),
            other => Err(CryptoError::UnknownAlgorithm(other)),
        }
    }

    /// Short lowercase name, used as a storage key.
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Ed25519 => "ed25519",
            Algorithm::MlDsa => "mldsa",
        }
    }

    /// Encoded public key length.
    pub const fn public_key_len(self) -> usize {
        match self {
            Algorithm::Ed25519 => ed25519_dalek::PUBLIC_KEY_LENGTH,
            Algorithm::MlDsa => MLDSA_PUBLIC_KEY_LEN,
        }
    }

    /// Encoded signature length.
    pub const fn signature_len(self) -> usize {
        match self {
            Algorithm::Ed25519 => ed25519_dalek::SIGNATURE_LENGTH,
            Algorithm::MlDsa => MLDSA_SIGNATURE_LEN,
        }
    }

    /// The scheme whose public keys have the length of `key`.
    ///
    /// Key lengths differ between schemes, so raw key bytes are enough to
    /// tell them apart.
    pub fn for_public_key(key: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.public_key_len() == key.len())
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(s))
            .ok_or(CryptoError::UnknownAlgorithmName(s.to_string()))
    }
}

/// Base64url-encoded public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from raw public key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// ML-DSA-65 key pair and the seed it was expanded from.
pub struct MlDsaKey {
    seed: Zeroizing<[u8; MLDSA_SEED_LEN]>,
    keys: Box<KeyPair<MlDsa65>>,
}

impl MlDsaKey {
    fn from_seed(seed: Zeroizing<[u8; MLDSA_SEED_LEN]>) -> Self {
        let keys = Box::new(MlDsa65::key_gen_internal(&B32::from(*seed)));
        Self { seed, keys }
    }
}

/// Private signing identity.
///
/// Ed25519 key material is zeroized on drop by the underlying key type; an
/// ML-DSA identity zeroizes its seed.
pub enum Identity {
    Ed25519(SigningKey),
    MlDsa(MlDsaKey),
}

fn private_len_error(expected: usize, got: usize) -> CryptoError {
    CryptoError::InvalidKey(format!("expected {} private key bytes, got {}", expected, got))
}

impl Identity {
    /// Generate a new random identity using the OS CSPRNG.
    pub fn generate(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Ed25519 => Identity::Ed25519(SigningKey::generate(&mut OsRng)),
            Algorithm::MlDsa => {
                let mut seed = Zeroizing::new([0u8; MLDSA_SEED_LEN]);
                OsRng.fill_bytes(&mut seed[..]);
                Identity::MlDsa(MlDsaKey::from_seed(seed))
            }
        }
    }

    /// Recreate an identity from its private key bytes.
    pub fn from_bytes(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, CryptoError> {
        match algorithm {
            Algorithm::Ed25519 => {
                let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
                    bytes
                        .try_into()
                        .map_err(|_| private_len_error(32, bytes.len()))?,
                );
                Ok(Identity::Ed25519(SigningKey::from_bytes(&bytes)))
            }
            Algorithm::MlDsa => {
                let seed: Zeroizing<[u8; MLDSA_SEED_LEN]> = Zeroizing::new(
                    bytes
                        .try_into()
                        .map_err(|_| private_len_error(MLDSA_SEED_LEN, bytes.len()))?,
                );
                Ok(Identity::MlDsa(MlDsaKey::from_seed(seed)))
            }
        }
    }

    /// Private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            Identity::Ed25519(key) => Zeroizing::new(key.to_bytes().to_vec()),
            Identity::MlDsa(key) => Zeroizing::new(key.seed.to_vec()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Identity::Ed25519(_) => Algorithm::Ed25519,
            Identity::MlDsa(_) => Algorithm::MlDsa,
        }
    }

    /// Public half of this identity.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Identity::Ed25519(key) => PublicKey {
                algorithm: Algorithm::Ed25519,
                bytes: key.verifying_key().as_bytes().to_vec(),
            },
            Identity::MlDsa(key) => PublicKey {
                algorithm: Algorithm::MlDsa,
                bytes: key.keys.verifying_key().encode().to_vec(),
            },
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.public_key().peer_id()
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Identity::Ed25519(key) => key.sign(message).to_bytes().to_vec(),
            Identity::MlDsa(key) => {
                let signature: MlDsaSignature<MlDsa65> =
                    ml_dsa::signature::Signer::sign(key.keys.signing_key(), message);
                signature.encode().to_vec()
            }
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("algorithm", &self.algorithm())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

/// Marshaled public key tagged with its algorithm.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    algorithm: Algorithm,
    bytes: Vec<u8>,
}

impl PublicKey {
    /// Parse and validate public key bytes.
    pub fn from_bytes(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, CryptoError> {
        match algorithm {
            Algorithm::Ed25519 => {
                let raw: &[u8; 32] = bytes.try_into().map_err(|_| {
                    CryptoError::InvalidKey(format!(
                        "expected 32 public key bytes, got {}",
                        bytes.len()
                    ))
                })?;
                VerifyingKey::from_bytes(raw)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            }
            Algorithm::MlDsa => {
                if bytes.len() != MLDSA_PUBLIC_KEY_LEN {
                    return Err(CryptoError::InvalidKey(format!(
                        "expected {} public key bytes, got {}",
                        MLDSA_PUBLIC_KEY_LEN,
                        bytes.len()
                    )));
                }
            }
        }
        Ok(Self {
            algorithm,
            bytes: bytes.to_vec(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(&self.bytes)
    }

    /// Verify a signature made by the matching identity.
    ///
    /// A failed check is reported, not raised; callers decide the policy.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self.algorithm {
            Algorithm::Ed25519 => {
                let Ok(raw) = <&[u8; 32]>::try_from(self.bytes.as_slice()) else {
                    return false;
                };
                let Ok(key) = VerifyingKey::from_bytes(raw) else {
                    return false;
                };
                let Ok(sig) = Signature::from_slice(signature) else {
                    return false;
                };
                key.verify(message, &sig).is_ok()
            }
            Algorithm::MlDsa => {
                let Ok(encoded) = EncodedVerifyingKey::<MlDsa65>::try_from(self.bytes.as_slice())
                else {
                    return false;
                };
                let key = MlDsaVerifyingKey::<MlDsa65>::decode(&encoded);
                let Ok(encoded) = EncodedSignature::<MlDsa65>::try_from(signature) else {
                    return false;
                };
                let Some(sig) = MlDsaSignature::<MlDsa65>::decode(&encoded) else {
                    return false;
                };
                ml_dsa::signature::Verifier::verify(&key, message, &sig).is_ok()
            }
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}, {})", self.algorithm, self.peer_id())
    }
}
