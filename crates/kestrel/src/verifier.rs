//! Peer acceptance policies.
//!
//! An introduction is self-asserted: anyone can claim any name. Trust comes
//! from a human comparing fingerprints out of band, or from having accepted
//! the same key before. A [`RemoteVerifier`] encodes that decision and is
//! handed to the dialer or server at construction.
//!
//! Verifiers may block (a confirmation prompt, a storage read); the engine
//! always calls them from a blocking task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kestrel_common::{Error, Result};
use kestrel_core::Introduction;
use kestrel_crypto::{fingerprint, Algorithm, PublicKey};
use tracing::{info, warn};

use crate::storage::{Peer, Storage};

/// Decides whether an introduced peer may proceed.
pub trait RemoteVerifier: Send + Sync {
    fn verify(&self, storage: &Storage, intro: &Introduction) -> Result<()>;
}

/// What a confirmation callback is shown about a peer.
#[derive(Debug, Clone)]
pub struct PeerReview {
    pub name: String,
    pub public_key: PublicKey,
    pub peer_id: String,
    pub algorithm: Algorithm,
    pub emoji: Vec<&'static str>,
    pub hex: String,
    /// Set when the key has been accepted before.
    pub first_seen: Option<DateTime<Utc>>,
}

impl PeerReview {
    fn new(intro: &Introduction, key: &PublicKey, known: Option<&Peer>) -> Self {
        Self {
            name: intro.name.clone(),
            public_key: key.clone(),
            peer_id: key.peer_id().to_string(),
            algorithm: key.algorithm(),
            emoji: fingerprint::emoji(key.as_bytes()),
            hex: fingerprint::hex(key.as_bytes()),
            first_seen: known.map(|p| p.first_seen),
        }
    }

    pub fn is_known(&self) -> bool {
        self.first_seen.is_some()
    }

    /// Terminal QR code of the peer id.
    pub fn qr(&self) -> Result<String> {
        fingerprint::qr(self.public_key.as_bytes()).map_err(Error::crypto)
    }
}

/// Returns true to accept the peer.
pub type ConfirmFn = Arc<dyn Fn(&PeerReview) -> bool + Send + Sync>;

/// Parse the key an introduction claims.
pub fn introduced_key(intro: &Introduction) -> Result<PublicKey> {
    let algorithm = Algorithm::from_id(intro.algorithm).map_err(Error::protocol)?;
    PublicKey::from_bytes(algorithm, &intro.public_key).map_err(Error::protocol)
}

fn remember(storage: &Storage, intro: &Introduction, key: &PublicKey) -> Result<()> {
    storage.store_peer(&Peer::new(intro.name.clone(), key))?;
    info!(peer = %key.peer_id(), name = %intro.name, "stored new peer");
    Ok(())
}

fn rejected(key: &PublicKey) -> Error {
    Error::auth(format!("peer {} was rejected", key.peer_id()))
}

/// Every peer, known or not, goes through the callback.
pub struct StrictVerifier {
    confirm: ConfirmFn,
}

impl StrictVerifier {
    pub fn new(confirm: impl Fn(&PeerReview) -> bool + Send + Sync + 'static) -> Self {
        Self {
            confirm: Arc::new(confirm),
        }
    }
}

impl RemoteVerifier for StrictVerifier {
    fn verify(&self, storage: &Storage, intro: &Introduction) -> Result<()> {
        let key = introduced_key(intro)?;
        let known = storage.find_peer(&key)?;

        if !(self.confirm)(&PeerReview::new(intro, &key, known.as_ref())) {
            return Err(rejected(&key));
        }
        if known.is_none() {
            remember(storage, intro, &key)?;
        }
        Ok(())
    }
}

/// Known peers pass silently; new ones go through the callback.
pub struct QuickVerifier {
    confirm: ConfirmFn,
}

impl QuickVerifier {
    pub fn new(confirm: impl Fn(&PeerReview) -> bool + Send + Sync + 'static) -> Self {
        Self {
            confirm: Arc::new(confirm),
        }
    }
}

impl RemoteVerifier for QuickVerifier {
    fn verify(&self, storage: &Storage, intro: &Introduction) -> Result<()> {
        let key = introduced_key(intro)?;
        if storage.find_peer(&key)?.is_some() {
            return Ok(());
        }

        if !(self.confirm)(&PeerReview::new(intro, &key, None)) {
            return Err(rejected(&key));
        }
        remember(storage, intro, &key)
    }
}

/// Accepts everyone. Only for tests and trusted networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcceptVerifier;

impl RemoteVerifier for AutoAcceptVerifier {
    fn verify(&self, storage: &Storage, intro: &Introduction) -> Result<()> {
        let key = introduced_key(intro)?;
        if storage.find_peer(&key)?.is_none() {
            warn!(peer = %key.peer_id(), name = %intro.name, "auto-accepting unknown peer");
            remember(storage, intro, &key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use kestrel_crypto::Identity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn intro_for(identity: &Identity) -> Introduction {
        Introduction {
            name: "eager comet".into(),
            public_key: identity.public_key().as_bytes().to_vec(),
            algorithm: identity.algorithm().id(),
            padding: Vec::new(),
        }
    }

    fn storage(dir: &TempDir) -> Storage {
        Storage::open(&StorageConfig::new(dir.path(), "pw")).unwrap()
    }

    #[test]
    fn test_quick_prompts_once() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let verifier = QuickVerifier::new(move |review| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(!review.is_known());
            assert_eq!(review.emoji.len(), 8);
            assert!(!review.qr().unwrap().is_empty());
            true
        });

        let intro = intro_for(&Identity::generate(Algorithm::Ed25519));
        verifier.verify(&storage, &intro).unwrap();
        verifier.verify(&storage, &intro).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strict_always_prompts() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let verifier = StrictVerifier::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let intro = intro_for(&Identity::generate(Algorithm::Ed25519));
        verifier.verify(&storage, &intro).unwrap();
        verifier.verify(&storage, &intro).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
        assert_eq!(storage.list_peers().unwrap().len(), 1);
    }

    #[test]
    fn test_rejection_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let verifier = QuickVerifier::new(|_| false);

        let intro = intro_for(&Identity::generate(Algorithm::Ed25519));
        assert!(matches!(
            verifier.verify(&storage, &intro),
            Err(Error::Authentication(_))
        ));
        assert!(storage.list_peers().unwrap().is_empty());
    }

    #[test]
    fn test_auto_accept_stores_peer() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let identity = Identity::generate(Algorithm::Ed25519);

        AutoAcceptVerifier.verify(&storage, &intro_for(&identity)).unwrap();
        assert!(storage.find_peer(&identity.public_key()).unwrap().is_some());
    }

    #[test]
    fn test_mldsa_peer_remembered() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let identity = Identity::generate(Algorithm::MlDsa);
        let verifier = QuickVerifier::new(|review| review.algorithm == Algorithm::MlDsa);

        verifier.verify(&storage, &intro_for(&identity)).unwrap();
        let peer = storage.find_peer(&identity.public_key()).unwrap().unwrap();
        assert_eq!(peer.name, "eager comet");
    }

    #[test]
    fn test_malformed_introduction() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let intro = Introduction {
            name: "x".into(),
            public_key: vec![1, 2, 3],
            algorithm: 1,
            padding: Vec::new(),
        };
        assert!(matches!(
            AutoAcceptVerifier.verify(&storage, &intro),
            Err(Error::Protocol(_))
        ));
    }
}
