//! Encrypted on-disk store for identities, known peers and sessions.
//!
//! # Layout
//!
//! ```text
//! <root>/keyring.json          Argon2id salt + wrapped data key
//! <root>/<bucket>/<hex(sha256(key))>
//! ```
//!
//! Each record is JSON sealed with the data key. The bucket name and file
//! name are bound as associated data, so a record copied to another slot no
//! longer opens. Writes go to a temporary file first and are renamed into
//! place.
//!
//! All methods are blocking. Async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use argon2::Argon2;
use chrono::{DateTime, Utc};
use kestrel_common::{Error, Result};
use kestrel_core::random_bytes;
use kestrel_crypto::{Algorithm, Identity, PublicKey, Sealer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::StorageConfig;

const KEYRING_FILE: &str = "keyring.json";
const KEYRING_AAD: &[u8] = b"kestrel/keyring";
const SALT_SIZE: usize = 16;

/// Record namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Identity,
    Peers,
    Sessions,
    SessionIndex,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Identity,
        Bucket::Peers,
        Bucket::Sessions,
        Bucket::SessionIndex,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Identity => "identity",
            Bucket::Peers => "peers",
            Bucket::Sessions => "sessions",
            Bucket::SessionIndex => "session-index",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Keyring {
    salt: String,
    wrapped_key: String,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityRecord {
    algorithm: u32,
    private_key: Vec<u8>,
}

/// A peer that has been accepted before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub public_key: Vec<u8>,
    pub algorithm: Algorithm,
    pub first_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(name: impl Into<String>, public_key: &PublicKey) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.as_bytes().to_vec(),
            algorithm: public_key.algorithm(),
            first_seen: Utc::now(),
        }
    }
}

/// Handle to an unlocked store.
pub struct Storage {
    root: PathBuf,
    sealer: Sealer,
    algorithm: Algorithm,
    peer_expiry: Duration,
}

impl Storage {
    /// Open (or create) the store at `config.path`.
    ///
    /// A wrong passphrase is reported as [`Error::Storage`].
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let root = config.path.clone();
        for bucket in Bucket::ALL {
            let dir = root.join(bucket.name());
            fs::create_dir_all(&dir)
                .map_err(|e| Error::storage(format!("create {}: {}", dir.display(), e)))?;
        }

        let data_key = load_or_create_keyring(&root, config.passphrase.as_bytes())?;
        debug!(path = %root.display(), "storage unlocked");

        Ok(Self {
            root,
            sealer: Sealer::from_key(&data_key),
            algorithm: config.algorithm,
            peer_expiry: config.peer_expiry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, bucket: Bucket, key: &[u8]) -> (PathBuf, Vec<u8>) {
        let name = hex::encode(Sha256::digest(key));
        let aad = format!("{}/{}", bucket.name(), name).into_bytes();
        (self.root.join(bucket.name()).join(name), aad)
    }

    fn read_slot<T: DeserializeOwned>(&self, path: &Path, aad: &[u8]) -> Result<T> {
        let sealed = fs::read(path)
            .map_err(|e| Error::storage(format!("read {}: {}", path.display(), e)))?;
        let plain = Zeroizing::new(
            self.sealer
                .open(&sealed, aad)
                .map_err(|_| Error::storage(format!("record {} failed to decrypt", path.display())))?,
        );
        serde_json::from_slice(&plain).map_err(Error::serialization)
    }

    /// Store `value` under `key`.
    pub fn put<T: Serialize>(&self, bucket: Bucket, key: &[u8], value: &T) -> Result<()> {
        let (path, aad) = self.slot(bucket, key);
        let plain = Zeroizing::new(serde_json::to_vec(value).map_err(Error::serialization)?);
        let sealed = self.sealer.seal(&plain, &aad).map_err(Error::crypto)?;
        write_atomic(&path, &sealed)
    }

    pub fn get<T: DeserializeOwned>(&self, bucket: Bucket, key: &[u8]) -> Result<Option<T>> {
        let (path, aad) = self.slot(bucket, key);
        if !path.exists() {
            return Ok(None);
        }
        self.read_slot(&path, &aad).map(Some)
    }

    /// Remove `key`; returns whether it existed.
    pub fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<bool> {
        let (path, _) = self.slot(bucket, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(format!("delete {}: {}", path.display(), e))),
        }
    }

    /// Every readable record in `bucket`. Undecryptable files are skipped.
    pub fn list<T: DeserializeOwned>(&self, bucket: Bucket) -> Result<Vec<T>> {
        let dir = self.root.join(bucket.name());
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::storage(format!("list {}: {}", dir.display(), e)))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let aad = format!("{}/{}", bucket.name(), name).into_bytes();
            match self.read_slot(&entry.path(), &aad) {
                Ok(value) => out.push(value),
                Err(e) => warn!(bucket = bucket.name(), "skipping unreadable record: {}", e),
            }
        }
        Ok(out)
    }

    /// Load this node's identity, generating and saving one on first use.
    pub fn identity(&self) -> Result<Identity> {
        let key = self.algorithm.name().as_bytes();
        if let Some(record) = self.get::<IdentityRecord>(Bucket::Identity, key)? {
            let algorithm = Algorithm::from_id(record.algorithm).map_err(Error::storage)?;
            return Identity::from_bytes(algorithm, &record.private_key).map_err(Error::storage);
        }

        let identity = Identity::generate(self.algorithm);
        let record = IdentityRecord {
            algorithm: self.algorithm.id(),
            private_key: identity.to_bytes().to_vec(),
        };
        self.put(Bucket::Identity, key, &record)?;
        info!(peer_id = %identity.peer_id(), "generated new identity");
        Ok(identity)
    }

    pub fn store_peer(&self, peer: &Peer) -> Result<()> {
        self.put(Bucket::Peers, &peer.public_key, peer)
    }

    /// Known peer with this key; expired entries are removed and reported missing.
    pub fn find_peer(&self, public_key: &PublicKey) -> Result<Option<Peer>> {
        let Some(peer) = self.get::<Peer>(Bucket::Peers, public_key.as_bytes())? else {
            return Ok(None);
        };
        if self.peer_expired(&peer) {
            debug!(peer = %public_key.peer_id(), "known peer expired");
            self.delete(Bucket::Peers, public_key.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(peer))
    }

    pub fn remove_peer(&self, public_key: &PublicKey) -> Result<bool> {
        self.delete(Bucket::Peers, public_key.as_bytes())
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self
            .list::<Peer>(Bucket::Peers)?
            .into_iter()
            .filter(|peer| !self.peer_expired(peer))
            .collect())
    }

    fn peer_expired(&self, peer: &Peer) -> bool {
        let age = Utc::now().signed_duration_since(peer.first_seen);
        age.to_std().map(|age| age > self.peer_expiry).unwrap_or(false)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, data).map_err(|e| Error::storage(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::storage(format!("rename {}: {}", path.display(), e))
    })
}

fn wrapping_key(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| Error::storage(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn load_or_create_keyring(root: &Path, passphrase: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let path = root.join(KEYRING_FILE);

    if path.exists() {
        let raw = fs::read(&path)
            .map_err(|e| Error::storage(format!("read {}: {}", path.display(), e)))?;
        let keyring: Keyring = serde_json::from_slice(&raw).map_err(Error::serialization)?;
        let salt = hex::decode(&keyring.salt).map_err(Error::storage)?;
        let wrapped = hex::decode(&keyring.wrapped_key).map_err(Error::storage)?;

        let kek = wrapping_key(passphrase, &salt)?;
        let plain = Zeroizing::new(
            Sealer::from_key(&kek)
                .open(&wrapped, KEYRING_AAD)
                .map_err(|_| Error::storage("wrong passphrase or corrupted keyring"))?,
        );
        let mut key = Zeroizing::new([0u8; 32]);
        if plain.len() != key.len() {
            return Err(Error::storage("keyring holds a malformed data key"));
        }
        key.copy_from_slice(&plain);
        return Ok(key);
    }

    let salt: [u8; SALT_SIZE] = random_bytes();
    let data_key = Zeroizing::new(random_bytes::<32>());
    let kek = wrapping_key(passphrase, &salt)?;
    let wrapped = Sealer::from_key(&kek)
        .seal(&data_key[..], KEYRING_AAD)
        .map_err(Error::crypto)?;

    let keyring = Keyring {
        salt: hex::encode(salt),
        wrapped_key: hex::encode(wrapped),
    };
    let raw = serde_json::to_vec_pretty(&keyring).map_err(Error::serialization)?;
    write_atomic(&path, &raw)?;
    info!(path = %root.display(), "created new keyring");
    Ok(data_key)
}
