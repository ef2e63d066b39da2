//! Engine configuration.
//!
//! Everything here has a usable default except the storage passphrase.
//! Options reach the dialer and server through their builder methods.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kestrel_common::{Error, Result};
use kestrel_crypto::Algorithm;
use zeroize::Zeroizing;

pub use kestrel_crypto::ratchet::DEFAULT_THRESHOLD as DEFAULT_RATCHET_THRESHOLD;

/// Deadline for the whole resumption exchange.
pub const RESUMPTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Handshakes older than this are dropped from the tracker.
pub const HANDSHAKE_TRACKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Known peers are forgotten after this long.
pub const DEFAULT_PEER_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default upper age of a resumable session.
pub const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub const ENV_DB_PATH: &str = "KESTREL_DB_PATH";
pub const ENV_DB_PASSPHRASE: &str = "KESTREL_DB_PASSPHRASE";
pub const ENV_DB_ALGORITHM: &str = "KESTREL_DB_ALGORITHM";

/// I/O deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    pub handshake: Duration,
}

impl Timeouts {
    /// Defaults used by [`crate::Dialer`].
    pub fn dialer() -> Self {
        Self {
            dial: Duration::from_secs(10),
            read: Duration::from_secs(10 * 60),
            write: Duration::from_secs(60),
            handshake: Duration::from_secs(30),
        }
    }

    /// Defaults used by [`crate::Server`] for each accepted connection.
    pub fn server() -> Self {
        Self {
            dial: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(10),
            handshake: Duration::from_secs(30),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::dialer()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumptionConfig {
    pub enabled: bool,
    /// Save sessions after a handshake so they can be resumed later.
    pub persist_sessions: bool,
    pub max_session_age: Duration,
}

impl Default for ResumptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_sessions: true,
            max_session_age: DEFAULT_MAX_SESSION_AGE,
        }
    }
}

/// Byte substrate under the framing layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Tcp,
    /// KCP over UDP.
    ReliableUdp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::ReliableUdp => f.write_str("udp"),
        }
    }
}

/// Location and unlock secret of the encrypted store.
#[derive(Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub passphrase: Zeroizing<String>,
    pub algorithm: Algorithm,
    pub peer_expiry: Duration,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.into()),
            algorithm: Algorithm::Ed25519,
            peer_expiry: DEFAULT_PEER_EXPIRY,
        }
    }

    /// Read `KESTREL_DB_PATH`, `KESTREL_DB_PASSPHRASE` and
    /// `KESTREL_DB_ALGORITHM`.
    ///
    /// The path falls back to `$HOME/.config/kestrel/db` and the algorithm to
    /// `ed25519`; the passphrase has no default.
    pub fn from_env() -> Result<Self> {
        let path = match std::env::var_os(ENV_DB_PATH) {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };
        let passphrase = std::env::var(ENV_DB_PASSPHRASE)
            .map_err(|_| Error::config(format!("{} is not set", ENV_DB_PASSPHRASE)))?;
        if passphrase.is_empty() {
            return Err(Error::config(format!("{} is empty", ENV_DB_PASSPHRASE)));
        }
        let algorithm = match std::env::var(ENV_DB_ALGORITHM) {
            Ok(name) => name
                .parse()
                .map_err(|e| Error::config(format!("{}: {}", ENV_DB_ALGORITHM, e)))?,
            Err(_) => Algorithm::Ed25519,
        };
        Ok(Self::new(path, passphrase).with_algorithm(algorithm))
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_peer_expiry(mut self, expiry: Duration) -> Self {
        self.peer_expiry = expiry;
        self
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("path", &self.path)
            .field("passphrase", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("peer_expiry", &self.peer_expiry)
            .finish()
    }
}

fn default_db_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| Error::config(format!("{} is not set and HOME is unknown", ENV_DB_PATH)))?;
    Ok(PathBuf::from(home).join(".config").join("kestrel").join("db"))
}
