//! Options shared by [`crate::Dialer`] and [`crate::Server`].

use std::sync::Arc;

use kestrel_common::{Error, Result};
use kestrel_crypto::fingerprint;
use tracing::debug;

use crate::config::{ResumptionConfig, StorageConfig, Timeouts, TransportKind, DEFAULT_RATCHET_THRESHOLD};
use crate::handshake::HandshakeContext;
use crate::session::{blocking, SessionManager};
use crate::storage::Storage;
use crate::verifier::{AutoAcceptVerifier, RemoteVerifier};

#[derive(Clone)]
pub(crate) struct Options {
    pub storage: Option<Arc<Storage>>,
    pub storage_config: Option<StorageConfig>,
    pub verifier: Arc<dyn RemoteVerifier>,
    pub timeouts: Timeouts,
    pub ratchet_threshold: u64,
    pub resumption: ResumptionConfig,
    pub kind: TransportKind,
    pub name: Option<String>,
}

impl Options {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            storage: None,
            storage_config: None,
            verifier: Arc::new(AutoAcceptVerifier),
            timeouts,
            ratchet_threshold: DEFAULT_RATCHET_THRESHOLD,
            resumption: ResumptionConfig::default(),
            kind: TransportKind::default(),
            name: None,
        }
    }

    async fn open_storage(&self) -> Result<Arc<Storage>> {
        if let Some(storage) = &self.storage {
            return Ok(Arc::clone(storage));
        }
        let config = match &self.storage_config {
            Some(config) => config.clone(),
            None => StorageConfig::from_env()?,
        };
        debug!(path = %config.path.display(), "opening storage");
        let storage = blocking(move || Storage::open(&config)).await?;
        Ok(Arc::new(storage))
    }

    /// Open storage, load the identity and assemble a handshake context.
    ///
    /// `handshake` bounds individual handshake messages; the established
    /// transport gets `self.timeouts`.
    pub async fn context(&self, handshake: Timeouts) -> Result<HandshakeContext> {
        if self.ratchet_threshold == 0 {
            return Err(Error::config("ratchet threshold must be at least 1"));
        }
        let storage = self.open_storage().await?;
        let identity = {
            let storage = Arc::clone(&storage);
            blocking(move || storage.identity()).await?
        };
        let sessions = Arc::new(SessionManager::new(Arc::clone(&storage), self.resumption));

        Ok(HandshakeContext {
            identity: Arc::new(identity),
            name: self.name.clone().unwrap_or_else(fingerprint::pseudonym),
            storage,
            verifier: Arc::clone(&self.verifier),
            timeouts: handshake,
            transport_timeouts: self.timeouts,
            ratchet_threshold: self.ratchet_threshold,
            sessions: Some(sessions),
        })
    }
}

/// Builder methods for a type holding an `options: Options` field.
macro_rules! option_builders {
    () => {
        /// Use an already opened store.
        pub fn with_storage(mut self, storage: std::sync::Arc<$crate::Storage>) -> Self {
            self.options.storage = Some(storage);
            self
        }

        /// Open the store described by `config` instead of reading the environment.
        pub fn with_storage_config(mut self, config: $crate::StorageConfig) -> Self {
            self.options.storage_config = Some(config);
            self
        }

        pub fn with_verifier(mut self, verifier: impl $crate::RemoteVerifier + 'static) -> Self {
            self.options.verifier = std::sync::Arc::new(verifier);
            self
        }

        pub fn with_timeouts(mut self, timeouts: $crate::Timeouts) -> Self {
            self.options.timeouts = timeouts;
            self
        }

        pub fn with_dial_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.options.timeouts.dial = timeout;
            self
        }

        pub fn with_read_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.options.timeouts.read = timeout;
            self
        }

        pub fn with_write_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.options.timeouts.write = timeout;
            self
        }

        /// Messages sent on one chain before it is rotated.
        pub fn with_ratchet_threshold(mut self, threshold: u64) -> Self {
            self.options.ratchet_threshold = threshold;
            self
        }

        pub fn with_resumption(mut self, config: $crate::ResumptionConfig) -> Self {
            self.options.resumption = config;
            self
        }

        pub fn with_transport_kind(mut self, kind: $crate::TransportKind) -> Self {
            self.options.kind = kind;
            self
        }

        /// Display name sent in the introduction. Defaults to a random pseudonym.
        pub fn with_name(mut self, name: impl Into<String>) -> Self {
            self.options.name = Some(name.into());
            self
        }
    };
}

pub(crate) use option_builders;
