//! Persisted session state and the manager that owns it.
//!
//! Sessions are keyed by the remote peer's public key, with a secondary
//! index from session id to key. Records older than the configured
//! `max_session_age` are evicted whenever they are looked up.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kestrel_common::{Error, Result};
use kestrel_core::SessionPhase;
use kestrel_crypto::{Algorithm, PublicKey, RatchetState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::config::{ResumptionConfig, HANDSHAKE_TRACKER_TIMEOUT};
use crate::storage::{Bucket, Storage};

/// Run blocking storage work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::storage(format!("storage task failed: {}", e)))?
}

mod phase_repr {
    use kestrel_core::SessionPhase;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(phase: &SessionPhase, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i32(*phase as i32)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SessionPhase, D::Error> {
        let raw = i32::deserialize(d)?;
        SessionPhase::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Everything needed to resume a session later.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub remote_public_key: Vec<u8>,
    pub algorithm: Algorithm,
    #[serde(with = "phase_repr")]
    pub phase: SessionPhase,
    /// Resumption secret. Never leaves the process except sealed on disk.
    pub shared_secret: Vec<u8>,
    pub send_sequence: u64,
    pub recv_sequence: u64,
    pub is_initiator: bool,
    pub ratchet_state: Option<RatchetState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    pub fn remote_key(&self) -> Result<PublicKey> {
        PublicKey::from_bytes(self.algorithm, &self.remote_public_key).map_err(Error::storage)
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase)
            .field("send_sequence", &self.send_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .field("is_initiator", &self.is_initiator)
            .field("has_ratchet", &self.ratchet_state.is_some())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Outcome of a lookup.
#[derive(Debug)]
pub enum Lookup {
    Found(SessionState),
    /// The record existed but was too old and has been removed.
    Expired,
    Missing,
}

impl Lookup {
    pub fn into_option(self) -> Option<SessionState> {
        match self {
            Lookup::Found(state) => Some(state),
            Lookup::Expired | Lookup::Missing => None,
        }
    }
}

/// Secret-free summary for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer_id: String,
    pub phase: String,
    pub send_sequence: u64,
    pub recv_sequence: u64,
    pub is_initiator: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub established: usize,
    pub handshaking: usize,
    pub expired: usize,
}

/// Owns persisted sessions. All methods block on disk I/O.
pub struct SessionManager {
    storage: Arc<Storage>,
    config: ResumptionConfig,
    locks: Mutex<HashMap<Vec<u8>, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(storage: Arc<Storage>, config: ResumptionConfig) -> Self {
        Self {
            storage,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResumptionConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn key_lock(&self, key: &[u8]) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::storage("session lock table poisoned"))?;
        Ok(locks.entry(key.to_vec()).or_default().clone())
    }

    fn with_key_lock<T>(&self, key: &[u8], f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.key_lock(key)?;
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(Error::storage("session lock poisoned")),
        };
        self.release_key_lock(key, lock);
        result
    }

    /// Drop the table entry for `key` once no caller holds it.
    fn release_key_lock(&self, key: &[u8], lock: Arc<Mutex<()>>) {
        drop(lock);
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }

    fn evict(&self, state: &SessionState) -> Result<()> {
        self.storage
            .delete(Bucket::Sessions, &state.remote_public_key)?;
        self.storage
            .delete(Bucket::SessionIndex, state.session_id.as_bytes())?;
        Ok(())
    }

    fn lookup_unlocked(&self, remote: &[u8]) -> Result<Lookup> {
        let Some(state) = self.storage.get::<SessionState>(Bucket::Sessions, remote)? else {
            return Ok(Lookup::Missing);
        };
        if state.is_expired(self.config.max_session_age) {
            debug!(session_id = %state.session_id, "evicting expired session");
            self.evict(&state)?;
            return Ok(Lookup::Expired);
        }
        Ok(Lookup::Found(state))
    }

    /// Persist `state`. `created_at` of an existing record for the same
    /// session is kept.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        self.with_key_lock(&state.remote_public_key, || self.save_unlocked(state.clone()))
    }

    fn save_unlocked(&self, mut state: SessionState) -> Result<()> {
        if let Some(existing) = self
            .storage
            .get::<SessionState>(Bucket::Sessions, &state.remote_public_key)?
        {
            if existing.session_id == state.session_id {
                state.created_at = existing.created_at;
            } else {
                self.storage
                    .delete(Bucket::SessionIndex, existing.session_id.as_bytes())?;
            }
        }
        state.updated_at = Utc::now();

        self.storage
            .put(Bucket::Sessions, &state.remote_public_key, &state)?;
        self.storage.put(
            Bucket::SessionIndex,
            state.session_id.as_bytes(),
            &state.remote_public_key,
        )?;
        debug!(
            session_id = %state.session_id,
            send = state.send_sequence,
            recv = state.recv_sequence,
            "session saved"
        );
        Ok(())
    }

    /// Look up by remote key, reporting whether a record expired.
    pub fn lookup(&self, remote: &[u8]) -> Result<Lookup> {
        self.with_key_lock(remote, || self.lookup_unlocked(remote))
    }

    pub fn load(&self, remote: &[u8]) -> Result<Option<SessionState>> {
        self.lookup(remote).map(Lookup::into_option)
    }

    pub fn load_by_public_key(&self, key: &PublicKey) -> Result<Option<SessionState>> {
        self.load(key.as_bytes())
    }

    pub fn load_by_session_id(&self, session_id: &str) -> Result<Option<SessionState>> {
        let Some(remote) = self
            .storage
            .get::<Vec<u8>>(Bucket::SessionIndex, session_id.as_bytes())?
        else {
            return Ok(None);
        };
        Ok(self
            .load(&remote)?
            .filter(|state| state.session_id == session_id))
    }

    /// Remove the record for `remote`. A record that no longer decrypts or
    /// parses is removed as well.
    pub fn delete(&self, remote: &[u8]) -> Result<bool> {
        self.with_key_lock(remote, || {
            match self.storage.get::<SessionState>(Bucket::Sessions, remote) {
                Ok(Some(state)) => {
                    self.evict(&state)?;
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) => {
                    warn!("removing unreadable session record: {}", e);
                    self.storage.delete(Bucket::Sessions, remote)
                }
            }
        })
    }

    /// Set the phase of an existing record; returns false if there is none.
    pub fn update_phase(&self, remote: &[u8], phase: SessionPhase) -> Result<bool> {
        self.with_key_lock(remote, || match self.lookup_unlocked(remote)? {
            Lookup::Found(mut state) => {
                state.phase = phase;
                self.save_unlocked(state)?;
                Ok(true)
            }
            Lookup::Expired | Lookup::Missing => Ok(false),
        })
    }

    /// Record new sequence numbers. Values never move backwards.
    pub fn update_sequences(&self, remote: &[u8], send: u64, recv: u64) -> Result<bool> {
        self.with_key_lock(remote, || match self.lookup_unlocked(remote)? {
            Lookup::Found(mut state) => {
                state.send_sequence = state.send_sequence.max(send);
                state.recv_sequence = state.recv_sequence.max(recv);
                self.save_unlocked(state)?;
                Ok(true)
            }
            Lookup::Expired | Lookup::Missing => Ok(false),
        })
    }

    /// Whether a resumption attempt against `remote` may be made.
    pub fn can_resume(&self, remote: &[u8]) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        Ok(self.load(remote)?.is_some_and(|state| {
            state.phase == SessionPhase::Established
                && !state.shared_secret.is_empty()
                && state.ratchet_state.is_some()
        }))
    }

    pub fn list_active(&self) -> Result<Vec<SessionState>> {
        let max_age = self.config.max_session_age;
        Ok(self
            .storage
            .list::<SessionState>(Bucket::Sessions)?
            .into_iter()
            .filter(|s| s.phase == SessionPhase::Established && !s.is_expired(max_age))
            .collect())
    }

    /// Remove every expired record; returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for state in self.storage.list::<SessionState>(Bucket::Sessions)? {
            if state.is_expired(self.config.max_session_age) {
                self.with_key_lock(&state.remote_public_key, || self.evict(&state))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up expired sessions");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<SessionStats> {
        let mut stats = SessionStats::default();
        for state in self.storage.list::<SessionState>(Bucket::Sessions)? {
            stats.total += 1;
            if state.is_expired(self.config.max_session_age) {
                stats.expired += 1;
                continue;
            }
            match state.phase {
                SessionPhase::Established => stats.established += 1,
                SessionPhase::Init | SessionPhase::Handshaking => stats.handshaking += 1,
                SessionPhase::Invalid | SessionPhase::Closed => {}
            }
        }
        Ok(stats)
    }

    pub fn session_info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.load_by_session_id(session_id)?.map(|state| SessionInfo {
            session_id: state.session_id.clone(),
            peer_id: kestrel_crypto::PeerId::from_bytes(&state.remote_public_key).to_string(),
            phase: state.phase.to_string(),
            send_sequence: state.send_sequence,
            recv_sequence: state.recv_sequence,
            is_initiator: state.is_initiator,
            created_at: state.created_at,
            updated_at: state.updated_at,
            age_secs: state.age().as_secs(),
        }))
    }

    /// Snapshot a live transport and persist it.
    pub async fn save_transport(self: &Arc<Self>, transport: &crate::Transport) -> Result<()> {
        let state = transport.snapshot().await?;
        let manager = Arc::clone(self);
        blocking(move || manager.save(&state)).await
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedHandshake {
    phase: SessionPhase,
    started: Instant,
}

/// In-flight handshakes on a server.
#[derive(Debug, Default)]
pub struct HandshakeTracker {
    entries: Mutex<HashMap<String, TrackedHandshake>>,
}

impl HandshakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id.to_string(),
                TrackedHandshake {
                    phase: SessionPhase::Handshaking,
                    started: Instant::now(),
                },
            );
        }
    }

    pub fn update(&self, id: &str, phase: SessionPhase) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(id) {
                entry.phase = phase;
            }
        }
    }

    pub fn finish(&self, id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(id);
        }
    }

    pub fn phase(&self, id: &str) -> Option<SessionPhase> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(id).map(|e| e.phase))
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Drop handshakes older than the tracker timeout.
    pub fn prune(&self) -> usize {
        self.prune_older_than(HANDSHAKE_TRACKER_TIMEOUT)
    }

    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.started.elapsed() <= max_age);
        before - entries.len()
    }
}
