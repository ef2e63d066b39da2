//! Kestrel: authenticated, forward-secret peer sessions.
//!
//! A [`Dialer`] and a [`Server`] run a mutually authenticated handshake
//! over TCP or reliable UDP and hand back a [`Transport`]: an ordered,
//! signed, double-ratchet encrypted message channel. Established sessions
//! are stored encrypted on disk and can be resumed after a disconnect
//! without a new handshake.
//!
//! ```text
//! Dialer ──┐                                ┌── Server
//!          │ Introduction / KeyExchange     │
//!          │ challenge echo                 │
//!          └─────────── Transport ──────────┘
//!                 RatchetFrame(Envelope)
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod conn;
pub mod dialer;
pub mod envelope;
mod handshake;
mod options;
pub mod resume;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;
pub mod verifier;

pub use config::{ResumptionConfig, StorageConfig, Timeouts, TransportKind};
pub use dialer::Dialer;
pub use server::{BoundServer, Server};
pub use session::{HandshakeTracker, Lookup, SessionInfo, SessionManager, SessionState, SessionStats};
pub use storage::{Peer, Storage};
pub use transport::{max_message_size, MessageMetadata, Transport, MAX_MESSAGE_SIZE};
pub use verifier::{AutoAcceptVerifier, PeerReview, QuickVerifier, RemoteVerifier, StrictVerifier};

pub use kestrel_common::{Error, Result};
pub use kestrel_core::{Route, SessionPhase};
pub use kestrel_crypto::{fingerprint, Algorithm, Identity, PeerId, PublicKey};
