//! Client side entry point.
//!
//! ```no_run
//! # async fn demo() -> kestrel::Result<()> {
//! use kestrel::{Dialer, Route, StorageConfig};
//!
//! let dialer = Dialer::new("127.0.0.1:7700".parse().unwrap())
//!     .with_storage_config(StorageConfig::new("/tmp/kestrel", "secret"));
//! let transport = dialer.dial().await?;
//! transport.send(b"hello", Route::ExchangeMessages).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use kestrel_common::{Error, Result};
use kestrel_crypto::PublicKey;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::conn::{with_deadline, Connection};
use crate::handshake::{self, HandshakeContext};
use crate::options::{option_builders, Options};
use crate::resume;
use crate::session::{blocking, SessionManager};
use crate::transport::Transport;

/// Opens sessions to one remote address.
///
/// Storage is opened and the identity loaded on first use, then reused by
/// every later dial.
pub struct Dialer {
    addr: SocketAddr,
    options: Options,
    context: OnceCell<HandshakeContext>,
}

impl Dialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            options: Options::new(Timeouts::dialer()),
            context: OnceCell::new(),
        }
    }

    option_builders!();

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn context(&self) -> Result<&HandshakeContext> {
        self.context
            .get_or_try_init(|| self.options.context(self.options.timeouts))
            .await
    }

    /// The session store used by this dialer.
    pub async fn session_manager(&self) -> Result<Arc<SessionManager>> {
        self.context()
            .await?
            .sessions
            .clone()
            .ok_or_else(|| Error::config("session persistence is unavailable"))
    }

    /// Run a fresh handshake.
    pub async fn dial(&self) -> Result<Transport> {
        let ctx = self.context().await?;
        self.dial_fresh(ctx, None).await
    }

    async fn dial_fresh(
        &self,
        ctx: &HandshakeContext,
        expected: Option<&PublicKey>,
    ) -> Result<Transport> {
        debug!(addr = %self.addr, kind = %self.options.kind, "dialing");
        let timeouts = self.options.timeouts;
        with_deadline(timeouts.handshake, "handshake", async {
            let conn = Connection::connect(self.options.kind, self.addr, timeouts.dial).await?;
            handshake::initiate(ctx, conn, expected).await
        })
        .await
    }

    /// Resume the stored session with `remote`, or run a fresh handshake.
    ///
    /// Returns the transport and whether it was resumed. A failed
    /// resumption is never reported; only a failed fresh handshake is.
    pub async fn dial_with_resume(&self, remote: &PublicKey) -> Result<(Transport, bool)> {
        let ctx = self.context().await?;
        let Some(sessions) = ctx.sessions.clone() else {
            return Ok((self.dial_fresh(ctx, Some(remote)).await?, false));
        };

        let lookup = {
            let sessions = Arc::clone(&sessions);
            let key = remote.as_bytes().to_vec();
            blocking(move || {
                if sessions.can_resume(&key)? {
                    sessions.load(&key)
                } else {
                    Ok(None)
                }
            })
            .await
        };
        let state = match lookup {
            Ok(state) => state,
            Err(e) => {
                warn!(peer = %remote.peer_id(), "stored session is unreadable: {}", e);
                forget(&sessions, remote).await;
                None
            }
        };
        let Some(state) = state else {
            debug!(peer = %remote.peer_id(), "no resumable session");
            return Ok((self.dial_fresh(ctx, Some(remote)).await?, false));
        };

        let session_id = state.session_id.clone();
        let attempt = async {
            let conn =
                Connection::connect(self.options.kind, self.addr, self.options.timeouts.dial).await?;
            resume::initiate(ctx, conn, state).await
        };
        match attempt.await {
            Ok(transport) => Ok((transport, true)),
            Err(e) => {
                warn!(session_id = %session_id, "resumption failed, running a fresh handshake: {}", e);
                if !e.is_retryable() {
                    forget(&sessions, remote).await;
                }
                let transport = self.dial_fresh(ctx, Some(remote)).await?;
                info!(session_id = %transport.session_id(), "replaced stale session");
                Ok((transport, false))
            }
        }
    }
}

async fn forget(sessions: &Arc<SessionManager>, remote: &PublicKey) {
    let sessions = Arc::clone(sessions);
    let key = remote.as_bytes().to_vec();
    if let Err(e) = blocking(move || sessions.delete(&key)).await {
        warn!("failed to drop stale session: {}", e);
    }
}
