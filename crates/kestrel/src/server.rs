//! Accept loop.
//!
//! Each accepted connection runs in its own task. The route of the first
//! envelope picks the path: `Identity` (or the legacy `Invalid`) starts a
//! fresh handshake, `Reconnect` starts resumption. Once a transport is
//! established it is handed to the handler and closed when the handler
//! returns.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::{Error, Result};
use kestrel_core::{Route, SessionPhase};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Timeouts;
use crate::conn::{with_deadline, Connection, Listener};
use crate::handshake::{self, HandshakeContext};
use crate::options::{option_builders, Options};
use crate::resume;
use crate::session::HandshakeTracker;
use crate::transport::Transport;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server<H> {
    addr: SocketAddr,
    options: Options,
    handshake_timeouts: Timeouts,
    handler: H,
}

impl<H, Fut> Server<H>
where
    H: Fn(Arc<Transport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// `handler` is called once per established transport.
    pub fn new(addr: SocketAddr, handler: H) -> Self {
        Self {
            addr,
            options: Options::new(Timeouts::dialer()),
            handshake_timeouts: Timeouts::server(),
            handler,
        }
    }

    option_builders!();

    /// Deadlines for handshake messages on accepted connections.
    pub fn with_handshake_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.handshake_timeouts = timeouts;
        self
    }

    pub async fn bind(self) -> Result<BoundServer<H>> {
        let ctx = self.options.context(self.handshake_timeouts).await?;
        let listener = Listener::bind(self.options.kind, self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            kind = %self.options.kind,
            peer = %ctx.identity.peer_id(),
            "listening"
        );
        Ok(BoundServer {
            listener,
            local_addr,
            ctx: Arc::new(ctx),
            handler: Arc::new(self.handler),
            tracker: Arc::new(HandshakeTracker::new()),
        })
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run().await
    }
}

pub struct BoundServer<H> {
    listener: Listener,
    local_addr: SocketAddr,
    ctx: Arc<HandshakeContext>,
    handler: Arc<H>,
    tracker: Arc<HandshakeTracker>,
}

impl<H, Fut> BoundServer<H>
where
    H: Fn(Arc<Transport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Public key this server introduces itself with.
    pub fn public_key(&self) -> kestrel_crypto::PublicKey {
        self.ctx.identity.public_key()
    }

    pub fn handshakes_in_flight(&self) -> usize {
        self.tracker.active_count()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// running in their own tasks.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let pruned = self.tracker.prune();
                    if pruned > 0 {
                        debug!(pruned, "dropped stale handshakes");
                    }

                    let span = info_span!("conn", peer = %conn.peer_addr());
                    tokio::spawn(
                        serve(
                            Arc::clone(&self.ctx),
                            Arc::clone(&self.handler),
                            Arc::clone(&self.tracker),
                            conn,
                        )
                        .instrument(span),
                    );
                }
            }
        }
    }
}

async fn serve<H, Fut>(
    ctx: Arc<HandshakeContext>,
    handler: Arc<H>,
    tracker: Arc<HandshakeTracker>,
    conn: Connection,
) where
    H: Fn(Arc<Transport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let id = uuid::Uuid::new_v4().to_string();
    tracker.begin(&id);
    let outcome = with_deadline(
        ctx.timeouts.handshake,
        "handshake",
        accept(&ctx, &tracker, &id, conn),
    )
    .await;
    tracker.finish(&id);

    let transport = match outcome {
        Ok(transport) => Arc::new(transport),
        Err(e) if e.is_closed() => {
            debug!("peer left before completing a session");
            return;
        }
        Err(e) => {
            warn!("session setup failed: {}", e);
            return;
        }
    };

    let session_id = transport.session_id().to_string();
    if let Err(e) = handler(Arc::clone(&transport)).await {
        warn!(session_id = %session_id, "handler failed: {}", e);
    }
    if let Err(e) = transport.close().await {
        debug!(session_id = %session_id, "close failed: {}", e);
    }
}

async fn accept(
    ctx: &HandshakeContext,
    tracker: &HandshakeTracker,
    id: &str,
    mut conn: Connection,
) -> Result<Transport> {
    let first = ctx.read(&mut conn).await?;
    match first.route() {
        Route::Identity | Route::Invalid => {
            tracker.update(id, SessionPhase::Handshaking);
            handshake::respond(ctx, conn, first).await
        }
        Route::Reconnect => {
            tracker.update(id, SessionPhase::Handshaking);
            resume::respond(ctx, conn, first).await
        }
        other => Err(Error::protocol(format!(
            "connection opened with route {}",
            other
        ))),
    }
}
