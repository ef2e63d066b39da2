#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use kestrel::{
    fingerprint, Algorithm, Dialer, PublicKey, Route, Server, StorageConfig, Transport,
    TransportKind,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Substrate {
    Tcp,
    Udp,
}

impl From<Substrate> for TransportKind {
    fn from(s: Substrate) -> Self {
        match s {
            Substrate::Tcp => TransportKind::Tcp,
            Substrate::Udp => TransportKind::ReliableUdp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kestrel-echo", about = "Echo peer over Kestrel sessions")]
struct Args {
    #[arg(long, env = "KESTREL_ECHO_MODE", value_enum, default_value = "server")]
    mode: Mode,

    /// Listen address (server) or remote address (client).
    #[arg(long, env = "KESTREL_ECHO_ADDR", default_value = "127.0.0.1:7700")]
    addr: SocketAddr,

    #[arg(long, env = "KESTREL_ECHO_TRANSPORT", value_enum, default_value = "tcp")]
    transport: Substrate,

    #[arg(long, env = "KESTREL_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "KESTREL_DB_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    /// Signature scheme of this peer's identity: ed25519 or mldsa.
    #[arg(long, env = "KESTREL_DB_ALGORITHM", default_value = "ed25519")]
    algorithm: Algorithm,

    /// Print this peer's key as a QR code on startup (server).
    #[arg(long)]
    qr: bool,

    /// Display name sent to peers.
    #[arg(long, env = "KESTREL_ECHO_NAME")]
    name: Option<String>,

    /// Hex public key of the server; enables session resumption (client).
    #[arg(long, env = "KESTREL_ECHO_SERVER_KEY")]
    server_key: Option<String>,

    /// Message to send (client).
    #[arg(long, default_value = "hello")]
    message: String,

    /// How many times to send the message (client).
    #[arg(long, default_value_t = 1)]
    count: u32,
}

impl Args {
    fn storage_config(&self) -> Result<StorageConfig> {
        let path = match &self.db_path {
            Some(path) => path.clone(),
            None => StorageConfig::from_env()
                .context("no storage path configured")?
                .path,
        };
        Ok(StorageConfig::new(path, self.passphrase.clone()).with_algorithm(self.algorithm))
    }
}

async fn echo(transport: Arc<Transport>) -> kestrel::Result<()> {
    let mut buf = Vec::new();
    loop {
        match transport.receive(&mut buf).await {
            Ok(meta) => {
                info!(
                    session_id = %transport.session_id(),
                    sequence = meta.sequence,
                    bytes = buf.len(),
                    "echoing"
                );
                transport.send(&buf, meta.route).await?;
            }
            Err(e) if e.is_closed() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

async fn run_server(args: Args) -> Result<()> {
    let mut server = Server::new(args.addr, echo)
        .with_storage_config(args.storage_config()?)
        .with_transport_kind(args.transport.into());
    if let Some(name) = args.name {
        server = server.with_name(name);
    }

    let bound = server.bind().await.context("failed to bind")?;
    let key = bound.public_key();
    info!(
        addr = %bound.local_addr(),
        peer = %key.peer_id(),
        key = %hex::encode(key.as_bytes()),
        "echo server ready"
    );
    if args.qr {
        println!("{}", fingerprint::qr(key.as_bytes())?);
    }

    bound
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn run_client(args: Args) -> Result<()> {
    let mut dialer = Dialer::new(args.addr)
        .with_storage_config(args.storage_config()?)
        .with_transport_kind(args.transport.into())
        .with_read_timeout(Duration::from_secs(30));
    if let Some(name) = args.name.clone() {
        dialer = dialer.with_name(name);
    }

    let transport = match &args.server_key {
        Some(key) => {
            let bytes = hex::decode(key).context("server key is not hex")?;
            let algorithm = Algorithm::for_public_key(&bytes)
                .ok_or_else(|| anyhow!("server key has an unknown length ({} bytes)", bytes.len()))?;
            let key = PublicKey::from_bytes(algorithm, &bytes)
                .map_err(|e| anyhow!("invalid server key: {}", e))?;
            let (transport, resumed) = dialer.dial_with_resume(&key).await?;
            info!(resumed, "connected");
            transport
        }
        None => dialer.dial().await?,
    };
    info!(
        session_id = %transport.session_id(),
        peer = %transport.remote_public_key().peer_id(),
        "session ready"
    );

    let mut buf = Vec::new();
    for _ in 0..args.count {
        let sent = transport
            .send(args.message.as_bytes(), Route::ExchangeMessages)
            .await?;
        let received = transport.receive(&mut buf).await?;
        println!(
            "#{} -> #{}: {}",
            sent.sequence,
            received.sequence,
            String::from_utf8_lossy(&buf)
        );
    }

    transport.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    kestrel_common::init_tracing();
    let args = Args::parse();

    match args.mode {
        Mode::Server => run_server(args).await,
        Mode::Client => run_client(args).await,
    }
}
