//! Framed duplex connections over TCP or reliable UDP.
//!
//! Both substrates are byte streams; [`kestrel_core::frame`] turns them into
//! message channels where one `write` is observed as exactly one `read`.
//! Both halves are cancel-safe. The reader accumulates bytes in a buffer it
//! owns, and the writer queues whole frames before writing them out, so a
//! read or write abandoned by a timeout leaves the framing intact.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kestrel_common::{Error, Result};
use kestrel_core::{decode_frame, encode_frame, MAX_FRAME_SIZE};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};
use tracing::debug;

use crate::config::TransportKind;

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::timeout(format!("{} timed out after {:?}", what, deadline)))?
}

fn kcp_config() -> KcpConfig {
    KcpConfig {
        stream: true,
        ..Default::default()
    }
}

fn tune_tcp(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("failed to enable keepalive: {}", e);
    }
}

/// Read half of a framed connection.
pub struct FrameReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    buf: BytesMut,
}

impl FrameReader {
    fn new(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Next complete frame.
    ///
    /// EOF between frames is [`Error::Closed`]; EOF inside a frame is a
    /// connection error.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf).map_err(Error::protocol)? {
                return Ok(frame);
            }

            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(Error::connection)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(Error::Closed);
                }
                return Err(Error::connection("connection closed mid-frame"));
            }
        }
    }
}

/// Write half of a framed connection.
///
/// Frames are queued in full before any byte is written. A write cut short
/// by a deadline leaves the rest of its frame queued, and the next
/// [`FrameWriter::flush`] finishes it before anything newer goes out.
pub struct FrameWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    pending: BytesMut,
}

impl FrameWriter {
    fn new(inner: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    /// Append one encoded frame to the outgoing queue without writing.
    pub fn queue_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload).map_err(Error::protocol)?;
        self.pending.extend_from_slice(&frame);
        Ok(())
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write out everything queued.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let n = self
                .inner
                .write_buf(&mut self.pending)
                .await
                .map_err(Error::connection)?;
            if n == 0 {
                return Err(Error::connection("connection closed while writing"));
            }
        }
        self.inner.flush().await.map_err(Error::connection)
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.queue_frame(payload)?;
        self.flush().await
    }

    /// Flush what is queued, then shut the write side down.
    pub async fn shutdown(&mut self) -> Result<()> {
        let flushed = self.flush().await;
        self.inner.shutdown().await.map_err(Error::connection)?;
        flushed
    }
}

/// A framed connection to one peer.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer_addr: SocketAddr,
    kind: TransportKind,
}

impl Connection {
    /// Dial `addr` over the chosen substrate.
    pub async fn connect(kind: TransportKind, addr: SocketAddr, deadline: Duration) -> Result<Self> {
        with_deadline(deadline, "dial", async move {
            match kind {
                TransportKind::Tcp => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(|e| Error::connection(format!("dial {}: {}", addr, e)))?;
                    Ok(Self::from_tcp(stream, addr))
                }
                TransportKind::ReliableUdp => {
                    let stream = KcpStream::connect(&kcp_config(), addr)
                        .await
                        .map_err(|e| Error::connection(format!("dial {}: {}", addr, e)))?;
                    Ok(Self::from_kcp(stream, addr))
                }
            }
        })
        .await
    }

    pub fn from_tcp(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        tune_tcp(&stream);
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(Box::new(read)),
            writer: FrameWriter::new(Box::new(write)),
            peer_addr,
            kind: TransportKind::Tcp,
        }
    }

    pub fn from_kcp(stream: KcpStream, peer_addr: SocketAddr) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(Box::new(read)),
            writer: FrameWriter::new(Box::new(write)),
            peer_addr,
            kind: TransportKind::ReliableUdp,
        }
    }

    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(payload).await
    }

    pub async fn read(&mut self) -> Result<Bytes> {
        self.reader.read_frame().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Accepting side of either substrate.
pub enum Listener {
    Tcp(TcpListener),
    ReliableUdp(KcpListener),
}

impl Listener {
    pub async fn bind(kind: TransportKind, addr: SocketAddr) -> Result<Self> {
        match kind {
            TransportKind::Tcp => TcpListener::bind(addr)
                .await
                .map(Listener::Tcp)
                .map_err(|e| Error::connection(format!("bind {}: {}", addr, e))),
            TransportKind::ReliableUdp => KcpListener::bind(kcp_config(), addr)
                .await
                .map(Listener::ReliableUdp)
                .map_err(|e| Error::connection(format!("bind {}: {}", addr, e))),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map_err(Error::connection),
            Listener::ReliableUdp(listener) => listener.local_addr().map_err(Error::connection),
        }
    }

    pub async fn accept(&mut self) -> Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(Error::connection)?;
                Ok(Connection::from_tcp(stream, addr))
            }
            Listener::ReliableUdp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(Error::connection)?;
                Ok(Connection::from_kcp(stream, addr))
            }
        }
    }
}
