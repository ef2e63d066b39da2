use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel::conn::Connection;
use kestrel::resume::REASON_EXPIRED;
use kestrel::{
    envelope, max_message_size, Algorithm, Dialer, Error, Identity, PublicKey, QuickVerifier, ResumptionConfig,
    Route, Server, SessionPhase, Storage, StorageConfig, Transport, TransportKind,
};
use kestrel_core::{ReconnectRequest, ReconnectResponse};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const GUARD: Duration = Duration::from_secs(20);

fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig::new(dir.path(), "correct horse")
}

async fn echo(transport: Arc<Transport>) -> kestrel::Result<()> {
    let mut buf = Vec::new();
    loop {
        match transport.receive(&mut buf).await {
            Ok(meta) => {
                transport.send(&buf, meta.route).await?;
            }
            Err(e) if e.is_closed() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

struct EchoServer {
    addr: SocketAddr,
    key: PublicKey,
    /// Session id of each served transport, sent once its handler returned.
    finished: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<kestrel::Result<()>>,
}

impl EchoServer {
    async fn start(dir: &TempDir, kind: TransportKind, resumption: ResumptionConfig) -> Self {
        let (tx, finished) = mpsc::unbounded_channel();
        let handler = move |transport: Arc<Transport>| {
            let tx = tx.clone();
            async move {
                let session_id = transport.session_id().to_string();
                let outcome = echo(transport).await;
                let _ = tx.send(session_id);
                outcome
            }
        };
        let server = Server::new("127.0.0.1:0".parse().unwrap(), handler)
            .with_storage_config(storage_config(dir))
            .with_transport_kind(kind)
            .with_resumption(resumption)
            .with_name("echo")
            .bind()
            .await
            .unwrap();

        Self {
            addr: server.local_addr(),
            key: server.public_key(),
            finished,
            task: tokio::spawn(server.run()),
        }
    }

    async fn wait_finished(&mut self) -> String {
        timeout(GUARD, self.finished.recv()).await.unwrap().unwrap()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn round_trip(transport: &Transport, data: &[u8]) -> Vec<u8> {
    transport.send(data, Route::ExchangeMessages).await.unwrap();
    let mut buf = Vec::new();
    let meta = timeout(GUARD, transport.receive(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.route, Route::ExchangeMessages);
    buf
}

#[tokio::test]
async fn test_hello_round_trip() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;

    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    assert!(transport.is_established());
    assert!(transport.is_initiator());
    assert_eq!(transport.remote_public_key(), &server.key);

    assert_eq!(round_trip(&transport, b"hello").await, b"hello");

    let session_id = transport.session_id().to_string();
    transport.close().await.unwrap();
    assert_eq!(server.wait_finished().await, session_id);

    assert!(matches!(
        transport.send(b"late", Route::ExchangeMessages).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_messages_arrive_in_order_with_sequences() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;

    // A small threshold exercises several chain rotations.
    let dialer = Dialer::new(server.addr)
        .with_storage_config(storage_config(&client_dir))
        .with_ratchet_threshold(3);
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();

    let (first_send, _) = transport.sequences();
    for i in 0..20u64 {
        let body = format!("message {}", i);
        let sent = transport
            .send(body.as_bytes(), Route::ExchangeMessages)
            .await
            .unwrap();
        assert_eq!(sent.sequence, first_send + i);
    }

    let mut buf = Vec::new();
    let mut last = None;
    for i in 0..20u64 {
        let meta = timeout(GUARD, transport.receive(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, format!("message {}", i).as_bytes());
        if let Some(last) = last {
            assert_eq!(meta.sequence, last + 1);
        }
        last = Some(meta.sequence);
    }
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_resume_continues_sequences() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr)
        .with_storage_config(storage_config(&client_dir))
        .with_ratchet_threshold(4);

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    for i in 0..6u8 {
        assert_eq!(round_trip(&first, &[i; 16]).await, vec![i; 16]);
    }
    let session_id = first.session_id().to_string();
    let before = first.sequences();
    first.close().await.unwrap();
    assert_eq!(server.wait_finished().await, session_id);

    let (resumed, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(was_resumed);
    assert_eq!(resumed.session_id(), session_id);
    assert_eq!(resumed.sequences(), before);

    let sent = resumed
        .send(b"after resume", Route::ExchangeMessages)
        .await
        .unwrap();
    assert_eq!(sent.sequence, before.0);
    let mut buf = Vec::new();
    let echoed = timeout(GUARD, resumed.receive(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, b"after resume");
    assert_eq!(echoed.sequence, before.1);

    resumed.close().await.unwrap();
}

#[tokio::test]
async fn test_unestablished_session_dials_fresh() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let old_id = first.session_id().to_string();
    first.close().await.unwrap();
    server.wait_finished().await;

    let sessions = dialer.session_manager().await.unwrap();
    assert!(sessions
        .update_phase(server.key.as_bytes(), SessionPhase::Handshaking)
        .unwrap());
    assert!(!sessions.can_resume(server.key.as_bytes()).unwrap());

    let (fresh, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(!was_resumed);
    assert_ne!(fresh.session_id(), old_id);
    assert_eq!(round_trip(&fresh, b"fresh").await, b"fresh");
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_expired_session_is_rejected() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let resumption = ResumptionConfig {
        max_session_age: Duration::from_millis(300),
        ..ResumptionConfig::default()
    };
    let mut server = EchoServer::start(&server_dir, TransportKind::Tcp, resumption).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let session_id = first.session_id().to_string();
    let (send, recv) = first.sequences();
    first.close().await.unwrap();
    server.wait_finished().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Replay what a resuming client would send once the server has aged it out.
    let identity = Storage::open(&storage_config(&client_dir))
        .unwrap()
        .identity()
        .unwrap();
    let request = ReconnectRequest {
        session_id,
        last_phase: SessionPhase::Established as i32,
        last_send_sequence: send,
        last_recv_sequence: recv,
        remote_public_key: identity.public_key().as_bytes().to_vec(),
        resume_challenge: vec![9; 32],
    };
    let mut conn = Connection::connect(TransportKind::Tcp, server.addr, GUARD)
        .await
        .unwrap();
    envelope::send_signed(&mut conn, &identity, Route::Reconnect, &request, 0)
        .await
        .unwrap();
    let reply = timeout(GUARD, envelope::read_envelope(&mut conn))
        .await
        .unwrap()
        .unwrap();
    let response: ReconnectResponse = envelope::open(&reply, &server.key).unwrap();
    assert!(!response.accepted);
    assert_eq!(response.error_message, REASON_EXPIRED);
    let _ = conn.close().await;

    // The dialer falls back to a fresh handshake on its own.
    let (fresh, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(!was_resumed);
    assert_eq!(round_trip(&fresh, b"again").await, b"again");
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_peer_fails_dial() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;

    let dialer = Dialer::new(server.addr)
        .with_storage_config(storage_config(&client_dir))
        .with_verifier(QuickVerifier::new(|review| review.name != "echo"));
    let err = timeout(GUARD, dialer.dial()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_reliable_udp_round_trip() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = EchoServer::start(
        &server_dir,
        TransportKind::ReliableUdp,
        ResumptionConfig::default(),
    )
    .await;

    let dialer = Dialer::new(server.addr)
        .with_storage_config(storage_config(&client_dir))
        .with_transport_kind(TransportKind::ReliableUdp);
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    assert_eq!(transport.kind(), TransportKind::ReliableUdp);
    assert_eq!(round_trip(&transport, b"over udp").await, b"over udp");
    transport.close().await.unwrap();
}

/// Forwards one connection, flipping the last byte of the next chunk from
/// the server once `armed` is set.
async fn tampering_proxy(upstream: SocketAddr, armed: Arc<AtomicBool>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (client, _) = listener.accept().await.unwrap();
        let server = TcpStream::connect(upstream).await.unwrap();
        let (mut client_read, mut client_write) = client.into_split();
        let (mut server_read, mut server_write) = server.into_split();

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
        });

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match server_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if armed.swap(false, Ordering::SeqCst) {
                buf[n - 1] ^= 0x01;
            }
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_timed_out_send_is_delivered_once() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();

    // The handler reads nothing until released, so the client's writes stall.
    let release = Arc::new(Notify::new());
    let (tx, mut report) = mpsc::unbounded_channel();
    let gate = Arc::clone(&release);
    let handler = move |transport: Arc<Transport>| {
        let gate = Arc::clone(&gate);
        let tx = tx.clone();
        async move {
            gate.notified().await;
            let mut buf = Vec::new();
            let mut sequences = Vec::new();
            let mut last = Vec::new();
            loop {
                match transport.receive(&mut buf).await {
                    Ok(meta) => {
                        sequences.push(meta.sequence);
                        last = buf.clone();
                    }
                    Err(e) if e.is_closed() => break,
                    Err(e) => return Err(e),
                }
            }
            let _ = tx.send((sequences, last));
            Ok(())
        }
    };
    let server = Server::new("127.0.0.1:0".parse().unwrap(), handler)
        .with_storage_config(storage_config(&server_dir))
        .bind()
        .await
        .unwrap();
    let addr = server.local_addr();
    let task = tokio::spawn(server.run());

    let dialer = Dialer::new(addr)
        .with_storage_config(storage_config(&client_dir))
        .with_write_timeout(Duration::from_millis(200));
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let (first, _) = transport.sequences();

    let body = vec![5u8; 8 * 1024];
    let mut attempted = 0u64;
    loop {
        attempted += 1;
        match transport.send(&body, Route::ExchangeMessages).await {
            Ok(meta) => assert_eq!(meta.sequence, first + attempted - 1),
            Err(e) => {
                assert!(matches!(e, Error::Timeout(_)));
                break;
            }
        }
        assert!(attempted < 100_000, "writes never stalled");
    }
    // The timed out message is committed, not lost.
    assert_eq!(transport.sequences().0, first + attempted);

    release.notify_one();
    timeout(GUARD, transport.flush()).await.unwrap().unwrap();
    let sent = transport
        .send(b"last", Route::ExchangeMessages)
        .await
        .unwrap();
    assert_eq!(sent.sequence, first + attempted);
    transport.close().await.unwrap();

    let (sequences, last) = timeout(GUARD, report.recv()).await.unwrap().unwrap();
    assert_eq!(sequences.len() as u64, attempted + 1);
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(last, b"last");
    task.abort();
}

#[tokio::test]
async fn test_send_while_receive_pending() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));
    let transport = Arc::new(timeout(GUARD, dialer.dial()).await.unwrap().unwrap());

    let reader = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut buf = Vec::new();
            transport.receive(&mut buf).await.map(|_| buf)
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (send, _) = transport.sequences();
    let snapshot = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.snapshot().await.map(|s| s.send_sequence) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent = timeout(
        Duration::from_secs(3),
        transport.send(b"ping", Route::ExchangeMessages),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sent.sequence, send);

    let echoed = timeout(GUARD, reader).await.unwrap().unwrap().unwrap();
    assert_eq!(echoed, b"ping");
    let snapshot_send = timeout(GUARD, snapshot).await.unwrap().unwrap().unwrap();
    assert_eq!(snapshot_send, send + 1);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_session_dials_fresh() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let old_id = first.session_id().to_string();
    first.close().await.unwrap();
    server.wait_finished().await;

    for entry in std::fs::read_dir(client_dir.path().join("sessions")).unwrap() {
        std::fs::write(entry.unwrap().path(), b"not a sealed record").unwrap();
    }
    let sessions = dialer.session_manager().await.unwrap();
    assert!(sessions.load(server.key.as_bytes()).is_err());

    let (fresh, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(!was_resumed);
    assert_ne!(fresh.session_id(), old_id);
    assert_eq!(round_trip(&fresh, b"fresh").await, b"fresh");

    let stored = sessions.load(server.key.as_bytes()).unwrap().unwrap();
    assert_eq!(stored.session_id, fresh.session_id());
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_resumption_secret_dials_fresh() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let old_id = first.session_id().to_string();
    first.close().await.unwrap();
    server.wait_finished().await;

    let sessions = dialer.session_manager().await.unwrap();
    let mut state = sessions.load(server.key.as_bytes()).unwrap().unwrap();
    state.shared_secret = vec![0xaa; 32];
    sessions.save(&state).unwrap();
    assert!(sessions.can_resume(server.key.as_bytes()).unwrap());

    let (fresh, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(!was_resumed);
    assert_ne!(fresh.session_id(), old_id);
    assert_eq!(round_trip(&fresh, b"fresh").await, b"fresh");

    // The stale record was replaced by the new session.
    let stored = sessions.load(server.key.as_bytes()).unwrap().unwrap();
    assert_eq!(stored.session_id, fresh.session_id());
    fresh.close().await.unwrap();
}

#[tokio::test]
async fn test_tampered_frame_closes_transport() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let armed = Arc::new(AtomicBool::new(false));
    let proxy = tampering_proxy(server.addr, Arc::clone(&armed)).await;

    let dialer = Dialer::new(proxy).with_storage_config(storage_config(&client_dir));
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();

    armed.store(true, Ordering::SeqCst);
    transport
        .send(b"ping", Route::ExchangeMessages)
        .await
        .unwrap();
    let mut buf = Vec::new();
    let err = timeout(GUARD, transport.receive(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    assert!(buf.is_empty());

    assert_eq!(transport.phase(), SessionPhase::Closed);
    assert!(matches!(
        transport.send(b"again", Route::ExchangeMessages).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_forged_reconnect_gets_no_answer() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let mut server =
        EchoServer::start(&server_dir, TransportKind::Tcp, ResumptionConfig::default()).await;
    let dialer = Dialer::new(server.addr).with_storage_config(storage_config(&client_dir));

    let first = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    let session_id = first.session_id().to_string();
    let (send, recv) = first.sequences();
    first.close().await.unwrap();
    server.wait_finished().await;

    // Someone else claims the client's key.
    let victim = Storage::open(&storage_config(&client_dir))
        .unwrap()
        .identity()
        .unwrap();
    let forger = Identity::generate(Algorithm::Ed25519);
    let request = ReconnectRequest {
        session_id: session_id.clone(),
        last_phase: SessionPhase::Established as i32,
        last_send_sequence: send,
        last_recv_sequence: recv,
        remote_public_key: victim.public_key().as_bytes().to_vec(),
        resume_challenge: vec![3; 32],
    };
    let mut conn = Connection::connect(TransportKind::Tcp, server.addr, GUARD)
        .await
        .unwrap();
    envelope::send_signed(&mut conn, &forger, Route::Reconnect, &request, 0)
        .await
        .unwrap();
    let reply = timeout(GUARD, envelope::read_envelope(&mut conn))
        .await
        .unwrap();
    assert!(reply.is_err());

    // The real session is untouched.
    let (resumed, was_resumed) = timeout(GUARD, dialer.dial_with_resume(&server.key))
        .await
        .unwrap()
        .unwrap();
    assert!(was_resumed);
    assert_eq!(resumed.session_id(), session_id);
    resumed.close().await.unwrap();
}

#[tokio::test]
async fn test_mldsa_identities_round_trip() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = Server::new("127.0.0.1:0".parse().unwrap(), echo)
        .with_storage_config(storage_config(&server_dir).with_algorithm(Algorithm::MlDsa))
        .bind()
        .await
        .unwrap();
    let key = server.public_key();
    assert_eq!(key.algorithm(), Algorithm::MlDsa);
    let addr = server.local_addr();
    let task = tokio::spawn(server.run());

    let dialer = Dialer::new(addr)
        .with_storage_config(storage_config(&client_dir).with_algorithm(Algorithm::MlDsa));
    let transport = timeout(GUARD, dialer.dial()).await.unwrap().unwrap();
    assert_eq!(transport.remote_public_key(), &key);
    assert_eq!(transport.public_key().algorithm(), Algorithm::MlDsa);

    let largest = vec![1u8; max_message_size(Algorithm::MlDsa)];
    assert_eq!(round_trip(&transport, &largest).await, largest);
    let too_big = vec![1u8; largest.len() + 1];
    assert!(matches!(
        transport.send(&too_big, Route::ExchangeMessages).await,
        Err(Error::Protocol(_))
    ));

    transport.close().await.unwrap();
    task.abort();
}
