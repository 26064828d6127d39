use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, time};
use tokio_rustls::TlsAcceptor;

use crate::ferry::{
    net,
    session::{BoxedStream, Session, SessionContext},
};

pub async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr = net::join_host_port(&net::normalize_bind_host(host), port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind tcp {addr}"))
}

/// Accepts connections until `shutdown` flips, spawning one [`Session`] per
/// connection. With `tls` set, each connection completes a TLS handshake
/// (bounded by the header timeout) before its session starts.
pub async fn serve(
    ln: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let scheme = if tls.is_some() { "tls" } else { "tcp" };
    let local = ln
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    tracing::info!(listen_addr=%local, scheme, "listener: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res.with_context(|| format!("accept on {local}"))?;
                let _ = conn.set_nodelay(true);
                let tls = tls.clone();
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client=%peer, scheme, "listener: accepted");
                    }
                    let stream: BoxedStream = match tls {
                        None => Box::new(conn),
                        Some(acceptor) => {
                            match handshake(&acceptor, conn, ctx.header_timeout).await {
                                Ok(s) => s,
                                Err(err) => {
                                    tracing::debug!(client=%peer, err=%format!("{err:#}"), "listener: tls handshake failed");
                                    return;
                                }
                            }
                        }
                    };
                    Session::new(ctx, stream, peer).run().await;
                });
            }
        }
    }

    tracing::info!(listen_addr=%local, scheme, "listener: stopped");
    Ok(())
}

async fn handshake(
    acceptor: &TlsAcceptor,
    conn: tokio::net::TcpStream,
    timeout: Duration,
) -> anyhow::Result<BoxedStream> {
    let accept = acceptor.accept(conn);
    let stream = if timeout.is_zero() {
        accept.await.context("tls accept")?
    } else {
        time::timeout(timeout, accept)
            .await
            .context("tls handshake timeout")?
            .context("tls accept")?
    };
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::PathBuf};

    use russh::client;
    use tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::TcpStream,
        task::JoinHandle,
    };

    use super::*;
    use crate::ferry::{
        buffer::BufferPool,
        engine::{
            Engine, EngineOptions, HostKeyFile,
            testing::{AcceptAnyKey, connect},
        },
        files::temp_dir,
        protocol::{self, UpgradePolicy},
        registry::ConnectionRegistry,
        tls::{self, CertificateProvider},
        users::UserDb,
    };

    struct Harness {
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<anyhow::Result<()>>,
        dir: PathBuf,
    }

    async fn start(name: &str, max_header_bytes: usize, tls: Option<TlsAcceptor>) -> Harness {
        let dir = temp_dir(name);
        let users = UserDb::open(dir.join("users.json")).unwrap();
        users.add_user("alice", "pw-alice").unwrap();
        users.add_user("mallory", "pw-mallory").unwrap();
        users.set_enabled("mallory", false).unwrap();

        let mut hostkey = HostKeyFile::new(dir.join("host_key"));
        hostkey.auth_rejection_time = Duration::from_millis(10);
        let pool = BufferPool::default();
        let engine = Arc::new(Engine::new(EngineOptions {
            validator: Arc::new(users),
            transport: Arc::new(hostkey),
            pool: pool.clone(),
            dial_timeout: Duration::from_secs(2),
        }));
        engine.warm().await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let ctx = Arc::new(SessionContext {
            registrar: registry.clone(),
            engine,
            pool,
            max_header_bytes,
            header_timeout: Duration::from_secs(5),
            upgrade: UpgradePolicy::AnyNonEmpty,
        });

        let ln = bind("127.0.0.1", 0).await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve(ln, tls, ctx, rx));
        Harness {
            addr,
            registry,
            shutdown: tx,
            task,
            dir,
        }
    }

    async fn echo_server() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn upgrade<S>(mut stream: S) -> S
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(b"GET /tunnel HTTP/1.1\r\nHost: edge.test\r\nUpgrade: tunnel\r\n\r\n")
            .await
            .unwrap();
        let mut resp = vec![0u8; protocol::SWITCHING_PROTOCOLS.len()];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, protocol::SWITCHING_PROTOCOLS);
        stream
    }

    async fn login(
        addr: SocketAddr,
        user: &str,
        password: &str,
    ) -> (client::Handle<AcceptAnyKey>, bool) {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut handle = connect(upgrade(tcp).await).await;
        let ok = handle
            .authenticate_password(user, password)
            .await
            .unwrap()
            .success();
        (handle, ok)
    }

    async fn ping(handle: &client::Handle<AcceptAnyKey>, port: u16) {
        let ch = handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 40000)
            .await
            .unwrap();
        let mut stream = ch.into_stream();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("echo reply")
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    async fn eventually(what: &str, f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held: {what}");
    }

    #[tokio::test]
    async fn authenticated_tunnel_forwards_to_target() {
        let h = start("scenario_echo", protocol::DEFAULT_MAX_HEADER_BYTES, None).await;
        let port = echo_server().await;

        let (handle, ok) = login(h.addr, "alice", "pw-alice").await;
        assert!(ok);
        eventually("session registered", || h.registry.active() == 1).await;
        assert_eq!(h.registry.snapshot()[0].user, "alice");

        ping(&handle, port).await;

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        drop(handle);
        eventually("session removed", || h.registry.active() == 0).await;

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[tokio::test]
    async fn disabled_account_never_registers() {
        let h = start("scenario_disabled", protocol::DEFAULT_MAX_HEADER_BYTES, None).await;

        let (handle, ok) = login(h.addr, "mallory", "pw-mallory").await;
        assert!(!ok);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.registry.active(), 0);
        drop(handle);

        let (_handle, ok) = login(h.addr, "alice", "wrong-password").await;
        assert!(!ok);
        assert_eq!(h.registry.active(), 0);

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[tokio::test]
    async fn oversized_header_block_gets_431_and_no_upgrade() {
        let max = 1024;
        let h = start("scenario_431", max, None).await;

        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        while raw.len() <= max {
            raw.extend_from_slice(b"X-Filler: 0123456789abcdef\r\n");
        }
        // Exactly what the server will consume, so nothing is left unread.
        raw.truncate(max + 1);

        let mut tcp = TcpStream::connect(h.addr).await.unwrap();
        tcp.write_all(&raw).await.unwrap();
        let mut resp = Vec::new();
        time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut resp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp, protocol::HEADER_TOO_LARGE);
        assert_eq!(h.registry.active(), 0);

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[tokio::test]
    async fn shutdown_closes_every_live_session() {
        let h = start("scenario_shutdown", protocol::DEFAULT_MAX_HEADER_BYTES, None).await;
        let port = echo_server().await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (handle, ok) = login(h.addr, "alice", "pw-alice").await;
            assert!(ok);
            ping(&handle, port).await;
            clients.push(handle);
        }
        eventually("all sessions registered", || h.registry.active() == 3).await;

        h.shutdown.send_replace(true);
        time::timeout(Duration::from_secs(5), h.registry.shutdown())
            .await
            .expect("registry drained");
        assert_eq!(h.registry.active(), 0);
        h.task.await.unwrap().unwrap();

        // Listener is gone too.
        assert!(TcpStream::connect(h.addr).await.is_err());
        drop(clients);
        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[tokio::test]
    async fn unreachable_target_fails_only_that_channel() {
        let h = start("scenario_unreachable", protocol::DEFAULT_MAX_HEADER_BYTES, None).await;
        let port = echo_server().await;
        let dead_port = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().port()
        };

        let (handle, ok) = login(h.addr, "alice", "pw-alice").await;
        assert!(ok);

        match handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(dead_port), "127.0.0.1", 40000)
            .await
        {
            Ok(ch) => {
                let mut stream = ch.into_stream();
                let mut buf = [0u8; 1];
                let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                    .await
                    .expect("dead channel closed");
                assert!(matches!(read, Ok(0) | Err(_)));
            }
            Err(_) => {}
        }

        ping(&handle, port).await;
        eventually("session still registered", || h.registry.active() == 1).await;

        let _ = std::fs::remove_dir_all(&h.dir);
    }

    #[tokio::test]
    async fn tls_listener_serves_the_same_upgrade() {
        let dir = temp_dir("scenario_tls_certs");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        tls::SelfSignedCertificates::default()
            .ensure(&cert, &key)
            .unwrap();
        let acceptor = tls::load_acceptor(&cert, &key).unwrap();

        let h = start("scenario_tls", protocol::DEFAULT_MAX_HEADER_BYTES, Some(acceptor)).await;
        let port = echo_server().await;

        let mut roots = rustls::RootCertStore::empty();
        for c in tls::load_certs(&cert).unwrap() {
            roots.add(c).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_cfg = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_cfg));
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let tcp = TcpStream::connect(h.addr).await.unwrap();
        let stream = connector.connect(name, tcp).await.unwrap();

        let mut handle = connect(upgrade(stream).await).await;
        assert!(
            handle
                .authenticate_password("alice", "pw-alice")
                .await
                .unwrap()
                .success()
        );
        ping(&handle, port).await;

        let _ = std::fs::remove_dir_all(&h.dir);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
