use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    time,
};

use crate::ferry::{
    buffer::BufferPool,
    engine::Engine,
    protocol::{self, HeaderError, UpgradePolicy},
    registry::{Registrar, SessionHandle},
    relay::{self, Ends, RelayStats},
};

/// Capacity of each direction of the in-process pipe to the engine.
const PIPE_CAPACITY: usize = 64 * 1024;
const ENGINE_EXIT_GRACE: Duration = Duration::from_secs(10);

const SESSION_ENDS: Ends = Ends {
    a: "client",
    b: "engine",
};

pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A plain or TLS client connection.
pub type BoxedStream = Box<dyn ClientStream>;

/// Shared, read-only collaborators of every session.
pub struct SessionContext {
    pub registrar: Arc<dyn Registrar>,
    pub engine: Arc<Engine>,
    pub pool: BufferPool,
    pub max_header_bytes: usize,
    /// Bounds the header read and the `101`/`431` response writes.
    pub header_timeout: Duration,
    pub upgrade: UpgradePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    ReadingHeader,
    Upgraded,
    Rejected,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Opened => "opened",
            SessionState::ReadingHeader => "reading_header",
            SessionState::Upgraded => "upgraded",
            SessionState::Rejected => "rejected",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    HeaderTooLarge,
    HeaderTimeout,
    ClosedEarly,
    ReadFailed,
    WriteFailed,
    NoUpgrade,
    EngineUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Rejected(Rejection),
    Relayed(RelayStats),
}

/// One accepted client connection, driven to completion by [`Session::run`].
pub struct Session {
    handle: Arc<SessionHandle>,
    client: Option<BoxedStream>,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, client: BoxedStream, peer: SocketAddr) -> Self {
        Self {
            handle: SessionHandle::new(peer.to_string()),
            client: Some(client),
            ctx,
            state: SessionState::Opened,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, next: SessionState) {
        tracing::trace!(sid=%self.handle.id(), from=%self.state, to=%next, "session: state");
        self.state = next;
    }

    pub async fn run(mut self) -> Outcome {
        self.enter(SessionState::ReadingHeader);
        let outcome = self.bridge().await;
        if let Outcome::Rejected(reason) = outcome {
            tracing::debug!(sid=%self.handle.id(), client=%self.handle.client(), reason=?reason, "session: rejected");
        }
        self.enter(SessionState::Closed);
        outcome
    }

    async fn bridge(&mut self) -> Outcome {
        let ctx = self.ctx.clone();
        let handle = self.handle.clone();
        let sid = handle.id().to_string();
        let client_addr = handle.client().to_string();

        let Some(client) = self.client.take() else {
            return Outcome::Rejected(Rejection::ClosedEarly);
        };
        let mut reader = BufReader::new(client);

        let block = match protocol::read_header_block_timeout(
            &mut reader,
            ctx.max_header_bytes,
            ctx.header_timeout,
        )
        .await
        {
            Ok(block) => block,
            Err(err) => {
                self.enter(SessionState::Rejected);
                return Outcome::Rejected(match err {
                    HeaderError::TooLarge { limit } => {
                        tracing::warn!(sid=%sid, client=%client_addr, limit, "session: header too large");
                        let mut client = reader.into_inner();
                        let _ = time::timeout(ctx.header_timeout, async {
                            client.write_all(protocol::HEADER_TOO_LARGE).await?;
                            client.shutdown().await
                        })
                        .await;
                        Rejection::HeaderTooLarge
                    }
                    HeaderError::Timeout => {
                        tracing::debug!(sid=%sid, client=%client_addr, "session: header read timed out");
                        Rejection::HeaderTimeout
                    }
                    HeaderError::Closed => Rejection::ClosedEarly,
                    HeaderError::Io(e) => {
                        tracing::debug!(sid=%sid, client=%client_addr, err=%e, "session: header read failed");
                        Rejection::ReadFailed
                    }
                });
            }
        };

        tracing::info!(
            sid=%sid,
            client=%client_addr,
            request=%block.request_line(),
            bytes=block.byte_len(),
            host=%block.value("host").unwrap_or_default(),
            real_ip=%block.value("cf-connecting-ip").unwrap_or_default(),
            "session: request"
        );

        if !ctx.upgrade.accepts(block.value("upgrade")) {
            tracing::debug!(sid=%sid, client=%client_addr, "session: no upgrade requested");
            self.enter(SessionState::Rejected);
            return Outcome::Rejected(Rejection::NoUpgrade);
        }

        if let Err(err) = ctx.engine.warm().await {
            tracing::error!(sid=%sid, err=%format!("{err:#}"), "session: engine unavailable");
            self.enter(SessionState::Rejected);
            return Outcome::Rejected(Rejection::EngineUnavailable);
        }

        let leftover = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        let written = time::timeout(
            ctx.header_timeout,
            client.write_all(protocol::SWITCHING_PROTOCOLS),
        )
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(sid=%sid, client=%client_addr, err=%err, "session: write upgrade response failed");
                self.enter(SessionState::Rejected);
                return Outcome::Rejected(Rejection::WriteFailed);
            }
            Err(_) => {
                tracing::debug!(sid=%sid, client=%client_addr, "session: write upgrade response timed out");
                self.enter(SessionState::Rejected);
                return Outcome::Rejected(Rejection::WriteFailed);
            }
        }
        self.enter(SessionState::Upgraded);

        let (mut local_end, engine_end) = tokio::io::duplex(PIPE_CAPACITY);

        let engine = ctx.engine.clone();
        let registrar = ctx.registrar.clone();
        let mut engine_task = tokio::spawn({
            let sid = sid.clone();
            let handle = handle.clone();
            let close = handle.close_signal();
            async move {
                let registered = handle.clone();
                let on_authenticated = Box::new(move |user: &str| {
                    registered.set_user(user);
                    if !registrar.add(registered.clone()) {
                        tracing::info!(sid=%registered.id(), "session: not registered, closing");
                        registered.close();
                    } else if registered.close_signal().is_closed() {
                        // Authentication finished after the tunnel was torn down.
                        tracing::debug!(sid=%registered.id(), "session: closed during authentication");
                        registrar.remove(registered.id());
                    }
                });
                if let Err(err) = engine.serve(engine_end, &sid, close, on_authenticated).await {
                    tracing::debug!(sid=%sid, err=%format!("{err:#}"), "session: engine ended");
                }
                // The client side only learns about engine exit through the pipe.
                handle.close();
            }
        });

        if !leftover.is_empty() && local_end.write_all(&leftover).await.is_err() {
            handle.close();
        }

        self.enter(SessionState::Relaying);
        let stats = relay::relay(
            &ctx.pool,
            client,
            local_end,
            handle.close_signal(),
            &sid,
            SESSION_ENDS,
        )
        .await;

        // The engine may still be inside an auth callback; removing before it
        // exits could let a late registration outlive the session.
        handle.close();
        if time::timeout(ENGINE_EXIT_GRACE, &mut engine_task).await.is_err() {
            tracing::warn!(sid=%sid, "session: engine did not exit, detaching");
            engine_task.abort();
        }

        let removed = ctx.registrar.remove(&sid);
        tracing::info!(
            sid=%sid,
            client=%client_addr,
            user=%handle.user().unwrap_or_default(),
            up=stats.forward,
            down=stats.backward,
            registered=removed,
            "session: closed"
        );
        Outcome::Relayed(stats)
    }
}
