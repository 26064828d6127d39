//! Embedded SSH server that sits on the far end of the in-process pipe.
//!
//! It authenticates with a password against an [`AuthValidator`] and only
//! opens `direct-tcpip` channels, each bridged to a freshly dialed TCP target.

mod forward;
mod handler;
mod hostkey;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use russh::{Disconnect, MethodKind, MethodSet, SshId, server};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::OnceCell,
};

use crate::ferry::{auth::AuthValidator, buffer::BufferPool, relay::CloseSignal};

pub use hostkey::{
    DEFAULT_BANNER, DEFAULT_SERVER_VERSION, HostKeyFile, TransportConfig, TransportConfigProvider,
};

use handler::TunnelHandler;

/// Invoked once per session with the authenticated username.
pub type OnAuthenticated = Box<dyn FnOnce(&str) + Send>;

pub struct EngineOptions {
    pub validator: Arc<dyn AuthValidator>,
    pub transport: Arc<dyn TransportConfigProvider>,
    pub pool: BufferPool,
    pub dial_timeout: Duration,
}

struct Transport {
    config: Arc<server::Config>,
    banner: String,
}

pub struct Engine {
    validator: Arc<dyn AuthValidator>,
    provider: Arc<dyn TransportConfigProvider>,
    pool: BufferPool,
    dial_timeout: Duration,
    transport: OnceCell<Arc<Transport>>,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Self {
        Self {
            validator: opts.validator,
            provider: opts.transport,
            pool: opts.pool,
            dial_timeout: opts.dial_timeout,
            transport: OnceCell::new(),
        }
    }

    /// Builds the transport configuration now instead of on the first session.
    pub async fn warm(&self) -> anyhow::Result<()> {
        self.transport().await.map(|_| ())
    }

    async fn transport(&self) -> anyhow::Result<Arc<Transport>> {
        let t = self
            .transport
            .get_or_try_init(|| async {
                let provider = self.provider.clone();
                let cfg = tokio::task::spawn_blocking(move || provider.build())
                    .await
                    .context("engine: transport build task")??;
                Ok::<_, anyhow::Error>(Arc::new(build_transport(cfg)))
            })
            .await?;
        Ok(t.clone())
    }

    /// Runs an SSH server session over `stream` until the client disconnects
    /// or `close` trips.
    pub async fn serve<S>(
        &self,
        stream: S,
        sid: &str,
        close: CloseSignal,
        on_authenticated: OnAuthenticated,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let transport = self.transport().await?;
        let handler = TunnelHandler {
            sid: sid.to_string(),
            validator: self.validator.clone(),
            banner: transport.banner.clone(),
            on_authenticated: Some(on_authenticated),
            user: None,
            pool: self.pool.clone(),
            dial_timeout: self.dial_timeout,
            close: close.clone(),
        };

        let mut running = server::run_stream(transport.config.clone(), stream, handler)
            .await
            .context("engine: handshake")?;

        tokio::select! {
            res = &mut running => return res.context("engine: session"),
            _ = close.closed() => {}
        }

        // The session task keeps running handler callbacks until it sees the
        // disconnect, so wait for it rather than detaching it.
        tracing::debug!(sid=%sid, "engine: session closed locally");
        let _ = running
            .handle()
            .disconnect(Disconnect::ByApplication, String::new(), "en".to_string())
            .await;
        if let Err(err) = running.await {
            tracing::debug!(sid=%sid, err=%err, "engine: session ended after close");
        }
        Ok(())
    }
}

fn build_transport(cfg: TransportConfig) -> Transport {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);

    let config = server::Config {
        server_id: SshId::Standard(cfg.server_version),
        methods,
        auth_rejection_time: cfg.auth_rejection_time,
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![cfg.host_key],
        nodelay: true,
        ..Default::default()
    };

    Transport {
        config: Arc::new(config),
        banner: cfg.banner,
    }
}
