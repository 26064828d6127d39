use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::ferry::{
    buffer::BufferPool,
    config,
    engine::{Engine, EngineOptions},
    listener, logging,
    registry::ConnectionRegistry,
    session::SessionContext,
    tls::{self, CertificateProvider, SelfSignedCertificates},
    users::UserDb,
};

pub const DEFAULT_USER_ENV: &str = "FERRY_DEFAULT_USER";
pub const DEFAULT_PASSWORD_ENV: &str = "FERRY_DEFAULT_PASSWORD";

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        listen_host = %cfg.listen_host,
        tcp_port = cfg.tcp_port,
        tls_port = cfg.tls_port,
        users = %cfg.users.db_file.display(),
        "ferry: starting"
    );

    let users = Arc::new(
        UserDb::open(&cfg.users.db_file)
            .with_context(|| format!("users: open {}", cfg.users.db_file.display()))?,
    );
    apply_default_user(&users);
    if users.list_users().is_empty() {
        tracing::warn!(path = %users.path().display(), "users: no accounts; every login will be rejected");
    }

    let pool = BufferPool::new(cfg.buffer_pool_config());
    let registry = Arc::new(ConnectionRegistry::new());

    let engine = Arc::new(Engine::new(EngineOptions {
        validator: users.clone(),
        transport: Arc::new(cfg.host_key()),
        pool: pool.clone(),
        dial_timeout: cfg.timeouts.dial,
    }));
    engine.warm().await.context("engine: build transport")?;

    let ctx = Arc::new(SessionContext {
        registrar: registry.clone(),
        engine,
        pool,
        max_header_bytes: cfg.max_header_bytes,
        header_timeout: cfg.timeouts.header_read,
        upgrade: cfg.upgrade_policy(),
    });

    let acceptor = if cfg.tls_port != 0 {
        let generated = SelfSignedCertificates::default()
            .ensure(&cfg.tls.cert_file, &cfg.tls.key_file)?;
        if generated {
            tracing::info!(
                cert = %cfg.tls.cert_file.display(),
                key = %cfg.tls.key_file.display(),
                "tls: generated self-signed certificate"
            );
        }
        Some(tls::load_acceptor(&cfg.tls.cert_file, &cfg.tls.key_file)?)
    } else {
        None
    };

    // Bind everything before serving anything so a port conflict is fatal at startup.
    let mut bound = Vec::new();
    if cfg.tcp_port != 0 {
        bound.push((listener::bind(&cfg.listen_host, cfg.tcp_port).await?, None));
    }
    if let Some(acceptor) = acceptor {
        bound.push((
            listener::bind(&cfg.listen_host, cfg.tls_port).await?,
            Some(acceptor),
        ));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for (ln, acceptor) in bound {
        let ctx = ctx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { listener::serve(ln, acceptor, ctx, shutdown).await });
    }

    let result = supervise(&mut tasks, shutdown_signal()).await;
    let _ = shutdown_tx.send(true);

    for s in registry.snapshot() {
        tracing::info!(sid = %s.id, client = %s.client, user = %s.user, "shutdown: closing session");
    }
    registry.shutdown().await;

    // Listeners only need to notice the flag; cap it in case one hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(cfg.timeouts.shutdown_grace, drain)
        .await
        .is_err()
    {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!(
        idle_buffers = ctx.pool.available(),
        leased_buffers = ctx.pool.outstanding(),
        "ferry: stopped"
    );
    result
}

/// Waits for `signal` while listeners run. A listener that fails only ends
/// its own loop; the others keep serving. Returns early, with the last
/// failure, once every listener has ended.
async fn supervise<F>(tasks: &mut JoinSet<anyhow::Result<()>>, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(signal);
    let mut last_err = None;
    loop {
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("shutdown: signal");
                return Ok(());
            }
            res = tasks.join_next() => match res {
                None => {
                    tracing::error!(failed = last_err.is_some(), "shutdown: no listeners left");
                    return last_err.map_or(Ok(()), Err);
                }
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    tracing::error!(err = %format!("{err:#}"), remaining = tasks.len(), "listener: stopped on error");
                    last_err = Some(err);
                }
                Some(Err(join_err)) => {
                    tracing::error!(err = %join_err, remaining = tasks.len(), "listener: task failed");
                    last_err = Some(join_err.into());
                }
            },
        }
    }
}

fn apply_default_user(users: &UserDb) {
    let (Ok(name), Ok(password)) = (
        std::env::var(DEFAULT_USER_ENV),
        std::env::var(DEFAULT_PASSWORD_ENV),
    ) else {
        return;
    };
    if name.trim().is_empty() {
        return;
    }
    match users.ensure_user(&name, &password) {
        Ok(true) => tracing::info!(user = %name.trim(), "users: created default user"),
        Ok(false) => {}
        Err(err) => tracing::warn!(user = %name.trim(), err = %err, "users: default user not created"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
