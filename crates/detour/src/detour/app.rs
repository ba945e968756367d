use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::detour::{
    admin, config, logging, net,
    relay::{
        client::{ClientProtocol, LocalServer, LocalServerOptions},
        local::LocalOptions,
        pool::{EndpointPool, PoolOptions},
        remote::RemoteOptions,
        server::{Server, ServerOptions},
    },
    telemetry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Local,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Local => write!(f, "local"),
        }
    }
}

pub async fn run(
    config_path: Option<PathBuf>,
    mode: Mode,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = if resolved.source.is_explicit() {
        config::ensure_config_file(&resolved.path)?
    } else {
        false
    };

    let (mut cfg, loaded_from) = if resolved.path.is_file() {
        let cfg = config::load_config(&resolved.path)
            .with_context(|| format!("load config: {}", resolved.path.display()))?;
        (cfg, Some(resolved.path.display().to_string()))
    } else {
        (config::Config::default(), None)
    };

    match mode {
        Mode::Server => overrides.apply_server(&mut cfg),
        Mode::Local => overrides.apply_local(&mut cfg),
    }
    cfg.validate()?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    if cfg.password == config::DEFAULT_PASSWORD {
        tracing::warn!("config: using the default password; set one with -p or `password`");
    }

    tracing::info!(
        mode = %mode,
        config = %loaded_from.as_deref().unwrap_or("<defaults>"),
        "detour: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    match mode {
        Mode::Server => spawn_server(&cfg, &mut tasks, &shutdown_rx)?,
        Mode::Local => spawn_local(&cfg, &mut tasks, &shutdown_rx)?,
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so a stuck task cannot hold the process.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn spawn_server(
    cfg: &config::Config,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_rx: &tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (transport, listen_addr) = net::split_scheme(&cfg.server.listen, "tcp");
    let server = Server::new(ServerOptions {
        listen_addr: listen_addr.to_string(),
        transport: transport.to_string(),
        secret: cfg.password.clone(),
        remote: RemoteOptions {
            connect_timeout: cfg.server.connect_timeout,
            io_timeout: cfg.server.io_timeout,
            idle_timeout: cfg.server.idle_timeout,
            housekeeping_interval: cfg.server.housekeeping_interval,
            buffer_size: cfg.server.buffer_size,
        },
    })?;

    if !cfg.server.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.server.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.server.admin_addr))?;
        let prom = Arc::new(telemetry::init_prometheus()?);
        let state = admin::AdminState {
            prometheus: Some(prom),
            connections: server.connections(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, state, shutdown).await });
    }

    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    Ok(())
}

fn spawn_local(
    cfg: &config::Config,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_rx: &tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = &cfg.local;
    let protocol = ClientProtocol::parse(&local.protocol, &local.forward_target)?;

    let pool = EndpointPool::new(
        &local.remotes,
        PoolOptions {
            secret: cfg.password.clone(),
            dial_timeout: local.dial_timeout,
            local: LocalOptions {
                handshake_timeout: local.handshake_timeout,
                io_timeout: local.io_timeout,
                max_reconnects: local.max_reconnects,
                reconnect_backoff: local.reconnect_backoff,
                buffer_size: local.buffer_size,
            },
        },
    )?;

    {
        let pool = pool.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            pool.run(shutdown).await;
            Ok(())
        });
    }

    let server = LocalServer::new(
        LocalServerOptions {
            listen_addr: local.listen.clone(),
            protocol,
            handshake_timeout: local.handshake_timeout,
        },
        pool,
    );
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
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
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
