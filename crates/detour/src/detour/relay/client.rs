use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};

use crate::detour::{
    net,
    relay::{
        local::{OpenError, Target},
        pool::EndpointPool,
        socks5::{self, Reply},
    },
};

/// How local clients name their destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientProtocol {
    Socks5,
    /// Every client goes to one fixed target.
    Forward(Target),
}

impl ClientProtocol {
    pub fn parse(name: &str, forward_target: &str) -> anyhow::Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "socks5" => Ok(Self::Socks5),
            "forward" => {
                let t = forward_target.trim();
                if t.is_empty() {
                    anyhow::bail!("relay: forward mode needs a target address");
                }
                Ok(Self::Forward(Target::tcp(t)))
            }
            other => anyhow::bail!("relay: unknown client protocol {other:?} (expected socks5 or forward)"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Socks5 => "socks5",
            Self::Forward(_) => "forward",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalServerOptions {
    pub listen_addr: String,
    pub protocol: ClientProtocol,
    pub handshake_timeout: Duration,
}

/// Accepts local clients and carries each one over a relay session.
pub struct LocalServer {
    opts: LocalServerOptions,
    pool: Arc<EndpointPool>,
}

impl LocalServer {
    pub fn new(opts: LocalServerOptions, pool: Arc<EndpointPool>) -> Self {
        Self { opts, pool }
    }

    pub async fn listen_and_serve(
        &self,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (_, addr) = net::split_scheme(&self.opts.listen_addr, "tcp");
        let addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("relay: bind {addr}"))?;
        self.serve(ln, ctx).await
    }

    async fn serve(
        &self,
        ln: TcpListener,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = %ln.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            proto = %self.opts.protocol.name(),
            "relay: local listening"
        );

        let mut shutdown = ctx;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = ln.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "relay: accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let pool = self.pool.clone();
                    let opts = self.opts.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, peer, &opts, &pool).await {
                            tracing::debug!(client = %peer, err = %err, "relay: client ended");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    opts: &LocalServerOptions,
    pool: &EndpointPool,
) -> anyhow::Result<()> {
    let target = match &opts.protocol {
        ClientProtocol::Forward(t) => t.clone(),
        ClientProtocol::Socks5 => {
            let addr = tokio::time::timeout(opts.handshake_timeout, socks5::accept(&mut stream))
                .await
                .context("socks5 handshake timed out")??;
            Target::tcp(addr)
        }
    };

    let Some(bridge) = pool.pick() else {
        tracing::warn!(client = %peer, address = %target.address, "relay: no remote connected; refusing client");
        if opts.protocol == ClientProtocol::Socks5 {
            let _ = socks5::write_reply(&mut stream, Reply::GeneralFailure).await;
        }
        return Ok(());
    };

    let session = match bridge.open(target.clone()).await {
        Ok(s) => s,
        Err(err) => {
            tracing::info!(client = %peer, address = %target.address, err = %err, "relay: open failed");
            if opts.protocol == ClientProtocol::Socks5 {
                let reply = match err {
                    OpenError::Refused(_) => Reply::ConnectionRefused,
                    OpenError::Timeout => Reply::HostUnreachable,
                    OpenError::Transport => Reply::GeneralFailure,
                };
                let _ = socks5::write_reply(&mut stream, reply).await;
            }
            return Ok(());
        }
    };

    if opts.protocol == ClientProtocol::Socks5 {
        socks5::write_reply(&mut stream, Reply::Succeeded).await?;
    }
    metrics::counter!("detour_sessions_opened_total").increment(1);
    tracing::debug!(client = %peer, session = %session.id(), address = %target.address, "relay: session open");
    session.relay(Box::new(stream)).await;
    Ok(())
}
