use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use dashmap::DashMap;

use crate::detour::relay::{
    codec::Codec,
    remote::{self, Dialer, RemoteBridge, RemoteOptions, TcpDialer},
    tracker::SessionSnapshot,
    transport::{TransportConn, transport_by_name},
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub remote: String,
    pub uptime_ms: u64,
    pub sessions: Vec<SessionSnapshot>,
}

struct ConnEntry {
    remote: String,
    started: Instant,
    bridge: Arc<RemoteBridge>,
}

/// Live transport connections accepted by the server, for the admin surface.
pub struct Connections {
    id_seq: AtomicU64,
    conns: DashMap<String, ConnEntry>,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("len", &self.conns.len())
            .finish_non_exhaustive()
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

impl Connections {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            conns: DashMap::new(),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("c-{n}")
    }

    fn register(&self, id: String, remote: String, bridge: Arc<RemoteBridge>) {
        self.conns.insert(
            id,
            ConnEntry {
                remote,
                started: Instant::now(),
                bridge,
            },
        );
    }

    fn unregister(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn active_sessions(&self) -> usize {
        self.conns.iter().map(|e| e.bridge.tracker().len()).sum()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut out: Vec<ConnectionSnapshot> = self
            .conns
            .iter()
            .map(|e| ConnectionSnapshot {
                id: e.key().clone(),
                remote: e.remote.clone(),
                uptime_ms: e.started.elapsed().as_millis() as u64,
                sessions: e.bridge.tracker().snapshot(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub secret: String,
    pub remote: RemoteOptions,
}

/// Accepts transport connections and runs a remote bridge on each one.
pub struct Server {
    opts: ServerOptions,
    codec: Codec,
    dialer: Arc<dyn Dialer>,
    conns: Arc<Connections>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.listen_addr.trim().is_empty() {
            anyhow::bail!("relay: server listen address is required");
        }
        if opts.secret.is_empty() {
            anyhow::bail!("relay: server password is required");
        }
        let codec = Codec::new(&opts.secret);
        Ok(Self {
            opts,
            codec,
            dialer: Arc::new(TcpDialer),
            conns: Arc::new(Connections::new()),
        })
    }

    pub fn connections(&self) -> Arc<Connections> {
        self.conns.clone()
    }

    pub async fn listen_and_serve(
        &self,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr.listen(&self.opts.listen_addr).await?;

        tracing::info!(
            addr = %self.opts.listen_addr,
            transport = %tr.name(),
            "relay: server listening"
        );

        let mut shutdown = ctx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                conn = ln.accept() => {
                    let conn = match conn {
                        Ok(c) => c,
                        Err(err) => {
                            tracing::warn!(err = %err, "relay: accept failed");
                            continue;
                        }
                    };
                    let bridge = RemoteBridge::new(self.dialer.clone(), self.opts.remote.clone());
                    let conns = self.conns.clone();
                    let codec = self.codec.clone();
                    tokio::spawn(handle_connection(conns, conn, codec, bridge));
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    conns: Arc<Connections>,
    conn: TransportConn,
    codec: Codec,
    bridge: Arc<RemoteBridge>,
) {
    let cid = conns.next_id();
    let remote = conn.remote.map(|a| a.to_string()).unwrap_or_default();
    conns.register(cid.clone(), remote.clone(), bridge.clone());
    tracing::info!(cid = %cid, client = %remote, "relay: client connected");

    match remote::serve_connection(conn.source, conn.sink, codec, bridge).await {
        Ok(()) => tracing::info!(cid = %cid, client = %remote, "relay: client disconnected"),
        Err(err) => {
            tracing::warn!(cid = %cid, client = %remote, err = %err, "relay: client connection ended with error")
        }
    }
    conns.unregister(&cid);
}
