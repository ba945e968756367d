use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;

use crate::detour::{
    net,
    relay::{
        codec::Codec,
        local::{LocalBridge, LocalOptions},
        outbound::Outbound,
        transport::transport_by_name,
    },
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub secret: String,
    pub dial_timeout: Duration,
    pub local: LocalOptions,
}

struct Slot {
    endpoint: String,
    transport: String,
    addr: String,
    current: ArcSwapOption<LocalBridge>,
}

/// Keeps one transport connection per remote endpoint and hands out live
/// bridges round-robin.
pub struct EndpointPool {
    slots: Vec<Arc<Slot>>,
    next: AtomicUsize,
    opts: PoolOptions,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("endpoints", &self.slots.len())
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}

impl EndpointPool {
    /// Endpoints look like `tcp://host:port`; a missing scheme means tcp.
    pub fn new(endpoints: &[String], opts: PoolOptions) -> anyhow::Result<Arc<Self>> {
        let mut slots = Vec::new();
        for ep in endpoints {
            let ep = ep.trim();
            if ep.is_empty() {
                continue;
            }
            let (scheme, addr) = net::split_scheme(ep, "tcp");
            // Fail on an unknown scheme now rather than in every retry.
            transport_by_name(scheme)?;
            slots.push(Arc::new(Slot {
                endpoint: ep.to_string(),
                transport: scheme.to_string(),
                addr: addr.to_string(),
                current: ArcSwapOption::empty(),
            }));
        }
        if slots.is_empty() {
            anyhow::bail!("relay: at least one remote endpoint is required");
        }
        if opts.secret.is_empty() {
            anyhow::bail!("relay: password is required");
        }
        Ok(Arc::new(Self {
            slots,
            next: AtomicUsize::new(0),
            opts,
        }))
    }

    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.current.load().as_ref().is_some_and(|b| !b.is_closed()))
            .count()
    }

    /// Next live bridge, starting from a rotating offset.
    pub fn pick(&self) -> Option<Arc<LocalBridge>> {
        let n = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n).find_map(|i| {
            let slot = &self.slots[(start + i) % n];
            slot.current.load_full().filter(|b| !b.is_closed())
        })
    }

    /// Runs one supervisor per endpoint until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut set = tokio::task::JoinSet::new();
        for slot in &self.slots {
            set.spawn(supervise(slot.clone(), self.opts.clone(), shutdown.clone()));
        }
        while set.join_next().await.is_some() {}
    }
}

async fn supervise(slot: Arc<Slot>, opts: PoolOptions, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let codec = Codec::new(&opts.secret);
    let mut backoff = MIN_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match run_once(&slot, &opts, &codec, shutdown.clone()).await {
            Ok(true) => return,
            Ok(false) => {
                // The connection was up for a while; start over quickly.
                backoff = MIN_BACKOFF;
                tracing::warn!(
                    remote = %slot.endpoint,
                    backoff = %humantime::format_duration(backoff),
                    "relay: disconnected; retrying"
                );
            }
            Err(err) => {
                tracing::warn!(
                    remote = %slot.endpoint,
                    err = %err,
                    backoff = %humantime::format_duration(backoff),
                    "relay: connect failed; retrying"
                );
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Returns `Ok(true)` on shutdown and `Ok(false)` when an established
/// connection dropped.
async fn run_once(
    slot: &Slot,
    opts: &PoolOptions,
    codec: &Codec,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<bool> {
    let tr = transport_by_name(&slot.transport)?;
    let conn = tr.dial(&slot.addr, opts.dial_timeout).await?;

    let (out, writer) = Outbound::spawn(conn.sink, codec.clone());
    let bridge = LocalBridge::new(out, opts.local.clone());
    slot.current.store(Some(bridge.clone()));
    tracing::info!(transport = %tr.name(), remote = %slot.endpoint, "relay: connected");

    let dispatch = bridge.clone().run_connection(conn.source, codec.clone());
    tokio::pin!(dispatch);
    let stopped = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break true;
                }
            }
            res = &mut dispatch => {
                if let Err(err) = res {
                    tracing::debug!(remote = %slot.endpoint, err = %err, "relay: transport error");
                }
                break false;
            }
        }
    };

    slot.current.store(None);
    bridge.fail_all();
    writer.abort();
    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detour::relay::{
        local::Target,
        protocol::{Command, RelayMessage},
        transport::{Transport, tcp::TcpTransport},
    };

    fn opts() -> PoolOptions {
        PoolOptions {
            secret: "pw".into(),
            dial_timeout: Duration::from_secs(1),
            local: LocalOptions::default(),
        }
    }

    #[test]
    fn new_validates_endpoints() {
        assert!(EndpointPool::new(&[], opts()).is_err());
        assert!(EndpointPool::new(&[" ".into()], opts()).is_err());
        assert!(EndpointPool::new(&["quic://h:1".into()], opts()).is_err());
        let pool = EndpointPool::new(&["tcp://127.0.0.1:1".into(), "127.0.0.1:2".into()], opts()).unwrap();
        assert_eq!(pool.slots.len(), 2);
        assert_eq!(pool.slots[1].addr, "127.0.0.1:2");
        assert!(pool.pick().is_none());
    }

    #[tokio::test]
    async fn connects_and_rotates_between_endpoints() {
        let tr = TcpTransport::new();
        let ln1 = tr.listen("127.0.0.1:0").await.unwrap();
        let ln2 = tr.listen("127.0.0.1:0").await.unwrap();
        let eps = vec![
            format!("tcp://{}", ln1.local_addr().unwrap()),
            format!("tcp://{}", ln2.local_addr().unwrap()),
        ];
        let pool = EndpointPool::new(&eps, opts()).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let running = tokio::spawn(pool.clone().run(stop_rx));

        let mut c1 = ln1.accept().await.unwrap();
        let _c2 = ln2.accept().await.unwrap();
        for _ in 0..100 {
            if pool.live() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.live(), 2);

        let a = pool.pick().unwrap();
        let b = pool.pick().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        // A session opened through the pool reaches the remote end as CONNECT.
        let codec = Codec::new("pw");
        let bridge = if Arc::ptr_eq(&a, &pool.slots[0].current.load_full().unwrap()) { a } else { b };
        let opening = tokio::spawn(async move { bridge.open(Target::tcp("example.com:80")).await });
        let frame = c1.source.recv().await.unwrap().unwrap();
        let msg = codec.unpack(&frame).unwrap();
        assert_eq!(msg.command(), Command::Connect);
        c1.sink
            .send(codec.pack(&RelayMessage::connect_ok(msg.session)).unwrap())
            .await
            .unwrap();
        let session = opening.await.unwrap().unwrap();
        drop(session);

        // Losing the first endpoint leaves only the second live.
        c1.sink.close().await;
        drop(c1);
        for _ in 0..100 {
            if pool.live() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.live(), 1);

        stop_tx.send(true).unwrap();
        running.await.unwrap();
    }
}
