use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
};

use crate::detour::relay::{
    codec::Codec,
    outbound::Outbound,
    protocol::{Command, MAX_PAYLOAD_BYTES, RelayMessage, SessionId},
    transport::{BoxedSource, BoxedStream, TransportError},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RECONNECTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Chunks buffered per session between the dispatch loop and the client.
const INBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("remote refused: {0}")]
    Refused(String),
    #[error("connect timed out")]
    Timeout,
    #[error("transport closed")]
    Transport,
}

/// Where a client wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub network: String,
    pub address: String,
}

impl Target {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: "tcp".into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub handshake_timeout: Duration,
    /// Bounds both queueing remote data for a client and writing it out.
    pub io_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
    pub buffer_size: usize,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            buffer_size: 32 * 1024,
        }
    }
}

enum Phase {
    Opening(oneshot::Sender<Result<(), OpenError>>),
    Established,
    Reconnecting,
}

struct Entry {
    target: Target,
    phase: Phase,
    inbound: mpsc::Sender<Bytes>,
    /// `false` while a RECONNECT handshake is in flight; pauses the client pump.
    ready: watch::Sender<bool>,
    attempts: u32,
}

/// Client-side half of the relay for one transport connection.
pub struct LocalBridge {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    out: Outbound,
    opts: LocalOptions,
    closed: AtomicBool,
}

impl std::fmt::Debug for LocalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBridge")
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// An established session, ready to be bridged to a client socket.
///
/// Dropping it ends the session; if the remote side has not closed yet it is
/// told so with a half-close.
pub struct LocalSession {
    id: SessionId,
    inbound: mpsc::Receiver<Bytes>,
    ready: watch::Receiver<bool>,
    bridge: Arc<LocalBridge>,
}

impl LocalBridge {
    pub fn new(out: Outbound, opts: LocalOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            out,
            opts,
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.out.is_closed()
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Allocates a session id, sends CONNECT and waits for the remote's answer.
    pub async fn open(self: &Arc<Self>, target: Target) -> Result<LocalSession, OpenError> {
        if self.is_closed() {
            return Err(OpenError::Transport);
        }

        let id = SessionId::random();
        let (done_tx, done_rx) = oneshot::channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let (ready_tx, ready_rx) = watch::channel(false);
        self.lock().insert(
            id.clone(),
            Entry {
                target: target.clone(),
                phase: Phase::Opening(done_tx),
                inbound: in_tx,
                ready: ready_tx,
                attempts: 0,
            },
        );

        // fail_all may have drained the map before our insert.
        if self.closed.load(Ordering::SeqCst) {
            self.lock().remove(&id);
            return Err(OpenError::Transport);
        }

        tracing::debug!(session = %id, address = %target.address, "relay: opening session");
        let connect = RelayMessage::connect(id.clone(), &target.network, &target.address);
        if self.out.send(connect).await.is_err() {
            self.lock().remove(&id);
            return Err(OpenError::Transport);
        }

        let res = match tokio::time::timeout(self.opts.handshake_timeout, done_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(OpenError::Transport),
            Err(_) => {
                // The remote may still finish dialing; make sure it lets go.
                let _ = self.out.send(RelayMessage::half_close(id.clone())).await;
                Err(OpenError::Timeout)
            }
        };

        match res {
            Ok(()) => Ok(LocalSession {
                id,
                inbound: in_rx,
                ready: ready_rx,
                bridge: Arc::clone(self),
            }),
            Err(err) => {
                self.lock().remove(&id);
                Err(err)
            }
        }
    }

    /// Routes one inbound message to the session it belongs to.
    pub async fn handle(self: &Arc<Self>, msg: RelayMessage) {
        match msg.command() {
            Command::Connect => self.on_connect_reply(msg),
            Command::Data => self.on_data(msg).await,
            Command::Reconnect => self.on_reconnect(msg),
            other => {
                tracing::warn!(session = %msg.session, cmd = %other, "relay: command not supported; ignoring");
            }
        }
    }

    fn on_connect_reply(&self, msg: RelayMessage) {
        let id = msg.session;
        let mut st = self.lock();
        let Some(entry) = st.get_mut(&id) else {
            tracing::debug!(session = %id, "relay: connect reply for unknown session");
            return;
        };

        match std::mem::replace(&mut entry.phase, Phase::Established) {
            Phase::Opening(done) => {
                if msg.data.ok {
                    entry.ready.send_replace(true);
                    let _ = done.send(Ok(()));
                } else {
                    st.remove(&id);
                    drop(st);
                    tracing::info!(session = %id, err = %msg.data.message, "relay: remote refused connect");
                    let _ = done.send(Err(OpenError::Refused(msg.data.message)));
                }
            }
            Phase::Reconnecting => {
                if msg.data.ok {
                    entry.ready.send_replace(true);
                    tracing::info!(session = %id, address = %entry.target.address, "relay: session reconnected");
                } else {
                    let address = entry.target.address.clone();
                    st.remove(&id);
                    drop(st);
                    tracing::warn!(session = %id, address = %address, err = %msg.data.message, "relay: reconnect refused; closing session");
                }
            }
            Phase::Established => {
                tracing::debug!(session = %id, "relay: duplicate connect reply");
            }
        }
    }

    async fn on_data(&self, msg: RelayMessage) {
        let id = msg.session;
        let payload = msg.data.payload;

        if payload.is_empty() {
            // Remote is done; dropping the entry ends the client side once
            // queued chunks are flushed.
            if self.lock().remove(&id).is_some() {
                tracing::debug!(session = %id, "relay: remote half-closed");
            }
            return;
        }

        // Data from the remote proves the session is healthy again.
        let tx = self.lock().get_mut(&id).map(|e| {
            e.attempts = 0;
            e.inbound.clone()
        });
        let Some(tx) = tx else {
            tracing::debug!(session = %id, "relay: data for unknown session; dropping");
            return;
        };
        metrics::counter!("detour_bytes_downstream_total").increment(payload.len() as u64);
        // A client that stops reading must not hold up the other sessions.
        if tokio::time::timeout(self.opts.io_timeout, tx.send(payload))
            .await
            .is_err()
        {
            tracing::warn!(
                session = %id,
                timeout = %humantime::format_duration(self.opts.io_timeout),
                "relay: client not draining; closing session"
            );
            self.release(&id);
        }
    }

    fn on_reconnect(self: &Arc<Self>, msg: RelayMessage) {
        let id = msg.session;
        let mut st = self.lock();
        let Some(entry) = st.get_mut(&id) else {
            tracing::debug!(session = %id, "relay: reconnect for unknown session");
            return;
        };
        match entry.phase {
            Phase::Opening(_) | Phase::Reconnecting => return,
            Phase::Established => {}
        }

        entry.attempts += 1;
        if entry.attempts > self.opts.max_reconnects {
            let address = entry.target.address.clone();
            st.remove(&id);
            drop(st);
            tracing::warn!(session = %id, address = %address, "relay: reconnect budget exhausted; closing session");
            return;
        }

        entry.phase = Phase::Reconnecting;
        entry.ready.send_replace(false);
        let target = entry.target.clone();
        let attempt = entry.attempts;
        drop(st);

        metrics::counter!("detour_reconnects_total").increment(1);
        let delay = self.opts.reconnect_backoff * attempt;
        tracing::info!(
            session = %id,
            address = %target.address,
            attempt,
            delay = %humantime::format_duration(delay),
            "relay: remote lost session; reconnecting"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.lock().contains_key(&id) {
                return;
            }
            let _ = this
                .out
                .send(RelayMessage::connect(id, &target.network, &target.address))
                .await;
        });
    }

    /// Fails every session; used once the transport is gone.
    pub fn fail_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Entry> = self.lock().drain().map(|(_, e)| e).collect();
        let n = drained.len();
        for e in drained {
            if let Phase::Opening(done) = e.phase {
                let _ = done.send(Err(OpenError::Transport));
            }
        }
        n
    }

    /// Ends a session from the client side. Tells the remote unless it
    /// already ended the session itself.
    fn release(&self, id: &SessionId) {
        if self.lock().remove(id).is_none() || self.is_closed() {
            return;
        }
        let out = self.out.clone();
        let msg = RelayMessage::half_close(id.clone());
        tokio::spawn(async move {
            let _ = out.send(msg).await;
        });
    }

    /// Reads frames from the transport and dispatches them until it closes.
    pub async fn run_connection(
        self: Arc<Self>,
        mut source: BoxedSource,
        codec: Codec,
    ) -> Result<(), TransportError> {
        let res = loop {
            let frame = match source.recv().await {
                Ok(Some(f)) => f,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            match codec.unpack(&frame) {
                Ok(msg) => self.handle(msg).await,
                Err(err) => {
                    if err.is_auth() {
                        metrics::counter!("detour_auth_errors_total").increment(1);
                    }
                    tracing::warn!(err = %err, len = frame.len(), "relay: dropping frame");
                }
            }
        };

        let failed = self.fail_all();
        if failed > 0 {
            tracing::info!(sessions = failed, "relay: transport gone; sessions closed");
        }
        res
    }
}

impl LocalSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Bridges the client socket with the relay until either side ends.
    pub async fn relay(mut self, client: BoxedStream) {
        let (mut rd, mut wr) = tokio::io::split(client);
        let id = self.id.clone();
        let out = self.bridge.out.clone();
        let buffer_size = self.bridge.opts.buffer_size.clamp(1, MAX_PAYLOAD_BYTES);
        let io_timeout = self.bridge.opts.io_timeout;
        let ready = &mut self.ready;
        let inbound = &mut self.inbound;

        let upstream = async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) => return "client eof",
                    Ok(n) => n,
                    Err(_) => return "client read error",
                };
                if ready.wait_for(|r| *r).await.is_err() {
                    return "session ended";
                }
                let msg = RelayMessage::data(id.clone(), Bytes::copy_from_slice(&buf[..n]));
                if out.send(msg).await.is_err() {
                    return "transport closed";
                }
                metrics::counter!("detour_bytes_upstream_total").increment(n as u64);
            }
        };

        let downstream = async {
            while let Some(chunk) = inbound.recv().await {
                match tokio::time::timeout(io_timeout, wr.write_all(&chunk)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return "client write error",
                    Err(_) => return "client write timeout",
                }
            }
            "remote closed"
        };

        let reason = tokio::select! {
            r = upstream => r,
            r = downstream => r,
        };
        let _ = wr.shutdown().await;
        tracing::debug!(session = %self.id, reason, "relay: session ended");
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.bridge.release(&self.id);
    }
}
