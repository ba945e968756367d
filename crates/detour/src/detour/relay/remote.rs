use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{net::TcpStream, time::Instant};

use crate::detour::relay::{
    codec::Codec,
    outbound::Outbound,
    protocol::{Command, MAX_PAYLOAD_BYTES, RelayMessage, SessionId},
    socket::{OutboundSocket, SocketReader},
    tracker::{self, Session, Tracker},
    transport::{BoxedSink, BoxedSource, BoxedStream, TransportError},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub buffer_size: usize,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            idle_timeout: tracker::DEFAULT_IDLE_TIMEOUT,
            housekeeping_interval: tracker::DEFAULT_HOUSEKEEPING_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Opens outbound connections on behalf of CONNECT requests.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream>;
}

pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        match network.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "tcp4" | "tcp6" => {
                let c = TcpStream::connect(address.trim()).await?;
                let _ = c.set_nodelay(true);
                Ok(Box::new(c))
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network {other:?}"),
            )),
        }
    }
}

/// Server-side half of the relay: turns relay messages into outbound sockets
/// and outbound bytes back into relay messages. One bridge serves one
/// transport connection.
pub struct RemoteBridge {
    tracker: Arc<Tracker>,
    /// Sessions still being dialed; `true` once the peer gave up on them.
    dialing: Mutex<HashMap<SessionId, bool>>,
    dialer: Arc<dyn Dialer>,
    opts: RemoteOptions,
    shut: AtomicBool,
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge")
            .field("sessions", &self.tracker.len())
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl RemoteBridge {
    pub fn new(dialer: Arc<dyn Dialer>, opts: RemoteOptions) -> Arc<Self> {
        Arc::new(Self {
            tracker: Arc::new(Tracker::new(opts.idle_timeout)),
            dialing: Mutex::new(HashMap::new()),
            dialer,
            opts,
            shut: AtomicBool::new(false),
        })
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    fn dialing(&self) -> MutexGuard<'_, HashMap<SessionId, bool>> {
        self.dialing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatches one inbound message. CONNECT is served on its own task so a
    /// slow dial never stalls the caller; DATA is written inline, which keeps
    /// a single writer per outbound socket.
    pub async fn handle(self: &Arc<Self>, msg: RelayMessage, reply: &Outbound) {
        match msg.command() {
            Command::Connect => {
                // Registered before the spawn so a following half-close sees it.
                self.dialing().insert(msg.session.clone(), false);
                let this = Arc::clone(self);
                let reply = reply.clone();
                tokio::spawn(async move { this.handle_connect(msg, reply).await });
            }
            Command::Data => self.handle_data(msg, reply).await,
            other => {
                tracing::warn!(session = %msg.session, cmd = %other, "relay: command not supported; ignoring");
            }
        }
    }

    async fn handle_connect(self: Arc<Self>, msg: RelayMessage, reply: Outbound) {
        let id = msg.session;
        let network = msg.data.network;
        let address = msg.data.address;
        tracing::info!(session = %id, network = %network, address = %address, "relay: connect");

        let dialed = tokio::time::timeout(
            self.opts.connect_timeout,
            self.dialer.dial(&network, &address),
        )
        .await;
        let abandoned = self.dialing().remove(&id).unwrap_or(false);
        let stream = match dialed {
            Ok(Ok(st)) => st,
            Ok(Err(err)) => {
                tracing::warn!(session = %id, address = %address, err = %err, "relay: connect failed");
                metrics::counter!("detour_dial_errors_total").increment(1);
                let _ = reply.send(RelayMessage::connect_err(id, err.to_string())).await;
                return;
            }
            Err(_) => {
                tracing::warn!(
                    session = %id,
                    address = %address,
                    timeout = %humantime::format_duration(self.opts.connect_timeout),
                    "relay: connect timed out"
                );
                metrics::counter!("detour_dial_errors_total").increment(1);
                let _ = reply.send(RelayMessage::connect_err(id, "dial timeout")).await;
                return;
            }
        };

        if abandoned {
            tracing::debug!(session = %id, address = %address, "relay: peer gave up while dialing; dropping connection");
            return;
        }

        let (socket, reader) = OutboundSocket::new(stream);
        self.tracker.upsert(Session {
            id: id.clone(),
            network,
            address: address.clone(),
            last_activity: Instant::now(),
            socket: socket.clone(),
            reply: reply.clone(),
        });

        // Lost the race against connection teardown.
        if self.shut.load(Ordering::SeqCst) {
            self.tracker.remove_if_current(&id, &socket);
            socket.close();
            return;
        }

        if reply.send(RelayMessage::connect_ok(id.clone())).await.is_err() {
            self.tracker.remove_if_current(&id, &socket);
            socket.close();
            return;
        }
        metrics::counter!("detour_sessions_opened_total").increment(1);

        self.pull(id, address, socket, reader, reply).await;
    }

    /// Pumps outbound socket bytes back to the peer until EOF, a read error or
    /// the socket is closed. Only an end the destination caused is signalled
    /// with a half-close; sessions the bridge closed itself end silently so
    /// later DATA for them is answered with RECONNECT.
    async fn pull(
        &self,
        id: SessionId,
        address: String,
        socket: OutboundSocket,
        mut reader: SocketReader,
        reply: Outbound,
    ) {
        tracing::debug!(session = %id, address = %address, "relay: start pulling");
        let mut buf = vec![0u8; self.opts.buffer_size.clamp(1, MAX_PAYLOAD_BYTES)];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    if !socket.is_closed() {
                        tracing::debug!(session = %id, err = %err, "relay: pull error");
                    }
                    break;
                }
            };
            self.tracker.mark_alive(&id);
            metrics::counter!("detour_bytes_downstream_total").increment(n as u64);
            let msg = RelayMessage::data(id.clone(), Bytes::copy_from_slice(&buf[..n]));
            if reply.send(msg).await.is_err() {
                break;
            }
        }

        let ended_by_destination = !socket.is_closed();
        socket.close();
        drop(reader);
        self.tracker.remove_if_current(&id, &socket);
        if ended_by_destination {
            let _ = reply.send(RelayMessage::half_close(id.clone())).await;
        }
        tracing::debug!(session = %id, address = %address, "relay: stopped pulling");
    }

    async fn handle_data(&self, msg: RelayMessage, reply: &Outbound) {
        let id = msg.session;
        let Some(session) = self.tracker.find(&id) else {
            if msg.data.payload.is_empty() {
                // Nothing to resume; a dial still in flight is dropped once it lands.
                if let Some(abandoned) = self.dialing().get_mut(&id) {
                    *abandoned = true;
                }
                tracing::debug!(session = %id, "relay: half-close for unknown session; ignoring");
                return;
            }
            tracing::debug!(session = %id, "relay: data for unknown session; asking peer to reconnect");
            metrics::counter!("detour_reconnects_total").increment(1);
            let _ = reply.send(RelayMessage::reconnect(id)).await;
            return;
        };
        self.tracker.mark_alive(&id);

        let payload = msg.data.payload;
        if payload.is_empty() {
            tracing::debug!(session = %id, "relay: peer half-closed; closing outbound");
            self.tracker.remove_if_current(&id, &session.socket);
            session.socket.close();
            return;
        }

        match session.socket.write(&payload, self.opts.io_timeout).await {
            Ok(0) => {
                self.tracker.remove_if_current(&id, &session.socket);
                session.socket.close();
            }
            Ok(n) => {
                metrics::counter!("detour_bytes_upstream_total").increment(n as u64);
            }
            Err(err) => {
                tracing::warn!(session = %id, address = %session.address, err = %err, "relay: write error");
                self.tracker.remove_if_current(&id, &session.socket);
                session.socket.close();
            }
        }
    }

    /// Tears down every session and refuses sessions still being dialed.
    pub fn shutdown(&self) -> usize {
        self.shut.store(true, Ordering::SeqCst);
        self.tracker.close_all()
    }
}

/// Serves one transport connection until the peer goes away.
///
/// Frames that fail to authenticate are dropped. On exit every session on the
/// connection is closed. A clean peer close returns `Ok(())`.
pub async fn serve_connection(
    mut source: BoxedSource,
    sink: BoxedSink,
    codec: Codec,
    bridge: Arc<RemoteBridge>,
) -> Result<(), TransportError> {
    metrics::counter!("detour_transport_connections_total").increment(1);
    let (out, writer) = Outbound::spawn(sink, codec.clone());
    let housekeeper = bridge
        .tracker()
        .spawn_housekeeper(bridge.opts.housekeeping_interval);

    let res = loop {
        let frame = match source.recv().await {
            Ok(Some(f)) => f,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        let msg = match codec.unpack(&frame) {
            Ok(m) => m,
            Err(err) => {
                if err.is_auth() {
                    metrics::counter!("detour_auth_errors_total").increment(1);
                }
                tracing::warn!(err = %err, len = frame.len(), "relay: dropping frame");
                continue;
            }
        };
        bridge.handle(msg, &out).await;
    };

    housekeeper.abort();
    let closed = bridge.shutdown();
    drop(out);
    if closed > 0 {
        tracing::debug!(sessions = closed, "relay: closed sessions on transport teardown");
    }

    // Pullers release their writer handles once their sockets wake up.
    let abort = writer.abort_handle();
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        abort.abort();
    }
    res
}
