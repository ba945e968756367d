use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type BoxedSource = Box<dyn FrameSource>;
pub type BoxedSink = Box<dyn FrameSink>;

/// Largest frame accepted from or written to a transport.
pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("transport closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiving half of a frame-delimited, ordered transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Sending half of a frame-delimited, ordered transport. Exactly one task may
/// own it (see [`crate::detour::relay::outbound`]).
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// One established transport connection, already split.
pub struct TransportConn {
    pub source: BoxedSource,
    pub sink: BoxedSink,
    pub remote: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConn")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, timeout: Duration) -> anyhow::Result<TransportConn>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<TransportConn>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" => Ok(n),
        _ => anyhow::bail!("relay: unknown transport {name:?} (expected tcp)"),
    }
}

pub mod framed;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<std::sync::Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(std::sync::Arc::new(tcp::TcpTransport::new())),
        _ => unreachable!(),
    }
}
