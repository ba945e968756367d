use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::detour::net;
use crate::detour::relay::transport::{Transport, TransportConn, TransportListener, framed};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("relay: bind {addr}"))?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> anyhow::Result<TransportConn> {
        let c = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("relay: dial {addr}: timeout"))??;
        Ok(into_conn(c))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<TransportConn> {
        let (c, _) = self.ln.accept().await?;
        Ok(into_conn(c))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

fn into_conn(c: TcpStream) -> TransportConn {
    let _ = c.set_nodelay(true);
    let remote = c.peer_addr().ok();
    let (source, sink) = framed::framed(c);
    TransportConn {
        source,
        sink,
        remote,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn dial_and_accept_exchange_frames() {
        let tr = TcpTransport::new();
        let ln = tr.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { ln.accept().await.unwrap() });
        let mut client = tr.dial(&addr, Duration::from_secs(3)).await.unwrap();
        let mut server = accept.await.unwrap();

        client.sink.send(Bytes::from_static(b"ping")).await.unwrap();
        let got = server.source.recv().await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"ping"));

        client.sink.close().await;
        assert!(server.source.recv().await.unwrap().is_none());
    }
}
