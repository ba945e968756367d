use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
};

use crate::detour::relay::transport::BoxedStream;

/// A dialed outbound connection, split into one writer path and one reader.
///
/// Clones share the same connection. [`OutboundSocket::close`] is synchronous:
/// it wakes the reader, aborts a pending write and releases the write half.
/// The connection itself is released once the reader is dropped too.
#[derive(Clone)]
pub struct OutboundSocket {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for OutboundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSocket")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Read side of an [`OutboundSocket`], owned by exactly one puller task.
pub struct SocketReader {
    rd: ReadHalf<BoxedStream>,
    closed: watch::Receiver<bool>,
}

impl OutboundSocket {
    pub fn new(stream: BoxedStream) -> (Self, SocketReader) {
        let (rd, wr) = tokio::io::split(stream);
        let (closed_tx, closed_rx) = watch::channel(false);
        let sock = Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(Some(wr)),
                closed: closed_tx,
            }),
        };
        (
            sock,
            SocketReader {
                rd,
                closed: closed_rx,
            },
        )
    }

    /// Writes the whole buffer within `deadline`. Returns the number of bytes
    /// accepted, which is zero only for an empty buffer.
    pub async fn write(&self, buf: &[u8], deadline: Duration) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut guard = self.inner.writer.lock().await;
        let Some(wr) = guard.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        let mut closed = self.inner.closed.subscribe();
        let res = tokio::select! {
            r = tokio::time::timeout(deadline, async {
                wr.write_all(buf).await?;
                wr.flush().await
            }) => match r {
                Ok(Ok(())) => Ok(buf.len()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
            },
            _ = closed.wait_for(|c| *c) => Err(io::ErrorKind::ConnectionAborted.into()),
        };

        if res.is_err() || self.is_closed() {
            guard.take();
        }
        res
    }

    pub fn close(&self) {
        self.inner.closed.send_replace(true);
        // A writer in flight observes the signal and drops the half itself.
        if let Ok(mut guard) = self.inner.writer.try_lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same(&self, other: &OutboundSocket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SocketReader {
    /// Reads into `buf`. Returns `Ok(0)` on EOF and once the socket was closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.closed.borrow() {
            return Ok(0);
        }
        tokio::select! {
            r = self.rd.read(buf) => r,
            _ = self.closed.wait_for(|c| *c) => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_reaches_peer_and_read_sees_reply() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (sock, mut rd) = OutboundSocket::new(Box::new(a));

        let n = sock.write(b"hello", Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 5);
        let mut got = [0u8; 5];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        b.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 16];
        let n = rd.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn close_wakes_reader_and_rejects_writes() {
        let (a, _b) = tokio::io::duplex(1024);
        let (sock, mut rd) = OutboundSocket::new(Box::new(a));

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            rd.read(&mut buf).await.unwrap()
        });
        tokio::task::yield_now().await;

        sock.clone().close();
        assert_eq!(reader.await.unwrap(), 0);
        assert!(sock.is_closed());
        assert!(sock.write(b"x", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn stalled_write_hits_deadline() {
        // Peer never reads; a tiny pipe fills immediately.
        let (a, _b) = tokio::io::duplex(4);
        let (sock, _rd) = OutboundSocket::new(Box::new(a));
        let err = sock
            .write(&[0u8; 64], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn same_tracks_identity() {
        let (a, _b) = tokio::io::duplex(8);
        let (c, _d) = tokio::io::duplex(8);
        let (s1, _r1) = OutboundSocket::new(Box::new(a));
        let (s2, _r2) = OutboundSocket::new(Box::new(c));
        assert!(s1.same(&s1.clone()));
        assert!(!s1.same(&s2));
    }
}
